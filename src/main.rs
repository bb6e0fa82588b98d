use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dedupe_lib::{
    blocking::predicates::StaticPredicateIndex,
    config::DedupeConfig,
    error::DedupeError,
    matching::classifier::ClassifierRegistry,
    pipeline::{run_pipeline, PipelineOptions},
    utils::{
        db_connect::connect,
        env::{load_env, load_env_from},
        model_hash::model_definition_hash,
        progress_config::ProgressConfig,
        run_context::RunContext,
        staging::discard_all_staging,
    },
};
use log::{error, info, warn};

/// Blocked record linkage and exact-match merging over a PostgreSQL table.
#[derive(Parser, Debug)]
#[command(name = "pgdedupe", version, about)]
struct Args {
    /// JSON or YAML run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Env file with POSTGRES_* settings (defaults to .env if present)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Reuse the existing entries_unique table
    #[arg(long)]
    skip_preprocess: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    info!("Starting pgdedupe run");
    match &args.env_file {
        Some(path) => load_env_from(path)?,
        None => load_env(),
    }

    // Everything that can fail without a database fails here.
    let registry = ClassifierRegistry::with_builtins();
    let config = DedupeConfig::from_file(&args.config)?;
    config.validate(&registry)?;
    config.log_config();
    let classifier = registry.build(&config.classifier, &config.hyperparameters, &config.fields)?;
    let index = StaticPredicateIndex::from_config(&config);

    let mut ctx = RunContext::new(model_definition_hash(&config)?);
    info!("Run ID: {} (model definition {})", ctx.run_id, ctx.model_hash);

    let progress = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress.enabled, progress.detailed
    );
    let multi_progress = progress.create_multi_progress();

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    let options = PipelineOptions {
        skip_preprocess: args.skip_preprocess,
    };
    let stage_handle = ctx.stage_handle();
    let outcome = tokio::select! {
        result = run_pipeline(
            &pool,
            &config,
            classifier.as_ref(),
            &index,
            &mut ctx,
            &options,
            &progress,
            multi_progress.as_ref(),
        ) => result,
        _ = tokio::signal::ctrl_c() => {
            let stage = stage_handle.get().unwrap_or("startup");
            warn!("🛑 Interrupted during stage '{}'", stage);
            Err(DedupeError::Cancelled { stage: stage.to_string() }.into())
        }
    };

    match outcome {
        Ok(()) => {
            ctx.log_summary();
            info!("🎉 Run {} complete", ctx.run_id);
            Ok(())
        }
        Err(e) => {
            let failed_stage = e
                .downcast_ref::<DedupeError>()
                .and_then(DedupeError::stage)
                .unwrap_or("startup");
            error!("❌ Run {} failed in stage '{}': {:#}", ctx.run_id, failed_stage, e);
            match discard_all_staging(&pool, &config.schema).await {
                Ok(n) => info!("Cleaned up {} staging tables", n),
                Err(cleanup) => warn!("Staging cleanup failed: {:#}", cleanup),
            }
            ctx.log_summary();
            Err(e)
        }
    }
}

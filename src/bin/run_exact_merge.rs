// src/bin/run_exact_merge.rs

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dedupe_lib::{
    clustering::db::apply_results,
    config::DedupeConfig,
    error::DedupeError,
    matching::classifier::ClassifierRegistry,
    pipeline::stage_error,
    utils::{
        db_connect::connect,
        env::{load_env, load_env_from},
        logging::{PipelineStage, StageLogger},
        model_hash::model_definition_hash,
        progress_config::ProgressConfig,
        run_context::RunContext,
        staging::discard_all_staging,
    },
};
use log::{error, warn};

#[derive(Parser, Debug)]
#[command(name = "run_exact_merge", version, about = "Re-apply exact-match merges to an existing run")]
struct Args {
    /// JSON or YAML run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Env file with POSTGRES_* settings
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match &args.env_file {
        Some(path) => load_env_from(path)?,
        None => load_env(),
    }

    let config = DedupeConfig::from_file(&args.config)?;
    config.validate(&ClassifierRegistry::with_builtins())?;
    config.log_config();

    let mut ctx = RunContext::new(model_definition_hash(&config)?);
    let progress = ProgressConfig::from_env();
    let multi_progress = progress.create_multi_progress();
    let pool = connect().await.context("Failed to connect to database")?;

    let stage = PipelineStage::ApplyResults;
    StageLogger::new(stage).log_start(&ctx.run_id);
    let started = ctx.begin_stage(stage);
    let result = tokio::select! {
        result = apply_results(&pool, &config, &mut ctx.exact_merges, &progress, multi_progress.as_ref()) => {
            result.map_err(|e| stage_error(stage, e))
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Interrupted during stage '{}'", stage.name());
            Err(DedupeError::Cancelled { stage: stage.name().to_string() }.into())
        }
    };
    ctx.end_stage(stage, started);

    if let Err(e) = &result {
        let failed_stage = e
            .downcast_ref::<DedupeError>()
            .and_then(DedupeError::stage)
            .unwrap_or(stage.name());
        error!("❌ Exact merge failed in stage '{}': {:#}", failed_stage, e);
        if let Err(cleanup) = discard_all_staging(&pool, &config.schema).await {
            warn!("Staging cleanup failed: {:#}", cleanup);
        }
    }
    ctx.log_summary();
    result
}

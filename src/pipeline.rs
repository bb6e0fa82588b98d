// src/pipeline.rs

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar};
use log::info;
use std::time::Instant;

use crate::blocking::db::create_blocking;
use crate::blocking::predicates::PredicateIndex;
use crate::clustering::db::apply_results;
use crate::config::DedupeConfig;
use crate::error::DedupeError;
use crate::matching::classifier::PairwiseClassifier;
use crate::matching::db::write_entity_map;
use crate::matching::manager::run_clustering;
use crate::preprocess::preprocess;
use crate::utils::db_connect::{get_pool_status, PgPool};
use crate::utils::get_memory_usage;
use crate::utils::logging::{PipelineStage, StageLogger};
use crate::utils::progress_config::ProgressConfig;
use crate::utils::run_context::RunContext;

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Reuse the existing `entries_unique` instead of rebuilding it.
    pub skip_preprocess: bool,
}

/// Attaches the failing stage to an error. Errors that already carry a
/// [`DedupeError`] keep it.
pub fn stage_error(stage: PipelineStage, err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<DedupeError>().is_some() {
        return err;
    }
    let message = err.root_cause().to_string();
    err.context(DedupeError::storage(stage.name(), message))
}

fn finish_stage<T>(ctx: &mut RunContext, stage: PipelineStage, started: Instant, result: Result<T>) -> Result<T> {
    ctx.end_stage(stage, started);
    result.map_err(|e| stage_error(stage, e))
}

async fn update_stage_bar(
    pb: Option<&ProgressBar>,
    stage: PipelineStage,
    pool: &PgPool,
    progress: &ProgressConfig,
) {
    let Some(pb) = pb else { return };
    let mut parts = Vec::new();
    if progress.should_show_memory() {
        parts.push(format!("Memory: {} MB", get_memory_usage().await));
    }
    if progress.should_show_db_connection_stats() {
        let (total, _, in_use) = get_pool_status(pool);
        parts.push(format!("DB: {}/{} (used/total)", in_use, total));
    }
    if parts.is_empty() {
        pb.set_message(stage.name().to_string());
    } else {
        pb.set_message(format!("{} ({})", stage.name(), parts.join(", ")));
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline<C, P>(
    pool: &PgPool,
    config: &DedupeConfig,
    classifier: &C,
    index: &P,
    ctx: &mut RunContext,
    options: &PipelineOptions,
    progress: &ProgressConfig,
    multi_progress: Option<&MultiProgress>,
) -> Result<()>
where
    C: PairwiseClassifier + ?Sized,
    P: PredicateIndex + ?Sized,
{
    let stage_bar = progress.stage_bar(multi_progress, PipelineStage::ALL.len() as u64);

    let stage = PipelineStage::Preprocess;
    update_stage_bar(stage_bar.as_ref(), stage, pool, progress).await;
    if options.skip_preprocess {
        info!("⏭️  Skipping {}, reusing {}", stage.name(), config.qualified("entries_unique"));
    } else {
        StageLogger::new(stage).log_start(&ctx.run_id);
        let started = ctx.begin_stage(stage);
        let result = preprocess(pool, config).await;
        finish_stage(ctx, stage, started, result)?;
    }
    if let Some(pb) = &stage_bar {
        pb.inc(1);
    }

    let stage = PipelineStage::CreateBlocking;
    update_stage_bar(stage_bar.as_ref(), stage, pool, progress).await;
    StageLogger::new(stage).log_start(&ctx.run_id);
    let started = ctx.begin_stage(stage);
    let result = create_blocking(pool, config, index, &mut ctx.issues, progress, multi_progress).await;
    let blocking_stats = finish_stage(ctx, stage, started, result)?;
    ctx.blocking = blocking_stats;
    if let Some(pb) = &stage_bar {
        pb.inc(1);
    }

    let stage = PipelineStage::Cluster;
    update_stage_bar(stage_bar.as_ref(), stage, pool, progress).await;
    StageLogger::new(stage).log_start(&ctx.run_id);
    let started = ctx.begin_stage(stage);
    let result = run_clustering(pool, config, classifier, &mut ctx.matching, progress, multi_progress).await;
    let clusters = finish_stage(ctx, stage, started, result)?;
    if let Some(pb) = &stage_bar {
        pb.inc(1);
    }

    let stage = PipelineStage::WriteResults;
    update_stage_bar(stage_bar.as_ref(), stage, pool, progress).await;
    StageLogger::new(stage).log_start(&ctx.run_id);
    let started = ctx.begin_stage(stage);
    let result = write_entity_map(pool, config, &clusters).await;
    finish_stage(ctx, stage, started, result)?;
    drop(clusters);
    if let Some(pb) = &stage_bar {
        pb.inc(1);
    }

    let stage = PipelineStage::ApplyResults;
    update_stage_bar(stage_bar.as_ref(), stage, pool, progress).await;
    StageLogger::new(stage).log_start(&ctx.run_id);
    let started = ctx.begin_stage(stage);
    let result = apply_results(pool, config, &mut ctx.exact_merges, progress, multi_progress).await;
    finish_stage(ctx, stage, started, result)?;
    if let Some(pb) = &stage_bar {
        pb.inc(1);
        pb.finish_with_message("Pipeline complete");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::predicates::StaticPredicateIndex;
    use crate::matching::classifier::ClassifierRegistry;
    use crate::utils::db_connect::connect;
    use crate::utils::env::load_env;
    use crate::utils::model_hash::model_definition_hash;

    #[test]
    fn test_stage_error_wraps_plain_errors() {
        let err: anyhow::Error = anyhow::anyhow!("relation \"dedupe.map\" does not exist");
        let err = stage_error(PipelineStage::ApplyResults, err.context("Failed to index map"));
        match err.downcast_ref::<DedupeError>() {
            Some(DedupeError::Storage { stage, message }) => {
                assert_eq!(stage, "apply_results");
                assert!(message.contains("does not exist"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stage_error_keeps_typed_roots() {
        let err: anyhow::Error = DedupeError::ExternalMatcher {
            classifier: "x".to_string(),
            block_id: 7,
            message: "boom".to_string(),
        }
        .into();
        let err = stage_error(PipelineStage::Cluster, err);
        assert!(matches!(
            err.downcast_ref::<DedupeError>(),
            Some(DedupeError::ExternalMatcher { block_id: 7, .. })
        ));
    }

    /// Live database tests run only with `PGDEDUPE_TEST_DATABASE` set and
    /// `POSTGRES_*` pointing at a disposable database.
    async fn live_pool() -> Option<PgPool> {
        load_env();
        if std::env::var("PGDEDUPE_TEST_DATABASE").is_err() {
            return None;
        }
        Some(connect().await.expect("test database reachable"))
    }

    fn test_schema() -> String {
        format!("pgdedupe_it_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
    }

    fn quiet() -> ProgressConfig {
        ProgressConfig {
            enabled: false,
            detailed: false,
            ..Default::default()
        }
    }

    async fn run_live(pool: &PgPool, config: &DedupeConfig) -> Result<RunContext> {
        let registry = ClassifierRegistry::with_builtins();
        config.validate(&registry)?;
        let classifier = registry.build(&config.classifier, &config.hyperparameters, &config.fields)?;
        let index = StaticPredicateIndex::from_config(config);
        let mut ctx = RunContext::new(model_definition_hash(config)?);
        run_pipeline(
            pool,
            config,
            classifier.as_ref(),
            &index,
            &mut ctx,
            &PipelineOptions::default(),
            &quiet(),
            None,
        )
        .await?;
        Ok(ctx)
    }

    async fn seed(pool: &PgPool, schema: &str, columns: &str, values: &str) {
        let conn = pool.get().await.unwrap();
        conn.batch_execute(&format!(
            "CREATE SCHEMA {s}; \
             CREATE TABLE {s}.entries (entry_id SERIAL PRIMARY KEY, {columns}); \
             INSERT INTO {s}.entries ({names}) VALUES {values}",
            s = schema,
            columns = columns,
            names = columns
                .split(',')
                .map(|c| c.split_whitespace().next().unwrap_or_default())
                .collect::<Vec<_>>()
                .join(", "),
            values = values,
        ))
        .await
        .unwrap();
    }

    async fn drop_schema(pool: &PgPool, schema: &str) {
        let conn = pool.get().await.unwrap();
        conn.batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .await
            .unwrap();
    }

    async fn dedupe_ids(pool: &PgPool, schema: &str) -> Vec<(String, Option<i32>)> {
        let conn = pool.get().await.unwrap();
        conn.query(
            format!("SELECT name, dedupe_id FROM {}.entries ORDER BY entry_id", schema).as_str(),
            &[],
        )
        .await
        .unwrap()
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect()
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_overlapping_blocks_share_one_comparison() {
        let Some(pool) = live_pool().await else { return };
        let schema = test_schema();
        seed(
            &pool,
            &schema,
            "a VARCHAR, b VARCHAR, name VARCHAR",
            "('x', 'p', 'n1'), ('x', 'y', 'n2'), ('x', 'y', 'n3'), ('z', 'y', 'n4'), ('w', 'v', 'n5')",
        )
        .await;
        let config = DedupeConfig::from_json_str(
            &serde_json::json!({
                "schema": schema,
                "table": format!("{}.entries", schema),
                "key": "entry_id",
                "fields": [
                    {"field": "a", "type": "Exact"},
                    {"field": "b", "type": "Exact"},
                    {"field": "name", "type": "Exact"}
                ],
                "blocking": [
                    {"field": "a", "predicate": {"kind": "whole_field"}},
                    {"field": "b", "predicate": {"kind": "whole_field"}}
                ],
                "classifier": "exact_agreement",
                "threshold": 0.5
            })
            .to_string(),
        )
        .unwrap();

        let result = run_live(&pool, &config).await;
        let conn = pool.get().await.unwrap();
        let blocks: Vec<(String, i32)> = conn
            .query(
                format!("SELECT block_key, block_id FROM {}.plural_key ORDER BY block_id", schema).as_str(),
                &[],
            )
            .await
            .unwrap()
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect();
        let coverage: Vec<(String, i32, Vec<i32>)> = conn
            .query(
                format!(
                    "SELECT e.name, c.block_id, c.smaller_ids FROM {s}.smaller_coverage c \
                     JOIN {s}.entries_unique e ON e._unique_id = c._unique_id \
                     ORDER BY c.block_id, e.name",
                    s = schema
                )
                .as_str(),
                &[],
            )
            .await
            .unwrap()
            .iter()
            .map(|row| (row.get(0), row.get(1), row.get(2)))
            .collect();
        drop(conn);
        let ids = dedupe_ids(&pool, &schema).await;
        drop_schema(&pool, &schema).await;

        let ctx = result.unwrap();
        assert_eq!(blocks, vec![("x:0".to_string(), 0), ("y:1".to_string(), 1)]);
        let expected: Vec<(String, i32, Vec<i32>)> = vec![
            ("n1".to_string(), 0, vec![]),
            ("n2".to_string(), 0, vec![]),
            ("n3".to_string(), 0, vec![]),
            ("n2".to_string(), 1, vec![0]),
            ("n3".to_string(), 1, vec![0]),
            ("n4".to_string(), 1, vec![]),
        ];
        assert_eq!(coverage, expected);
        // block 0 compares its 3 pairs; block 1 skips (n2, n3) and compares the 2 pairs with n4
        assert_eq!(ctx.matching.pairs_compared, 5);

        assert!(ids.iter().all(|(_, id)| id.is_some()));
        assert_eq!(ids[1].1, ids[2].1);
        let distinct: std::collections::BTreeSet<Option<i32>> = ids.iter().map(|(_, id)| *id).collect();
        assert_eq!(distinct.len(), 4);
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_sequential_exact_merges_and_failed_reapply() {
        let Some(pool) = live_pool().await else { return };
        let schema = test_schema();
        seed(
            &pool,
            &schema,
            "ssn VARCHAR, last_name VARCHAR, dob VARCHAR, name VARCHAR",
            "('123', 'smith', '1980', 'r1'), ('123', 'jones', '1975', 'r2'), \
             (NULL, 'jones', '1975', 'r3'), ('999', 'brown', '1990', 'r4'), \
             (NULL, 'white', '2000', 'r5'), (NULL, 'green', '2001', 'r6')",
        )
        .await;
        let mut json = serde_json::json!({
            "schema": schema,
            "table": format!("{}.entries", schema),
            "key": "entry_id",
            "fields": [
                {"field": "ssn", "type": "Exact", "has_missing": true},
                {"field": "last_name", "type": "String"},
                {"field": "dob", "type": "Exact"},
                {"field": "name", "type": "Exact"}
            ],
            "blocking": [{"field": "last_name", "predicate": {"kind": "whole_field"}}],
            "classifier": "exact_agreement",
            "threshold": 0.99,
            "merge_exact": [["ssn"], ["last_name", "dob"]]
        });
        let config = DedupeConfig::from_json_str(&json.to_string()).unwrap();
        let first = run_live(&pool, &config).await.map(|_| ());
        let merged = dedupe_ids(&pool, &schema).await;

        // unique-level merge succeeds, then a source column missing from the
        // table fails the source-level merge
        json["merge_exact"] = serde_json::json!([["last_name"], ["ssn", "no_such_column"]]);
        json["source_columns"] = serde_json::json!(["no_such_column"]);
        let broken = DedupeConfig::from_json_str(&json.to_string()).unwrap();
        broken.validate(&ClassifierRegistry::with_builtins()).unwrap();
        let mut merges = Vec::new();
        let failed = apply_results(&pool, &broken, &mut merges, &quiet(), None).await;

        let after = dedupe_ids(&pool, &schema).await;
        let conn = pool.get().await.unwrap();
        let tables: Vec<String> = conn
            .query(
                "SELECT tablename::text FROM pg_tables WHERE schemaname = $1 ORDER BY tablename",
                &[&schema],
            )
            .await
            .unwrap()
            .iter()
            .map(|row| row.get(0))
            .collect();
        drop(conn);
        drop_schema(&pool, &schema).await;

        first.unwrap();
        let id = |name: &str| merged.iter().find(|(n, _)| n == name).and_then(|(_, id)| *id);
        assert!(id("r1").is_some());
        assert_eq!(id("r1"), id("r2"));
        assert_eq!(id("r2"), id("r3"));
        assert_ne!(id("r4"), id("r1"));
        assert_ne!(id("r5"), id("r6"));
        assert_ne!(id("r5"), id("r1"));

        assert!(failed.is_err());
        assert_eq!(after, merged);
        assert!(tables.iter().all(|t| !t.ends_with("_staging")), "{:?}", tables);
        assert!(tables.contains(&"merged_ssn".to_string()));
        assert!(tables.contains(&"merged_last_name_dob".to_string()));
        assert!(!tables.contains(&"merged_last_name".to_string()));
    }
}

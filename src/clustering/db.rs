// src/clustering/db.rs

use anyhow::{Context, Result};
use futures::pin_mut;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info};
use postgres_types::{ToSql, Type};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::Client;

use crate::clustering::exact_matches::component_rewrites;
use crate::config::{DedupeConfig, MergeLevel};
use crate::models::stats_models::ExactMergeStats;
use crate::utils::db_connect::PgPool;
use crate::utils::logging::{PipelineStage, StageLogger};
use crate::utils::progress_config::ProgressConfig;
use crate::utils::sql::{column_list, count_rows};
use crate::utils::staging::{discard_on_error, StagedTable};

/// Longest table name that still leaves room for the staging suffix.
const MAX_MERGED_NAME_LEN: usize = 55;

/// `merged_<col>_<col>...`, or a hashed name when that would exceed the
/// PostgreSQL identifier limit.
pub fn merged_table_name(subset: &[String]) -> String {
    let name = format!("merged_{}", subset.join("_"));
    if name.len() <= MAX_MERGED_NAME_LEN {
        return name;
    }
    let digest = hex::encode(Sha256::digest(subset.join(",").as_bytes()));
    format!("merged_{}", &digest[..16])
}

/// The table an exact merge at `level` reads and rewrites. Merges run
/// against the unpublished staging copy.
fn merge_target(config: &DedupeConfig, level: MergeLevel) -> (StagedTable, &'static str) {
    match level {
        MergeLevel::Unique => (StagedTable::new(&config.schema, "map"), "canon_id"),
        MergeLevel::Source => (StagedTable::new(&config.schema, "unique_map"), "dedupe_id"),
    }
}

/// SQL returning one `(id1, id2)` edge per canonical id that shares every
/// subset value with a smaller canonical id; `id1` is the group minimum.
pub fn exact_match_edges_query(config: &DedupeConfig, subset: &[String], level: MergeLevel) -> String {
    let cols: Vec<&str> = subset.iter().map(String::as_str).collect();
    let (target, _) = merge_target(config, level);
    let grouped = match level {
        MergeLevel::Unique => format!(
            "SELECT m.canon_id, {} FROM {} m JOIN {} e ON e._unique_id = m._unique_id",
            column_list(Some("e"), &cols),
            target.qualified_staging(),
            config.qualified("entries_unique"),
        ),
        MergeLevel::Source => format!(
            "SELECT u.dedupe_id AS canon_id, {} FROM {} u JOIN {} t ON t.{key} = u.{key}",
            column_list(Some("t"), &cols),
            target.qualified_staging(),
            config.table,
            key = config.key,
        ),
    };
    let not_null = cols
        .iter()
        .map(|c| format!("{} IS NOT NULL", c))
        .collect::<Vec<_>>()
        .join(" AND ");
    let join_on = cols
        .iter()
        .map(|c| format!("g.{c} = mins.{c}", c = c))
        .collect::<Vec<_>>()
        .join(" AND ");
    let col_list = column_list(None, &cols);
    format!(
        "WITH grouped AS (SELECT * FROM ({grouped}) x WHERE {not_null}), \
         mins AS (SELECT {col_list}, MIN(canon_id) AS canon FROM grouped GROUP BY {col_list}) \
         SELECT DISTINCT mins.canon AS id1, g.canon_id AS id2 \
         FROM grouped g JOIN mins ON {join_on} \
         WHERE g.canon_id > mins.canon",
    )
}

/// Runs one exact-merge subset against the staged `map` or `unique_map`:
/// edges in SQL, components in memory, rewrites written to the staged
/// `merged` table and applied with a single UPDATE. Nothing is published.
pub async fn merge_exact(
    pool: &PgPool,
    config: &DedupeConfig,
    subset: &[String],
    level: MergeLevel,
    merged: &StagedTable,
) -> Result<ExactMergeStats> {
    let mut stats = ExactMergeStats {
        columns: subset.to_vec(),
        ..Default::default()
    };
    let conn = pool.get().await.context("Failed to get DB connection for exact merge")?;

    let query = exact_match_edges_query(config, subset, level);
    debug!("Exact-match edge query: {}", query);
    let edges: Vec<(i32, i32)> = conn
        .query(query.as_str(), &[])
        .await
        .with_context(|| format!("Failed to find exact-match edges on {:?}", subset))?
        .iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect();
    stats.edges = edges.len();

    let rewrites = component_rewrites(&edges);
    stats.components = rewrites.values().collect::<BTreeSet<_>>().len();

    merged.create(&*conn, "id1 INTEGER NOT NULL, id2 INTEGER PRIMARY KEY").await?;
    copy_rewrites(&conn, merged, &rewrites).await?;

    let (target, column) = merge_target(config, level);
    let updated = conn
        .execute(
            format!(
                "UPDATE {target} t SET {column} = mg.id1 FROM {merged} mg WHERE t.{column} = mg.id2",
                target = target.qualified_staging(),
                column = column,
                merged = merged.qualified_staging(),
            )
            .as_str(),
            &[],
        )
        .await
        .with_context(|| format!("Failed to apply exact merge on {:?}", subset))?;
    stats.ids_rewritten = updated as usize;

    info!(
        "🧲 Exact merge {:?} ({:?} level): {} edges, {} components, {} rows rewritten",
        subset, level, stats.edges, stats.components, stats.ids_rewritten
    );
    Ok(stats)
}

async fn copy_rewrites(client: &Client, target: &StagedTable, rewrites: &BTreeMap<i32, i32>) -> Result<()> {
    let sink = client
        .copy_in(&format!(
            "COPY {} (id1, id2) FROM STDIN BINARY",
            target.qualified_staging()
        ))
        .await
        .with_context(|| format!("Failed to start COPY into {}", target.qualified_staging()))?;
    let copy = BinaryCopyInWriter::new(sink, &[Type::INT4, Type::INT4]);
    pin_mut!(copy);
    for (member, representative) in rewrites {
        let values: [&(dyn ToSql + Sync); 2] = [representative, member];
        copy.as_mut()
            .write(&values)
            .await
            .context("Failed to write merged row")?;
    }
    copy.as_mut()
        .finish()
        .await
        .with_context(|| format!("Failed to finish COPY into {}", target.qualified_staging()))?;
    Ok(())
}

/// Stages `map`: every unique record with its cluster canon, unclustered
/// records mapped to themselves at score 1.0.
async fn stage_map(pool: &PgPool, config: &DedupeConfig, target: &StagedTable) -> Result<i64> {
    let conn = pool.get().await.context("Failed to get DB connection for map")?;
    let select = format!(
        "SELECT COALESCE(em.canon_id, eu._unique_id) AS canon_id, eu._unique_id, \
         COALESCE(em.cluster_score, 1.0) AS cluster_score \
         FROM {} em RIGHT JOIN {} eu ON em._unique_id = eu._unique_id",
        config.qualified("entity_map"),
        config.qualified("entries_unique"),
    );
    target.create_as(&*conn, &select).await?;
    conn.batch_execute(&format!(
        "CREATE UNIQUE INDEX ON {t} (_unique_id); CREATE INDEX ON {t} (canon_id)",
        t = target.qualified_staging()
    ))
    .await
    .context("Failed to index map")?;
    count_rows(&*conn, &target.qualified_staging()).await
}

/// Stages `unique_map` by expanding `src_ids` against the merged staged map.
async fn stage_unique_map(
    pool: &PgPool,
    config: &DedupeConfig,
    map: &StagedTable,
    target: &StagedTable,
) -> Result<i64> {
    let conn = pool.get().await.context("Failed to get DB connection for unique_map")?;
    let select = format!(
        "SELECT m.canon_id AS dedupe_id, unnest(e.src_ids) AS {} \
         FROM {} e JOIN {} m ON m._unique_id = e._unique_id",
        config.key,
        config.qualified("entries_unique"),
        map.qualified_staging(),
    );
    target.create_as(&*conn, &select).await?;
    conn.batch_execute(&format!(
        "CREATE INDEX ON {t} ({key}); CREATE INDEX ON {t} (dedupe_id)",
        t = target.qualified_staging(),
        key = config.key
    ))
    .await
    .context("Failed to index unique_map")?;
    count_rows(&*conn, &target.qualified_staging()).await
}

/// Publishes every staged output of the stage and writes both `dedupe_id`
/// columns in one transaction. `merged_*` tables left by earlier runs with
/// other subsets are dropped. Returns the number of source rows labelled.
async fn publish_results(
    pool: &PgPool,
    config: &DedupeConfig,
    map: &StagedTable,
    unique_map: &StagedTable,
    merged: &[StagedTable],
) -> Result<u64> {
    let mut conn = pool.get().await.context("Failed to get DB connection to publish results")?;
    let transaction = conn.transaction().await.context("Failed to start results transaction")?;

    let stale = transaction
        .query(
            "SELECT tablename FROM pg_tables WHERE schemaname = $1 \
             AND tablename LIKE 'merged\\_%' AND tablename NOT LIKE '%\\_staging'",
            &[&config.schema],
        )
        .await
        .context("Failed to list exact-merge tables")?;
    for row in stale {
        let name: String = row.get("tablename");
        if merged.iter().all(|m| m.name() != name) {
            debug!("Dropping exact-merge table {} from an earlier run", name);
            transaction
                .batch_execute(&format!("DROP TABLE IF EXISTS {}.{}", config.schema, name))
                .await
                .with_context(|| format!("Failed to drop {}.{}", config.schema, name))?;
        }
    }

    map.publish_in(&transaction).await?;
    unique_map.publish_in(&transaction).await?;
    for table in merged {
        table.publish_in(&transaction).await?;
    }

    let entries = config.qualified("entries_unique");
    transaction
        .batch_execute(&format!(
            "ALTER TABLE {e} ADD COLUMN IF NOT EXISTS dedupe_id INTEGER; \
             UPDATE {e} e SET dedupe_id = m.canon_id FROM {m} m WHERE m._unique_id = e._unique_id",
            e = entries,
            m = map.qualified()
        ))
        .await
        .context("Failed to set entries_unique.dedupe_id")?;

    // rows outside the preprocessing filter end up NULL
    transaction
        .batch_execute(&format!(
            "ALTER TABLE {t} ADD COLUMN IF NOT EXISTS dedupe_id INTEGER; UPDATE {t} SET dedupe_id = NULL",
            t = config.table
        ))
        .await
        .with_context(|| format!("Failed to reset {}.dedupe_id", config.table))?;
    let updated = transaction
        .execute(
            format!(
                "UPDATE {t} t SET dedupe_id = u.dedupe_id FROM {u} u WHERE t.{key} = u.{key}",
                t = config.table,
                u = unique_map.qualified(),
                key = config.key
            )
            .as_str(),
            &[],
        )
        .await
        .with_context(|| format!("Failed to set {}.dedupe_id", config.table))?;

    transaction
        .commit()
        .await
        .context("Failed to commit cluster results")?;
    info!(
        "Published {}, {} and {} exact-merge tables",
        map.qualified(),
        unique_map.qualified(),
        merged.len()
    );
    Ok(updated)
}

/// One staged `merged_<cols>` table per distinct subset, in configured order.
fn merged_tables(config: &DedupeConfig) -> Vec<(MergeLevel, &[String], StagedTable)> {
    let mut seen = BTreeSet::new();
    let mut tables = Vec::new();
    for level in [MergeLevel::Unique, MergeLevel::Source] {
        for subset in config.merge_subsets(level) {
            let name = merged_table_name(subset);
            if seen.insert(name.clone()) {
                tables.push((level, subset, StagedTable::new(&config.schema, &name)));
            }
        }
    }
    tables
}

#[allow(clippy::too_many_arguments)]
async fn stage_results(
    pool: &PgPool,
    config: &DedupeConfig,
    map: &StagedTable,
    unique_map: &StagedTable,
    merged: &[(MergeLevel, &[String], StagedTable)],
    merges: &mut Vec<ExactMergeStats>,
    logger: &StageLogger,
    spinner: Option<&ProgressBar>,
) -> Result<u64> {
    logger.log_phase("map", None);
    let mapped = stage_map(pool, config, map).await?;
    logger.log_rows(mapped as u64, "unique records mapped");

    let mut unique_map_staged = false;
    for (level, subset, table) in merged {
        if *level == MergeLevel::Source && !unique_map_staged {
            logger.log_phase("unique_map", None);
            let rows = stage_unique_map(pool, config, map, unique_map).await?;
            logger.log_rows(rows as u64, "source rows mapped");
            unique_map_staged = true;
        }
        if let Some(pb) = spinner {
            pb.set_message(format!("Exact merge on {:?}...", subset));
        }
        let phase = match level {
            MergeLevel::Unique => "exact merge",
            MergeLevel::Source => "exact merge (source level)",
        };
        logger.log_phase(phase, Some(&subset.join(", ")));
        merges.push(merge_exact(pool, config, subset, *level, table).await?);
    }
    if !unique_map_staged {
        logger.log_phase("unique_map", None);
        let rows = stage_unique_map(pool, config, map, unique_map).await?;
        logger.log_rows(rows as u64, "source rows mapped");
    }

    logger.log_phase("publish", Some(&config.table));
    let tables: Vec<StagedTable> = merged.iter().map(|(_, _, t)| t.clone()).collect();
    publish_results(pool, config, map, unique_map, &tables).await
}

/// The `apply_results` stage. All outputs are built in staging tables and
/// published together, so a failure leaves the previous run's results intact.
pub async fn apply_results(
    pool: &PgPool,
    config: &DedupeConfig,
    merges: &mut Vec<ExactMergeStats>,
    progress: &ProgressConfig,
    multi_progress: Option<&MultiProgress>,
) -> Result<()> {
    let logger = StageLogger::new(PipelineStage::ApplyResults);
    let spinner = progress.spinner(multi_progress, "Building canonical map...");

    let map = StagedTable::new(&config.schema, "map");
    let unique_map = StagedTable::new(&config.schema, "unique_map");
    let merged = merged_tables(config);

    let staged = stage_results(
        pool,
        config,
        &map,
        &unique_map,
        &merged,
        merges,
        &logger,
        spinner.as_ref(),
    )
    .await;
    let mut all: Vec<&StagedTable> = vec![&map, &unique_map];
    all.extend(merged.iter().map(|(_, _, t)| t));
    let updated = discard_on_error(pool, &all, staged).await?;

    if let Some(pb) = &spinner {
        pb.finish_with_message(format!("{} source rows labelled", updated));
    }
    logger.log_completion(&format!("{} source rows carry a dedupe_id", updated));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DedupeConfig {
        DedupeConfig::from_json_str(
            &serde_json::json!({
                "schema": "dedupe",
                "table": "dedupe.entries",
                "key": "entry_id",
                "fields": [
                    {"field": "ssn", "type": "String"},
                    {"field": "last_name", "type": "String"},
                    {"field": "dob", "type": "String"}
                ],
                "source_columns": ["address"]
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_merged_table_names() {
        let subset = vec!["last_name".to_string(), "dob".to_string()];
        assert_eq!(merged_table_name(&subset), "merged_last_name_dob");

        let long: Vec<String> = (0..10).map(|i| format!("column_number_{}", i)).collect();
        let name = merged_table_name(&long);
        assert!(name.len() <= MAX_MERGED_NAME_LEN);
        assert_eq!(name, merged_table_name(&long));
    }

    #[test]
    fn test_unique_level_edge_query() {
        let subset = vec!["last_name".to_string(), "dob".to_string()];
        let query = exact_match_edges_query(&config(), &subset, MergeLevel::Unique);
        assert!(query.contains("FROM dedupe.map_staging m JOIN dedupe.entries_unique e"));
        assert!(query.contains("last_name IS NOT NULL AND dob IS NOT NULL"));
        assert!(query.contains("g.last_name = mins.last_name AND g.dob = mins.dob"));
        assert!(query.contains("WHERE g.canon_id > mins.canon"));
    }

    #[test]
    fn test_source_level_edge_query() {
        let subset = vec!["ssn".to_string(), "address".to_string()];
        let query = exact_match_edges_query(&config(), &subset, MergeLevel::Source);
        assert!(query.contains("u.dedupe_id AS canon_id, t.ssn, t.address"));
        assert!(query.contains("FROM dedupe.unique_map_staging u JOIN dedupe.entries t ON t.entry_id = u.entry_id"));
    }

    #[test]
    fn test_merged_tables_unique_level_first_and_deduplicated() {
        let mut config = config();
        config.merge_exact = vec![
            vec!["ssn".to_string(), "address".to_string()],
            vec!["ssn".to_string()],
            vec!["last_name".to_string(), "dob".to_string()],
            vec!["ssn".to_string()],
        ];
        let tables = merged_tables(&config);
        let names: Vec<&str> = tables.iter().map(|(_, _, t)| t.name()).collect();
        assert_eq!(names, vec!["merged_ssn", "merged_last_name_dob", "merged_ssn_address"]);
        assert_eq!(tables[2].0, MergeLevel::Source);
        assert_eq!(tables[2].2.qualified_staging(), "dedupe.merged_ssn_address_staging");
    }
}

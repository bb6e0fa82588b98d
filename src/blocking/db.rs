// src/blocking/db.rs

use anyhow::{Context, Result};
use futures::pin_mut;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info};
use std::pin::Pin;
use postgres_types::{ToSql, Type};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::Client;

use crate::blocking::coverage::{block_record, coverage_for_record, MAX_BLOCK_KEY_LEN};
use crate::blocking::predicates::PredicateIndex;
use crate::config::DedupeConfig;
use crate::models::stats_models::BlockingStats;
use crate::models::DataIssueCounts;
use crate::utils::db_connect::PgPool;
use crate::utils::grouping::ConsecutiveGrouper;
use crate::utils::logging::{PipelineStage, StageLogger};
use crate::utils::progress_config::ProgressConfig;
use crate::utils::sql::{count_rows, record_from_row, text_select_list, FETCH_SIZE};
use crate::utils::staging::{discard_on_error, StagedTable};

/// Runs the whole coverage build. Data issues are added to `issues`.
pub async fn create_blocking<P: PredicateIndex + ?Sized>(
    pool: &PgPool,
    config: &DedupeConfig,
    index: &P,
    issues: &mut DataIssueCounts,
    progress: &ProgressConfig,
    multi_progress: Option<&MultiProgress>,
) -> Result<BlockingStats> {
    let logger = StageLogger::new(PipelineStage::CreateBlocking);
    let mut stats = BlockingStats::default();

    logger.log_phase("blocking_map", Some(index.name()));
    let spinner = progress.spinner(multi_progress, "Writing blocking_map...");
    let blocking_map = StagedTable::new(&config.schema, "blocking_map");
    let written = build_blocking_map(pool, config, index, &blocking_map, issues, spinner.as_ref()).await;
    let (scanned, keys) = discard_on_error(pool, &[&blocking_map], written).await?;
    stats.records_scanned = scanned;
    stats.block_keys_written = keys;
    if let Some(pb) = &spinner {
        pb.finish_with_message(format!("blocking_map: {} keys from {} records", keys, scanned));
    }
    logger.log_data_issues(issues);

    logger.log_phase("plural_key", None);
    let plural_key = StagedTable::new(&config.schema, "plural_key");
    let built = build_plural_key(pool, config, &plural_key).await;
    stats.plural_blocks = discard_on_error(pool, &[&plural_key], built).await?;
    logger.log_rows(stats.plural_blocks as u64, "blocks with two or more records");

    logger.log_phase("plural_block", None);
    let plural_block = StagedTable::new(&config.schema, "plural_block");
    let built = build_plural_block(pool, config, &plural_block).await;
    stats.memberships = discard_on_error(pool, &[&plural_block], built).await?;
    logger.log_rows(stats.memberships as u64, "block memberships");

    logger.log_phase("covered_blocks", None);
    let covered_blocks = StagedTable::new(&config.schema, "covered_blocks");
    let built = build_covered_blocks(pool, config, &covered_blocks).await;
    discard_on_error(pool, &[&covered_blocks], built).await?;

    logger.log_phase("smaller_coverage", None);
    let spinner = progress.spinner(multi_progress, "Writing smaller_coverage...");
    let smaller_coverage = StagedTable::new(&config.schema, "smaller_coverage");
    let built = build_smaller_coverage(pool, config, &smaller_coverage, spinner.as_ref()).await;
    stats.coverage_entries = discard_on_error(pool, &[&smaller_coverage], built).await?;
    if let Some(pb) = &spinner {
        pb.finish_with_message(format!("smaller_coverage: {} entries", stats.coverage_entries));
    }

    logger.log_completion(&format!(
        "{} records, {} keys, {} plural blocks, {} coverage entries",
        stats.records_scanned, stats.block_keys_written, stats.plural_blocks, stats.coverage_entries
    ));
    Ok(stats)
}

async fn build_blocking_map<P: PredicateIndex + ?Sized>(
    pool: &PgPool,
    config: &DedupeConfig,
    index: &P,
    target: &StagedTable,
    issues: &mut DataIssueCounts,
    spinner: Option<&ProgressBar>,
) -> Result<(usize, usize)> {
    let mut writer = pool.get().await.context("Failed to get DB connection for blocking_map")?;
    let mut reader = pool.get().await.context("Failed to get DB reader for entries_unique")?;

    target
        .create(
            &*writer,
            &format!("block_key VARCHAR({}), _unique_id INTEGER", MAX_BLOCK_KEY_LEN),
        )
        .await?;
    let counts = copy_block_keys(&mut reader, &writer, config, index, target, issues, spinner).await?;
    target.publish(&mut writer).await?;
    writer
        .batch_execute(&format!(
            "CREATE INDEX ON {} (block_key, _unique_id)",
            target.qualified()
        ))
        .await
        .context("Failed to index blocking_map")?;
    Ok(counts)
}

/// Streams `entries_unique` through the predicate index into the staging
/// table. Returns `(records scanned, keys written)`.
async fn copy_block_keys<P: PredicateIndex + ?Sized>(
    reader: &mut Client,
    writer: &Client,
    config: &DedupeConfig,
    index: &P,
    target: &StagedTable,
    issues: &mut DataIssueCounts,
    spinner: Option<&ProgressBar>,
) -> Result<(usize, usize)> {
    let sink = writer
        .copy_in(&format!(
            "COPY {} (block_key, _unique_id) FROM STDIN BINARY",
            target.qualified_staging()
        ))
        .await
        .context("Failed to start COPY into blocking_map")?;
    let copy = BinaryCopyInWriter::new(sink, &[Type::VARCHAR, Type::INT4]);
    pin_mut!(copy);

    let transaction = reader
        .build_transaction()
        .read_only(true)
        .start()
        .await
        .context("Failed to start entries_unique read transaction")?;
    let query = format!(
        "SELECT _unique_id, {} FROM {} ORDER BY _unique_id",
        text_select_list(None, &config.columns()),
        config.qualified("entries_unique")
    );
    let portal = transaction
        .bind(query.as_str(), &[])
        .await
        .context("Failed to open entries_unique portal")?;

    let field_count = config.fields.len();
    let mut scanned = 0usize;
    let mut written = 0usize;
    loop {
        let rows = transaction
            .query_portal(&portal, FETCH_SIZE)
            .await
            .context("Failed to fetch entries_unique rows")?;
        for row in &rows {
            let record = record_from_row(row, 0, 1, field_count);
            scanned += 1;
            for pair in block_record(index, &record, issues) {
                let values: [&(dyn ToSql + Sync); 2] = [&pair.block_key, &pair.record_id];
                copy.as_mut()
                    .write(&values)
                    .await
                    .context("Failed to write blocking_map row")?;
                written += 1;
            }
        }
        if let Some(pb) = spinner {
            pb.set_message(format!("blocking_map: {} records scanned, {} keys", scanned, written));
        }
        if rows.len() < FETCH_SIZE as usize {
            break;
        }
    }

    let copied = copy
        .as_mut()
        .finish()
        .await
        .context("Failed to finish COPY into blocking_map")?;
    transaction
        .commit()
        .await
        .context("Failed to close entries_unique read transaction")?;
    debug!("COPY wrote {} blocking_map rows", copied);
    Ok((scanned, written))
}

async fn build_plural_key(pool: &PgPool, config: &DedupeConfig, target: &StagedTable) -> Result<i64> {
    let mut conn = pool.get().await.context("Failed to get DB connection for plural_key")?;
    let select = format!(
        "SELECT block_key, (ROW_NUMBER() OVER (ORDER BY block_key) - 1)::INTEGER AS block_id \
         FROM (SELECT block_key FROM {} GROUP BY block_key HAVING COUNT(DISTINCT _unique_id) > 1) k",
        config.qualified("blocking_map")
    );
    target.create_as(&*conn, &select).await?;
    target.publish(&mut conn).await?;
    conn.batch_execute(&format!(
        "CREATE UNIQUE INDEX ON {t} (block_key); CREATE UNIQUE INDEX ON {t} (block_id)",
        t = target.qualified()
    ))
    .await
    .context("Failed to index plural_key")?;
    count_rows(&*conn, &target.qualified()).await
}

async fn build_plural_block(pool: &PgPool, config: &DedupeConfig, target: &StagedTable) -> Result<i64> {
    let mut conn = pool.get().await.context("Failed to get DB connection for plural_block")?;
    let select = format!(
        "SELECT DISTINCT p.block_id, b._unique_id FROM {} b JOIN {} p ON p.block_key = b.block_key",
        config.qualified("blocking_map"),
        config.qualified("plural_key")
    );
    target.create_as(&*conn, &select).await?;
    target.publish(&mut conn).await?;
    conn.batch_execute(&format!(
        "CREATE INDEX ON {} (_unique_id, block_id)",
        target.qualified()
    ))
    .await
    .context("Failed to index plural_block")?;
    count_rows(&*conn, &target.qualified()).await
}

async fn build_covered_blocks(pool: &PgPool, config: &DedupeConfig, target: &StagedTable) -> Result<()> {
    let mut conn = pool.get().await.context("Failed to get DB connection for covered_blocks")?;
    let select = format!(
        "SELECT _unique_id, array_agg(block_id ORDER BY block_id) AS sorted_ids FROM {} GROUP BY _unique_id",
        config.qualified("plural_block")
    );
    target.create_as(&*conn, &select).await?;
    target.publish(&mut conn).await?;
    conn.batch_execute(&format!("CREATE UNIQUE INDEX ON {} (_unique_id)", target.qualified()))
        .await
        .context("Failed to index covered_blocks")?;
    Ok(())
}

async fn build_smaller_coverage(
    pool: &PgPool,
    config: &DedupeConfig,
    target: &StagedTable,
    spinner: Option<&ProgressBar>,
) -> Result<usize> {
    let mut writer = pool.get().await.context("Failed to get DB connection for smaller_coverage")?;
    let mut reader = pool.get().await.context("Failed to get DB reader for plural_block")?;

    target
        .create(&*writer, "_unique_id INTEGER, block_id INTEGER, smaller_ids INTEGER[]")
        .await?;
    let written = copy_coverage(&mut reader, &writer, config, target, spinner).await?;
    target.publish(&mut writer).await?;
    writer
        .batch_execute(&format!(
            "CREATE INDEX ON {} (block_id, _unique_id)",
            target.qualified()
        ))
        .await
        .context("Failed to index smaller_coverage")?;
    info!("smaller_coverage holds {} entries", written);
    Ok(written)
}

/// Streams memberships ordered by record and writes one coverage row per
/// membership. Only one record's block ids are held at a time.
async fn copy_coverage(
    reader: &mut Client,
    writer: &Client,
    config: &DedupeConfig,
    target: &StagedTable,
    spinner: Option<&ProgressBar>,
) -> Result<usize> {
    let sink = writer
        .copy_in(&format!(
            "COPY {} (_unique_id, block_id, smaller_ids) FROM STDIN BINARY",
            target.qualified_staging()
        ))
        .await
        .context("Failed to start COPY into smaller_coverage")?;
    let copy = BinaryCopyInWriter::new(sink, &[Type::INT4, Type::INT4, Type::INT4_ARRAY]);
    pin_mut!(copy);

    let transaction = reader
        .build_transaction()
        .read_only(true)
        .start()
        .await
        .context("Failed to start plural_block read transaction")?;
    let query = format!(
        "SELECT _unique_id, block_id FROM {} ORDER BY _unique_id, block_id",
        config.qualified("plural_block")
    );
    let portal = transaction
        .bind(query.as_str(), &[])
        .await
        .context("Failed to open plural_block portal")?;

    let mut grouper: ConsecutiveGrouper<i32, i32> = ConsecutiveGrouper::new();
    let mut written = 0usize;
    loop {
        let rows = transaction
            .query_portal(&portal, FETCH_SIZE)
            .await
            .context("Failed to fetch plural_block rows")?;
        for row in &rows {
            let record_id: i32 = row.get(0);
            let block_id: i32 = row.get(1);
            if let Some((done_id, block_ids)) = grouper.push(record_id, block_id) {
                written += write_record_coverage(copy.as_mut(), done_id, block_ids).await?;
            }
        }
        if let Some(pb) = spinner {
            pb.set_message(format!("smaller_coverage: {} entries", written));
        }
        if rows.len() < FETCH_SIZE as usize {
            break;
        }
    }
    if let Some((done_id, block_ids)) = grouper.finish() {
        written += write_record_coverage(copy.as_mut(), done_id, block_ids).await?;
    }

    copy.as_mut()
        .finish()
        .await
        .context("Failed to finish COPY into smaller_coverage")?;
    transaction
        .commit()
        .await
        .context("Failed to close plural_block read transaction")?;
    Ok(written)
}

async fn write_record_coverage(
    mut copy: Pin<&mut BinaryCopyInWriter>,
    record_id: i32,
    block_ids: Vec<i32>,
) -> Result<usize> {
    let entries = coverage_for_record(record_id, block_ids);
    for entry in &entries {
        let values: [&(dyn ToSql + Sync); 3] = [&entry.record_id, &entry.block_id, &entry.smaller_ids];
        copy.as_mut()
            .write(&values)
            .await
            .context("Failed to write smaller_coverage row")?;
    }
    Ok(entries.len())
}

// src/candidate_generation/db.rs

use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::VecDeque;
use tokio_postgres::{Client, Portal, Transaction};

use crate::candidate_generation::candidate_generation::{BatchAccumulator, BatchSource, CoverageRow};
use crate::config::DedupeConfig;
use crate::models::CandidateBatch;
use crate::utils::sql::{record_from_row, text_select_list, FETCH_SIZE};

pub fn candidate_query(config: &DedupeConfig) -> String {
    format!(
        "SELECT c._unique_id, c.block_id, c.smaller_ids, {} \
         FROM {} c JOIN {} e ON e._unique_id = c._unique_id \
         ORDER BY c.block_id, c._unique_id",
        text_select_list(Some("e"), &config.columns()),
        config.qualified("smaller_coverage"),
        config.qualified("entries_unique"),
    )
}

pub struct PgCandidateStream<'a> {
    transaction: Transaction<'a>,
    portal: Portal,
    accumulator: BatchAccumulator,
    ready: VecDeque<CandidateBatch>,
    field_count: usize,
    exhausted: bool,
    rows_read: u64,
}

impl<'a> PgCandidateStream<'a> {
    pub async fn open(client: &'a mut Client, config: &DedupeConfig) -> Result<Self> {
        let transaction = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .context("Failed to start candidate stream transaction")?;
        let query = candidate_query(config);
        debug!("Candidate stream query: {}", query);
        let portal = transaction
            .bind(query.as_str(), &[])
            .await
            .context("Failed to open candidate stream portal")?;
        Ok(Self {
            transaction,
            portal,
            accumulator: BatchAccumulator::new(),
            ready: VecDeque::new(),
            field_count: config.fields.len(),
            exhausted: false,
            rows_read: 0,
        })
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Ends the read transaction once the stream has been drained.
    pub async fn close(self) -> Result<()> {
        info!("Candidate stream closed after {} rows", self.rows_read);
        self.transaction
            .commit()
            .await
            .context("Failed to close candidate stream transaction")
    }

    async fn fill(&mut self) -> Result<()> {
        let rows = self
            .transaction
            .query_portal(&self.portal, FETCH_SIZE)
            .await
            .context("Failed to fetch from candidate stream portal")?;
        if rows.len() < FETCH_SIZE as usize {
            self.exhausted = true;
        }
        self.rows_read += rows.len() as u64;
        for row in &rows {
            let coverage = CoverageRow {
                block_id: row.get(1),
                record: record_from_row(row, 0, 3, self.field_count),
                smaller_ids: row.get(2),
            };
            if let Some(batch) = self.accumulator.push(coverage) {
                self.ready.push_back(batch);
            }
        }
        if self.exhausted {
            self.ready.extend(self.accumulator.finish());
        }
        Ok(())
    }
}

impl BatchSource for PgCandidateStream<'_> {
    async fn next_batch(&mut self) -> Result<Option<CandidateBatch>> {
        loop {
            if let Some(batch) = self.ready.pop_front() {
                return Ok(Some(batch));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }
    }
}

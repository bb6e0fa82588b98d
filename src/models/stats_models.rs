// src/models/stats_models.rs

use serde::Serialize;
use std::time::Duration;

/// Per-record problems that are skipped rather than failing the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataIssueCounts {
    pub null_block_keys: usize,
    pub empty_block_keys: usize,
    pub oversized_block_keys: usize,
    pub records_without_comparable_fields: usize,
}

impl DataIssueCounts {
    pub fn total(&self) -> usize {
        self.null_block_keys
            + self.empty_block_keys
            + self.oversized_block_keys
            + self.records_without_comparable_fields
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockingStats {
    pub records_scanned: usize,
    pub block_keys_written: usize,
    pub plural_blocks: i64,
    pub memberships: i64,
    pub coverage_entries: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchingStats {
    pub batches_processed: usize,
    pub records_seen: usize,
    pub pairs_compared: usize,
    pub pairs_above_threshold: usize,
    pub clusters_found: usize,
    pub clustered_records: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExactMergeStats {
    pub columns: Vec<String>,
    pub edges: usize,
    pub components: usize,
    pub ids_rewritten: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

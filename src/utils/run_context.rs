// src/utils/run_context.rs

use chrono::{NaiveDateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use crate::models::stats_models::{BlockingStats, ExactMergeStats, MatchingStats, StageTiming};
use crate::models::DataIssueCounts;
use crate::utils::logging::PipelineStage;

/// Name of the stage currently running, shared with the cancellation handler.
#[derive(Debug, Clone, Default)]
pub struct CurrentStage(Arc<Mutex<Option<&'static str>>>);

impl CurrentStage {
    pub fn set(&self, stage: Option<&'static str>) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *guard = stage;
    }

    pub fn get(&self) -> Option<&'static str> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Serialize)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: NaiveDateTime,
    pub model_hash: String,
    pub issues: DataIssueCounts,
    pub blocking: BlockingStats,
    pub matching: MatchingStats,
    pub exact_merges: Vec<ExactMergeStats>,
    pub timings: Vec<StageTiming>,
    #[serde(skip)]
    current_stage: CurrentStage,
}

impl RunContext {
    pub fn new(model_hash: String) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now().naive_utc(),
            model_hash,
            issues: DataIssueCounts::default(),
            blocking: BlockingStats::default(),
            matching: MatchingStats::default(),
            exact_merges: Vec::new(),
            timings: Vec::new(),
            current_stage: CurrentStage::default(),
        }
    }

    /// Handle that keeps reporting the running stage after the context is
    /// moved into the pipeline future.
    pub fn stage_handle(&self) -> CurrentStage {
        self.current_stage.clone()
    }

    pub fn begin_stage(&mut self, stage: PipelineStage) -> Instant {
        self.current_stage.set(Some(stage.name()));
        Instant::now()
    }

    pub fn end_stage(&mut self, stage: PipelineStage, started: Instant) {
        self.timings.push(StageTiming {
            stage: stage.name().to_string(),
            duration: started.elapsed(),
        });
        self.current_stage.set(None);
    }

    pub fn log_summary(&self) {
        info!("📋 Run {} summary (model {})", self.run_id, self.model_hash);
        for timing in &self.timings {
            info!("   {:<16} {:.2?}", timing.stage, timing.duration);
        }
        info!(
            "   Blocking: {} records scanned, {} plural blocks, {} coverage entries",
            self.blocking.records_scanned, self.blocking.plural_blocks, self.blocking.coverage_entries
        );
        info!(
            "   Matching: {} batches, {} pairs compared, {} above threshold, {} clusters",
            self.matching.batches_processed,
            self.matching.pairs_compared,
            self.matching.pairs_above_threshold,
            self.matching.clusters_found
        );
        for merge in &self.exact_merges {
            info!(
                "   Exact merge {:?}: {} edges, {} ids rewritten",
                merge.columns, merge.edges, merge.ids_rewritten
            );
        }
        if self.issues.total() > 0 {
            warn!("   Data issues skipped: {:?}", self.issues);
        }
    }
}

// src/utils/logging.rs - stage-scoped logging helpers
use log::{info, warn};
use std::time::Instant;

use crate::models::DataIssueCounts;

/// The stages of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Preprocess,
    CreateBlocking,
    Cluster,
    WriteResults,
    ApplyResults,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::Preprocess,
        PipelineStage::CreateBlocking,
        PipelineStage::Cluster,
        PipelineStage::WriteResults,
        PipelineStage::ApplyResults,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Preprocess => "preprocess",
            PipelineStage::CreateBlocking => "create_blocking",
            PipelineStage::Cluster => "cluster",
            PipelineStage::WriteResults => "write_results",
            PipelineStage::ApplyResults => "apply_results",
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            PipelineStage::Preprocess => "🧹",
            PipelineStage::CreateBlocking => "🧱",
            PipelineStage::Cluster => "🔗",
            PipelineStage::WriteResults => "💾",
            PipelineStage::ApplyResults => "📝",
        }
    }
}

#[derive(Clone)]
pub struct StageLogger {
    stage_name: &'static str,
    stage_emoji: &'static str,
    start_time: Instant,
}

impl StageLogger {
    pub fn new(stage: PipelineStage) -> Self {
        Self {
            stage_name: stage.name(),
            stage_emoji: stage.emoji(),
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, run_id: &str) {
        info!(
            "[{}] {} 🚀 Starting {} (run ID: {})",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            self.stage_name,
            run_id
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        match details {
            Some(details) => info!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                phase,
                details,
                elapsed.as_secs_f32()
            ),
            None => info!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                phase,
                elapsed.as_secs_f32()
            ),
        }
    }

    pub fn log_rows(&self, count: u64, what: &str) {
        info!(
            "[{}] {} 📊 {} {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            count,
            what
        );
    }

    pub fn log_data_issues(&self, issues: &DataIssueCounts) {
        if issues.total() == 0 {
            return;
        }
        warn!(
            "[{}] {} ⚠️  Skipped data issues: {} null keys, {} empty keys, {} oversized keys, {} records without comparable fields",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            issues.null_block_keys,
            issues.empty_block_keys,
            issues.oversized_block_keys,
            issues.records_without_comparable_fields
        );
    }

    pub fn log_completion(&self, summary: &str) {
        info!(
            "[{}] {} ✅ Completed in {:.2?}: {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            self.start_time.elapsed(),
            summary
        );
    }
}

// src/utils/progress_config.rs

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::env;
use std::time::Duration;

/// Configuration for progress tracking throughout the pipeline
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Whether to show progress bars at all
    pub enabled: bool,
    /// Whether to show per-stage spinners under the main bar
    pub detailed: bool,
    /// Refresh rate for spinners in milliseconds
    pub refresh_rate_ms: u64,
    /// Whether to show memory usage in progress messages
    pub show_memory: bool,
    /// Whether to show database connection pool statistics
    pub show_db_connection_stats: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detailed: true,
            refresh_rate_ms: 100,
            show_memory: true,
            show_db_connection_stats: true,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ProgressConfig {
    /// Create progress configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            enabled: env_or("PROGRESS_ENABLED", true),
            detailed: env_or("PROGRESS_DETAILED", true),
            refresh_rate_ms: env_or("PROGRESS_REFRESH_RATE_MS", 100),
            show_memory: env_or("PROGRESS_SHOW_MEMORY", true),
            show_db_connection_stats: env_or("PROGRESS_SHOW_DB_CONNECTIONS", true),
        }
    }

    /// Create a MultiProgress instance if progress is enabled, None otherwise
    pub fn create_multi_progress(&self) -> Option<MultiProgress> {
        if self.enabled {
            Some(MultiProgress::new())
        } else {
            None
        }
    }

    pub fn should_show_detailed(&self) -> bool {
        self.enabled && self.detailed
    }

    pub fn should_show_memory(&self) -> bool {
        self.enabled && self.show_memory
    }

    pub fn should_show_db_connection_stats(&self) -> bool {
        self.enabled && self.show_db_connection_stats
    }

    /// Adds a ticking spinner to `mp` when detailed progress is on.
    pub fn spinner(&self, mp: Option<&MultiProgress>, message: &str) -> Option<ProgressBar> {
        let mp = mp.filter(|_| self.should_show_detailed())?;
        let pb = mp.add(ProgressBar::new_spinner());
        let style = ProgressStyle::default_spinner()
            .template("    {spinner:.blue} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(self.refresh_rate_ms));
        pb.set_message(message.to_string());
        Some(pb)
    }

    /// Main bar with one step per pipeline stage.
    pub fn stage_bar(&self, mp: Option<&MultiProgress>, stages: u64) -> Option<ProgressBar> {
        let mp = mp.filter(|_| self.enabled)?;
        let pb = mp.add(ProgressBar::new(stages));
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map(|s| s.progress_chars("█▉▊▋▌▍▎▏  "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        Some(pb)
    }
}

// src/error.rs

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DedupeError {
    /// Invalid run configuration, detected before any I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// The pairwise classifier failed on a batch. Fatal, nothing is committed.
    #[error("classifier '{classifier}' failed on block {block_id}: {message}")]
    ExternalMatcher {
        classifier: String,
        block_id: i32,
        message: String,
    },

    /// A derived table could not be written. The staging table is dropped.
    #[error("storage failure in stage '{stage}': {message}")]
    Storage { stage: String, message: String },

    /// The run was interrupted while `stage` was in progress.
    #[error("run cancelled during stage '{stage}'")]
    Cancelled { stage: String },
}

impl DedupeError {
    pub fn config(message: impl Into<String>) -> Self {
        DedupeError::Config(message.into())
    }

    pub fn storage(stage: &str, err: impl std::fmt::Display) -> Self {
        DedupeError::Storage {
            stage: stage.to_string(),
            message: err.to_string(),
        }
    }

    /// Stage name carried by the error, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            DedupeError::Config(_) => None,
            DedupeError::ExternalMatcher { .. } => Some("cluster"),
            DedupeError::Storage { stage, .. } => Some(stage),
            DedupeError::Cancelled { stage } => Some(stage),
        }
    }
}

pub mod matching;
pub mod stats_models;

pub use matching::{
    BlockingPair, CandidateBatch, CandidateRecord, CanonicalAssignment, Cluster, CoverageEntry,
    Record, ScoredPair,
};
pub use stats_models::DataIssueCounts;

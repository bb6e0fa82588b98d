// src/models/matching.rs

use serde::Serialize;
use std::collections::BTreeSet;

/// One row of `entries_unique`: a distinct combination of comparison values.
///
/// Values are positional, in the order the comparison fields are declared in
/// the run configuration, and are read from the database as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub id: i32,
    pub values: Vec<Option<String>>,
}

impl Record {
    pub fn new(id: i32, values: Vec<Option<String>>) -> Self {
        Self { id, values }
    }

    pub fn value(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    /// A record whose every comparison value is null or blank cannot be blocked
    /// or compared.
    pub fn has_comparable_fields(&self) -> bool {
        self.values
            .iter()
            .any(|v| v.as_deref().map_or(false, |s| !s.trim().is_empty()))
    }
}

/// A (block key, record id) membership emitted by the predicate index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockingPair {
    pub block_key: String,
    pub record_id: i32,
}

/// Membership of one record in one surviving block, with every block id of
/// that record that sorts before this one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CoverageEntry {
    pub record_id: i32,
    pub block_id: i32,
    pub smaller_ids: Vec<i32>,
}

/// One candidate row handed to the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub record_id: i32,
    pub record: Record,
    pub smaller_ids: BTreeSet<i32>,
}

/// Every candidate row that shares one `block_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBatch {
    pub block_id: i32,
    pub records: Vec<CandidateRecord>,
}

impl CandidateBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A compared pair with its classifier score. `id_1 < id_2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredPair {
    pub id_1: i32,
    pub id_2: i32,
    pub score: f64,
}

impl ScoredPair {
    pub fn new(a: i32, b: i32, score: f64) -> Self {
        let (id_1, id_2) = if a < b { (a, b) } else { (b, a) };
        Self { id_1, id_2, score }
    }
}

/// A resolved duplicate group. `member_ids[0] == canon_id`, and `scores` is
/// parallel to `member_ids`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub canon_id: i32,
    pub member_ids: Vec<i32>,
    pub scores: Vec<f64>,
}

/// `(record_id, canonical_id)` row of the canonical mapping.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct CanonicalAssignment {
    pub record_id: i32,
    pub canon_id: i32,
    pub cluster_score: f64,
}

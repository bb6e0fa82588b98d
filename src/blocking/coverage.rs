// src/blocking/coverage.rs

//! Redundant-free block coverage (Kolb et al.).
//!
//! For every membership of record `r` in block `b` we keep the ids of the
//! other blocks containing `r` that sort before `b`. Two records sharing a
//! block are then compared only in the first block they share: a later block
//! sees a common id in both smaller-ids sets and skips the pair.
//!
//! The PostgreSQL path (`blocking::db`) performs the key dedup, singleton
//! removal and id assignment in SQL, then streams memberships ordered by
//! record through [`coverage_for_record`]. [`build_coverage`] runs the same
//! steps in memory.

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::blocking::predicates::PredicateIndex;
use crate::models::{BlockingPair, CoverageEntry, DataIssueCounts, Record};
use crate::utils::grouping::GroupConsecutive;

/// Width of the `block_key` column.
pub const MAX_BLOCK_KEY_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyIssue {
    Null,
    Empty,
    Oversized,
}

impl KeyIssue {
    pub fn record(self, counts: &mut DataIssueCounts) {
        match self {
            KeyIssue::Null => counts.null_block_keys += 1,
            KeyIssue::Empty => counts.empty_block_keys += 1,
            KeyIssue::Oversized => counts.oversized_block_keys += 1,
        }
    }
}

pub fn sanitize_block_key(key: Option<String>) -> Result<String, KeyIssue> {
    match key {
        None => Err(KeyIssue::Null),
        Some(k) if k.trim().is_empty() => Err(KeyIssue::Empty),
        Some(k) if k.chars().count() > MAX_BLOCK_KEY_LEN => Err(KeyIssue::Oversized),
        Some(k) => Ok(k),
    }
}

/// Runs the predicate index over one record and returns its distinct, valid
/// block keys. Invalid keys and uncomparable records are counted in `issues`.
pub fn block_record<P: PredicateIndex + ?Sized>(
    index: &P,
    record: &Record,
    issues: &mut DataIssueCounts,
) -> Vec<BlockingPair> {
    if !record.has_comparable_fields() {
        debug!("Record {} has no comparable fields, skipping", record.id);
        issues.records_without_comparable_fields += 1;
        return Vec::new();
    }

    let mut keys = BTreeSet::new();
    for key in index.block_keys(record) {
        match sanitize_block_key(key) {
            Ok(k) => {
                keys.insert(k);
            }
            Err(issue) => {
                debug!("Record {}: skipping {:?} block key", record.id, issue);
                issue.record(issues);
            }
        }
    }
    keys.into_iter()
        .map(|block_key| BlockingPair {
            block_key,
            record_id: record.id,
        })
        .collect()
}

/// Prefix of `sorted_ids` strictly below `block_id`.
pub fn smaller_ids(sorted_ids: &[i32], block_id: i32) -> &[i32] {
    let end = sorted_ids.partition_point(|&b| b < block_id);
    &sorted_ids[..end]
}

/// Coverage entries for every block of one record.
pub fn coverage_for_record(record_id: i32, mut block_ids: Vec<i32>) -> Vec<CoverageEntry> {
    block_ids.sort_unstable();
    block_ids.dedup();
    block_ids
        .iter()
        .map(|&block_id| CoverageEntry {
            record_id,
            block_id,
            smaller_ids: smaller_ids(&block_ids, block_id).to_vec(),
        })
        .collect()
}

/// Result of an in-memory coverage build.
#[derive(Debug, Clone, Default)]
pub struct CoverageTable {
    /// Surviving block key -> dense block id (0-based, in key order).
    pub block_ids: BTreeMap<String, i32>,
    /// Entries ordered by `(block_id, record_id)`, the order the candidate
    /// stream expects.
    pub entries: Vec<CoverageEntry>,
    pub issues: DataIssueCounts,
}

impl CoverageTable {
    /// Sorted block ids covering `record_id`.
    pub fn blocks_of(&self, record_id: i32) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .entries
            .iter()
            .filter(|e| e.record_id == record_id)
            .map(|e| e.block_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn members_of(&self, block_id: i32) -> Vec<i32> {
        self.entries
            .iter()
            .filter(|e| e.block_id == block_id)
            .map(|e| e.record_id)
            .collect()
    }
}

/// Builds coverage from raw `(block_key, record_id)` pairs.
pub fn build_coverage<I>(pairs: I) -> CoverageTable
where
    I: IntoIterator<Item = (Option<String>, i32)>,
{
    let mut issues = DataIssueCounts::default();

    // 1. dedupe, ordered by key so that groups are contiguous
    let mut distinct: BTreeSet<(String, i32)> = BTreeSet::new();
    for (key, record_id) in pairs {
        match sanitize_block_key(key) {
            Ok(k) => {
                distinct.insert((k, record_id));
            }
            Err(issue) => issue.record(&mut issues),
        }
    }

    // 2 + 3. drop singleton blocks, number the survivors
    let mut block_ids = BTreeMap::new();
    let mut memberships: Vec<(i32, i32)> = Vec::new();
    for (key, members) in GroupConsecutive::new(distinct.into_iter(), |(k, _)| k.clone()) {
        if members.len() < 2 {
            continue;
        }
        let block_id = block_ids.len() as i32;
        block_ids.insert(key, block_id);
        memberships.extend(members.into_iter().map(|(_, record_id)| (record_id, block_id)));
    }

    // 4. per-record smaller ids
    memberships.sort_unstable();
    let mut entries: Vec<CoverageEntry> =
        GroupConsecutive::new(memberships.into_iter(), |(record_id, _)| *record_id)
            .flat_map(|(record_id, rows)| {
                coverage_for_record(record_id, rows.into_iter().map(|(_, b)| b).collect())
            })
            .collect();
    entries.sort_unstable_by_key(|e| (e.block_id, e.record_id));

    CoverageTable {
        block_ids,
        entries,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::predicates::{PredicateKind, StaticPredicateIndex};
    use std::collections::HashMap;

    fn pairs(raw: &[(&str, i32)]) -> Vec<(Option<String>, i32)> {
        raw.iter().map(|(k, id)| (Some(k.to_string()), *id)).collect()
    }

    #[test]
    fn test_smaller_ids_prefix() {
        let sorted = [1, 4, 7, 9];
        assert_eq!(smaller_ids(&sorted, 1), &[] as &[i32]);
        assert_eq!(smaller_ids(&sorted, 7), &[1, 4]);
        assert_eq!(smaller_ids(&sorted, 10), &[1, 4, 7, 9]);
    }

    #[test]
    fn test_two_block_scenario() {
        // A = {1,2,3}, B = {2,3,4}; record 5 only in a singleton block
        let table = build_coverage(pairs(&[
            ("A", 1),
            ("A", 2),
            ("A", 3),
            ("B", 2),
            ("B", 3),
            ("B", 4),
            ("C", 5),
        ]));
        assert_eq!(table.block_ids.get("A"), Some(&0));
        assert_eq!(table.block_ids.get("B"), Some(&1));
        assert!(!table.block_ids.contains_key("C"));

        let by_key: HashMap<(i32, i32), Vec<i32>> = table
            .entries
            .iter()
            .map(|e| ((e.record_id, e.block_id), e.smaller_ids.clone()))
            .collect();
        assert_eq!(by_key[&(2, 1)], vec![0]);
        assert_eq!(by_key[&(3, 1)], vec![0]);
        assert_eq!(by_key[&(4, 1)], Vec::<i32>::new());
        assert_eq!(by_key[&(1, 0)], Vec::<i32>::new());
        assert!(table.blocks_of(5).is_empty());
    }

    #[test]
    fn test_duplicate_pairs_collapse() {
        let table = build_coverage(pairs(&[("A", 1), ("A", 1), ("A", 2), ("B", 1), ("B", 1)]));
        // B only ever contains record 1 and is therefore a singleton
        assert_eq!(table.block_ids.len(), 1);
        assert_eq!(table.members_of(0), vec![1, 2]);
    }

    #[test]
    fn test_bad_keys_are_skipped_and_counted() {
        let long_key = "x".repeat(MAX_BLOCK_KEY_LEN + 1);
        let table = build_coverage(vec![
            (None, 1),
            (Some("  ".to_string()), 1),
            (Some(long_key), 2),
            (Some("A".to_string()), 1),
            (Some("A".to_string()), 2),
        ]);
        assert_eq!(table.issues.null_block_keys, 1);
        assert_eq!(table.issues.empty_block_keys, 1);
        assert_eq!(table.issues.oversized_block_keys, 1);
        assert_eq!(table.entries.len(), 2);
    }

    #[test]
    fn test_membership_reproduces_index_minus_singletons() {
        let assigned: Vec<(&str, i32)> = vec![
            ("k1", 1), ("k1", 2), ("k2", 2), ("k2", 3), ("k2", 4),
            ("k3", 4), ("k4", 1), ("k4", 4), ("k5", 3), ("k6", 5), ("k6", 1),
        ];
        let table = build_coverage(pairs(&assigned));

        let mut sizes: HashMap<&str, usize> = HashMap::new();
        for (k, _) in &assigned {
            *sizes.entry(*k).or_insert(0) += 1;
        }
        for record_id in 1..=5 {
            let mut expected: Vec<i32> = assigned
                .iter()
                .filter(|(k, r)| *r == record_id && sizes[k] > 1)
                .map(|(k, _)| table.block_ids[*k])
                .collect();
            expected.sort_unstable();
            assert_eq!(table.blocks_of(record_id), expected, "record {}", record_id);
        }
        // every smaller-ids set is exactly the record's earlier blocks
        for entry in &table.entries {
            let earlier: Vec<i32> = table
                .blocks_of(entry.record_id)
                .into_iter()
                .filter(|b| *b < entry.block_id)
                .collect();
            assert_eq!(entry.smaller_ids, earlier);
        }
    }

    #[test]
    fn test_block_record_skips_uncomparable_records() {
        let index = StaticPredicateIndex::new(vec![
            (0, PredicateKind::WholeField),
            (1, PredicateKind::WholeField),
        ]);
        let mut issues = DataIssueCounts::default();

        let empty = Record::new(7, vec![None, Some(" ".to_string())]);
        assert!(block_record(&index, &empty, &mut issues).is_empty());
        assert_eq!(issues.records_without_comparable_fields, 1);

        let partial = Record::new(8, vec![Some("Smith".to_string()), None]);
        let keys = block_record(&index, &partial, &mut issues);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].block_key, "smith:0");
        assert_eq!(issues.null_block_keys, 1);
    }
}

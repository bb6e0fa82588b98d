// src/candidate_generation/candidate_generation.rs

use anyhow::Result;
use std::collections::BTreeSet;

use crate::models::{CandidateBatch, CandidateRecord, Record};
use crate::utils::grouping::{ConsecutiveGrouper, GroupConsecutive};

/// One row of `smaller_coverage` joined with `entries_unique`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRow {
    pub block_id: i32,
    pub record: Record,
    /// `None` when the database returned NULL (the record's first block).
    pub smaller_ids: Option<Vec<i32>>,
}

impl CoverageRow {
    fn into_candidate(self) -> CandidateRecord {
        CandidateRecord {
            record_id: self.record.id,
            smaller_ids: self.smaller_ids.unwrap_or_default().into_iter().collect::<BTreeSet<i32>>(),
            record: self.record,
        }
    }
}

fn batch_from_rows(block_id: i32, rows: Vec<CoverageRow>) -> CandidateBatch {
    CandidateBatch {
        block_id,
        records: rows.into_iter().map(CoverageRow::into_candidate).collect(),
    }
}

/// Lazily groups rows into batches. Rows must already be ordered by
/// `block_id`; an empty input produces no batches.
pub fn candidates_gen<I>(rows: I) -> impl Iterator<Item = CandidateBatch>
where
    I: IntoIterator<Item = CoverageRow>,
{
    GroupConsecutive::new(rows.into_iter(), |row: &CoverageRow| row.block_id)
        .map(|(block_id, rows)| batch_from_rows(block_id, rows))
}

/// Push-based counterpart of [`candidates_gen`] for cursors read in chunks.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    grouper: ConsecutiveGrouper<i32, CoverageRow>,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: CoverageRow) -> Option<CandidateBatch> {
        self.grouper
            .push(row.block_id, row)
            .map(|(block_id, rows)| batch_from_rows(block_id, rows))
    }

    pub fn finish(&mut self) -> Option<CandidateBatch> {
        self.grouper
            .finish()
            .map(|(block_id, rows)| batch_from_rows(block_id, rows))
    }
}

/// Forward-only source of candidate batches consumed by the match coordinator.
#[allow(async_fn_in_trait)]
pub trait BatchSource {
    /// Next batch, or `None` once the underlying cursor is exhausted.
    async fn next_batch(&mut self) -> Result<Option<CandidateBatch>>;
}

/// [`BatchSource`] over an in-memory iterator.
pub struct IterBatchSource<I> {
    inner: I,
}

impl<I: Iterator<Item = CandidateBatch>> IterBatchSource<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I: Iterator<Item = CandidateBatch>> BatchSource for IterBatchSource<I> {
    async fn next_batch(&mut self) -> Result<Option<CandidateBatch>> {
        Ok(self.inner.next())
    }
}

/// Flattens batches back into coverage rows, in batch order.
pub fn flatten_batches(batches: &[CandidateBatch]) -> Vec<CoverageRow> {
    batches
        .iter()
        .flat_map(|b| {
            b.records.iter().map(move |c| CoverageRow {
                block_id: b.block_id,
                record: c.record.clone(),
                smaller_ids: Some(c.smaller_ids.iter().copied().collect()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::coverage::build_coverage;

    fn row(block_id: i32, id: i32, smaller: Option<Vec<i32>>) -> CoverageRow {
        CoverageRow {
            block_id,
            record: Record::new(id, vec![Some(format!("r{}", id))]),
            smaller_ids: smaller,
        }
    }

    #[test]
    fn test_batches_split_on_block_boundaries() {
        let rows = vec![
            row(0, 1, None),
            row(0, 2, None),
            row(0, 3, None),
            row(1, 2, Some(vec![0])),
            row(1, 3, Some(vec![0])),
            row(1, 4, None),
        ];
        let batches: Vec<CandidateBatch> = candidates_gen(rows).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].block_id, 0);
        assert_eq!(
            batches[0].records.iter().map(|r| r.record_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(batches[0].records.iter().all(|r| r.smaller_ids.is_empty()));
        assert_eq!(batches[1].records[0].smaller_ids, BTreeSet::from([0]));
        assert!(batches[1].records[2].smaller_ids.is_empty());
    }

    #[test]
    fn test_empty_input_produces_no_batches() {
        assert_eq!(candidates_gen(Vec::<CoverageRow>::new()).count(), 0);
        let mut acc = BatchAccumulator::new();
        assert!(acc.finish().is_none());
    }

    #[test]
    fn test_regrouping_is_idempotent() {
        let coverage = build_coverage(
            [("a", 1), ("a", 2), ("b", 2), ("b", 3), ("b", 5), ("c", 1), ("c", 5), ("d", 4)]
                .iter()
                .map(|(k, id)| (Some(k.to_string()), *id)),
        );
        let rows: Vec<CoverageRow> = coverage
            .entries
            .iter()
            .map(|e| row(e.block_id, e.record_id, Some(e.smaller_ids.clone())))
            .collect();
        let batches: Vec<CandidateBatch> = candidates_gen(rows).collect();
        let regrouped: Vec<CandidateBatch> = candidates_gen(flatten_batches(&batches)).collect();
        assert_eq!(regrouped, batches);
        assert!(batches.windows(2).all(|w| w[0].block_id < w[1].block_id));
    }

    #[test]
    fn test_accumulator_matches_iterator() {
        let rows = vec![row(3, 1, None), row(3, 9, None), row(7, 1, Some(vec![3])), row(7, 2, None)];
        let mut acc = BatchAccumulator::new();
        let mut pushed = Vec::new();
        for r in rows.clone() {
            pushed.extend(acc.push(r));
        }
        pushed.extend(acc.finish());
        assert_eq!(pushed, candidates_gen(rows).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_iter_batch_source_drains() {
        let batches: Vec<CandidateBatch> = candidates_gen(vec![row(0, 1, None), row(0, 2, None)]).collect();
        let mut source = IterBatchSource::new(batches.into_iter());
        assert_eq!(source.next_batch().await.unwrap().map(|b| b.len()), Some(2));
        assert!(source.next_batch().await.unwrap().is_none());
    }
}

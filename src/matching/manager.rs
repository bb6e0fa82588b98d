// src/matching/manager.rs

use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info};
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::HashMap;

use crate::candidate_generation::candidate_generation::BatchSource;
use crate::candidate_generation::db::PgCandidateStream;
use crate::config::DedupeConfig;
use crate::error::DedupeError;
use crate::matching::classifier::PairwiseClassifier;
use crate::models::stats_models::MatchingStats;
use crate::models::{CandidateBatch, CanonicalAssignment, Cluster, Record, ScoredPair};
use crate::utils::db_connect::PgPool;
use crate::utils::logging::{PipelineStage, StageLogger};
use crate::utils::progress_config::ProgressConfig;

/// Index pairs `(i, j)`, `i < j`, of the batch records that are compared in
/// this block: those that share no earlier block. Pairs sharing an earlier
/// block were already compared there.
pub fn redundant_free_pairs(batch: &CandidateBatch) -> Vec<(usize, usize)> {
    let records = &batch.records;
    let mut pairs = Vec::new();
    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            let (a, b) = (&records[i], &records[j]);
            if a.record_id != b.record_id && a.smaller_ids.is_disjoint(&b.smaller_ids) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub scored_pairs: Vec<ScoredPair>,
    pub stats: MatchingStats,
}

fn matcher_error(classifier: &str, block_id: i32, message: String) -> anyhow::Error {
    DedupeError::ExternalMatcher {
        classifier: classifier.to_string(),
        block_id,
        message,
    }
    .into()
}

/// Drains `source`, scoring each batch once. A classifier failure on any
/// batch aborts the whole run; nothing is kept from earlier batches.
pub async fn run_match_coordinator<S, C>(
    source: &mut S,
    classifier: &C,
    threshold: f64,
    progress_every: usize,
    spinner: Option<&ProgressBar>,
) -> Result<MatchOutcome>
where
    S: BatchSource,
    C: PairwiseClassifier + ?Sized,
{
    let mut outcome = MatchOutcome::default();
    let progress_every = progress_every.max(1);

    while let Some(batch) = source.next_batch().await? {
        outcome.stats.batches_processed += 1;
        outcome.stats.records_seen += batch.len();

        let index_pairs = redundant_free_pairs(&batch);
        if !index_pairs.is_empty() {
            let pairs: Vec<(&Record, &Record)> = index_pairs
                .iter()
                .map(|&(i, j)| (&batch.records[i].record, &batch.records[j].record))
                .collect();
            let scores = classifier
                .score_pairs(&pairs)
                .map_err(|e| matcher_error(classifier.name(), batch.block_id, format!("{:#}", e)))?;
            if scores.len() != pairs.len() {
                return Err(matcher_error(
                    classifier.name(),
                    batch.block_id,
                    format!("returned {} scores for {} pairs", scores.len(), pairs.len()),
                ));
            }
            outcome.stats.pairs_compared += pairs.len();

            for ((a, b), score) in pairs.iter().zip(scores) {
                if !score.is_finite() {
                    return Err(matcher_error(
                        classifier.name(),
                        batch.block_id,
                        format!("non-finite score for pair ({}, {})", a.id, b.id),
                    ));
                }
                if score >= threshold {
                    outcome.scored_pairs.push(ScoredPair::new(a.id, b.id, score));
                }
            }
        }

        if outcome.stats.batches_processed % progress_every == 0 {
            info!(
                "🔗 {} blocks processed, {} pairs compared, {} above threshold",
                outcome.stats.batches_processed,
                outcome.stats.pairs_compared,
                outcome.scored_pairs.len()
            );
        }
        if let Some(pb) = spinner {
            pb.set_message(format!(
                "Block {} ({} blocks, {} pairs compared)",
                batch.block_id, outcome.stats.batches_processed, outcome.stats.pairs_compared
            ));
        }
    }

    outcome.stats.pairs_above_threshold = outcome.scored_pairs.len();
    Ok(outcome)
}

/// Connected components over the scored pairs. `canon_id` is the smallest
/// member id; a member's score is the mean of its edge scores. Clusters are
/// returned ordered by `canon_id`.
pub fn cluster_scored_pairs(pairs: &[ScoredPair]) -> Vec<Cluster> {
    let mut graph: UnGraph<i32, f64> = UnGraph::new_undirected();
    let mut node_of: HashMap<i32, NodeIndex> = HashMap::new();
    for pair in pairs {
        let a = *node_of.entry(pair.id_1).or_insert_with(|| graph.add_node(pair.id_1));
        let b = *node_of.entry(pair.id_2).or_insert_with(|| graph.add_node(pair.id_2));
        graph.add_edge(a, b, pair.score);
    }

    let mut visited = vec![false; graph.node_count()];
    let mut clusters = Vec::new();
    for start in graph.node_indices() {
        if visited[start.index()] {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if visited[current.index()] {
                continue;
            }
            visited[current.index()] = true;
            component.push(current);
            for neighbor in graph.neighbors(current) {
                if !visited[neighbor.index()] {
                    stack.push(neighbor);
                }
            }
        }

        let mut members: Vec<(i32, f64)> = component
            .iter()
            .map(|&node| {
                let weights: Vec<f64> = graph.edges(node).map(|e| *e.weight()).collect();
                let mean = weights.iter().sum::<f64>() / weights.len() as f64;
                (graph[node], mean)
            })
            .collect();
        members.sort_by_key(|(id, _)| *id);
        clusters.push(Cluster {
            canon_id: members[0].0,
            member_ids: members.iter().map(|(id, _)| *id).collect(),
            scores: members.iter().map(|(_, s)| *s).collect(),
        });
    }
    clusters.sort_by_key(|c| c.canon_id);
    clusters
}

pub fn canonical_assignments(clusters: &[Cluster]) -> Vec<CanonicalAssignment> {
    clusters
        .iter()
        .flat_map(|c| {
            c.member_ids
                .iter()
                .zip(&c.scores)
                .map(move |(&record_id, &cluster_score)| CanonicalAssignment {
                    record_id,
                    canon_id: c.canon_id,
                    cluster_score,
                })
        })
        .collect()
}

/// The `cluster` stage: streams candidate batches from PostgreSQL through
/// the coordinator and clusters the result.
pub async fn run_clustering<C: PairwiseClassifier + ?Sized>(
    pool: &PgPool,
    config: &DedupeConfig,
    classifier: &C,
    stats: &mut MatchingStats,
    progress: &ProgressConfig,
    multi_progress: Option<&MultiProgress>,
) -> Result<Vec<Cluster>> {
    let logger = StageLogger::new(PipelineStage::Cluster);
    logger.log_phase(
        "scoring candidate batches",
        Some(&format!("classifier {}, threshold {:.2}", classifier.name(), config.threshold)),
    );

    let mut conn = pool.get().await.context("Failed to get DB connection for candidate stream")?;
    let spinner = progress.spinner(multi_progress, "Scoring candidate batches...");
    let mut stream = PgCandidateStream::open(&mut conn, config).await?;
    let outcome = run_match_coordinator(
        &mut stream,
        classifier,
        config.threshold,
        config.progress_every,
        spinner.as_ref(),
    )
    .await?;
    debug!("Candidate stream read {} rows", stream.rows_read());
    stream.close().await?;
    if let Some(pb) = &spinner {
        pb.finish_with_message(format!("{} blocks scored", outcome.stats.batches_processed));
    }

    logger.log_phase("clustering scored pairs", None);
    let clusters = cluster_scored_pairs(&outcome.scored_pairs);
    *stats = outcome.stats;
    stats.clusters_found = clusters.len();
    stats.clustered_records = clusters.iter().map(|c| c.member_ids.len()).sum();

    logger.log_completion(&format!(
        "{} blocks, {} pairs compared, {} clusters covering {} records",
        stats.batches_processed, stats.pairs_compared, stats.clusters_found, stats.clustered_records
    ));
    Ok(clusters)
}

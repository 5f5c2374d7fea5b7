//! Hybrid fusion of dense and sparse result lists.
//!
//! # Algorithm
//!
//! 1. Min-max normalize each list to `[0, 1]` independently. A list whose
//!    scores are all equal (including a single hit) normalizes to `1.0`.
//! 2. Combine: `score = w_dense × dense + w_sparse × sparse`, where a
//!    missing side contributes `0.0`.
//! 3. Sort by score (desc), then chunks present in both lists first, then
//!    dense ordinal (asc), then sparse ordinal (asc).
//! 4. Truncate to `rerank_top_k`.
//!
//! Two empty inputs are reported as [`FusionError::NoEvidenceFound`] so
//! callers can tell "nothing retrieved" apart from "retrieved, but weak".

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::models::{ComplexityTier, RetrievalResult};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FusionError {
    #[error("no evidence found by either retriever")]
    NoEvidenceFound,
}

/// Fusion weights and output size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub dense_weight: f64,
    pub sparse_weight: f64,
    pub rerank_top_k: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            dense_weight: 0.5,
            sparse_weight: 0.5,
            rerank_top_k: 5,
        }
    }
}

/// One fused, deduplicated hit.
///
/// `dense_score`/`sparse_score` are the normalized values that went into
/// the fused score. Min-max normalization is relative to each list, so the
/// raw retriever scores are kept too: `dense_similarity` is the cosine and
/// `bm25_score` the BM25 score. Ranks are 0-based ordinals in the original
/// lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    pub chunk_id: String,
    pub score: f64,
    pub dense_score: Option<f64>,
    pub sparse_score: Option<f64>,
    pub dense_similarity: Option<f64>,
    pub bm25_score: Option<f64>,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
}

impl FusedHit {
    pub fn in_both(&self) -> bool {
        self.dense_rank.is_some() && self.sparse_rank.is_some()
    }
}

/// Candidate-set sizes for one query, scaled by complexity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSizing {
    pub dense_top_k: usize,
    pub sparse_top_k: usize,
}

impl CandidateSizing {
    /// Scale base sizes by 0.5 (simple), 1.0 (moderate) or 1.5 (complex).
    /// Never returns a size below 1.
    pub fn for_tier(tier: ComplexityTier, dense_top_k: usize, sparse_top_k: usize) -> Self {
        let factor = match tier {
            ComplexityTier::Simple => 0.5,
            ComplexityTier::Moderate => 1.0,
            ComplexityTier::Complex => 1.5,
        };
        let scale = |k: usize| ((k as f64 * factor).round() as usize).max(1);
        Self {
            dense_top_k: scale(dense_top_k),
            sparse_top_k: scale(sparse_top_k),
        }
    }
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(results: &[RetrievalResult]) -> Vec<f64> {
    if results.is_empty() {
        return Vec::new();
    }

    let s_min = results.iter().map(|r| r.score).fold(f64::INFINITY, f64::min);
    let s_max = results.iter().map(|r| r.score).fold(f64::NEG_INFINITY, f64::max);

    results
        .iter()
        .map(|r| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (r.score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Merge dense and sparse hits into one ranked evidence list.
pub fn fuse(
    dense: &[RetrievalResult],
    sparse: &[RetrievalResult],
    params: &FusionParams,
) -> Result<Vec<FusedHit>, FusionError> {
    if dense.is_empty() && sparse.is_empty() {
        return Err(FusionError::NoEvidenceFound);
    }

    let mut hits: Vec<FusedHit> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for (rank, (r, norm)) in dense.iter().zip(normalize_scores(dense)).enumerate() {
        if by_id.contains_key(&r.chunk_id) {
            continue;
        }
        by_id.insert(r.chunk_id.clone(), hits.len());
        hits.push(FusedHit {
            chunk_id: r.chunk_id.clone(),
            score: 0.0,
            dense_score: Some(norm),
            sparse_score: None,
            dense_similarity: Some(r.score),
            bm25_score: None,
            dense_rank: Some(rank),
            sparse_rank: None,
        });
    }

    for (rank, (r, norm)) in sparse.iter().zip(normalize_scores(sparse)).enumerate() {
        match by_id.get(&r.chunk_id) {
            Some(&i) => {
                if hits[i].sparse_rank.is_none() {
                    hits[i].sparse_score = Some(norm);
                    hits[i].bm25_score = Some(r.score);
                    hits[i].sparse_rank = Some(rank);
                }
            }
            None => {
                by_id.insert(r.chunk_id.clone(), hits.len());
                hits.push(FusedHit {
                    chunk_id: r.chunk_id.clone(),
                    score: 0.0,
                    dense_score: None,
                    sparse_score: Some(norm),
                    dense_similarity: None,
                    bm25_score: Some(r.score),
                    dense_rank: None,
                    sparse_rank: Some(rank),
                });
            }
        }
    }

    for hit in &mut hits {
        hit.score = params.dense_weight * hit.dense_score.unwrap_or(0.0)
            + params.sparse_weight * hit.sparse_score.unwrap_or(0.0);
    }

    hits.sort_by(compare_hits);
    hits.truncate(params.rerank_top_k);
    Ok(hits)
}

fn compare_hits(a: &FusedHit, b: &FusedHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.in_both().cmp(&a.in_both()))
        .then_with(|| cmp_rank(a.dense_rank, b.dense_rank))
        .then_with(|| cmp_rank(a.sparse_rank, b.sparse_rank))
}

/// Ascending by rank; absent ranks sort last.
fn cmp_rank(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

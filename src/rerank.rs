//! Optional cross-encoder reranking of fused evidence.
//!
//! Fusion ranks passages by how each retriever scored them on its own.
//! A [`Reranker`] scores every (question, passage) pair jointly and the
//! evidence is re-sorted by that score. Without the
//! `local-embeddings-fastembed` feature no reranker is available and the
//! fused order stands.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::config::RetrievalConfig;
use crate::retrieval::Evidence;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RerankError {
    #[error("reranker unavailable: {0}")]
    Unavailable(String),
    #[error("reranker returned {got} scores for {expected} passages")]
    ScoreCount { expected: usize, got: usize },
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn model_name(&self) -> &str;

    /// One relevance score per passage, in passage order. Higher is more
    /// relevant; the scale is the model's own.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError>;
}

/// Score `evidence` against `query`, sort by the new score and keep `top_k`.
/// Equal scores keep their fused order.
pub async fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    evidence: Vec<Evidence>,
    top_k: usize,
) -> Result<Vec<Evidence>, RerankError> {
    if evidence.is_empty() {
        return Ok(evidence);
    }
    let passages: Vec<String> = evidence.iter().map(|e| e.text.clone()).collect();
    let scores = reranker.score(query, &passages).await?;
    if scores.len() != evidence.len() {
        return Err(RerankError::ScoreCount {
            expected: evidence.len(),
            got: scores.len(),
        });
    }
    Ok(apply_scores(evidence, &scores, top_k))
}

fn apply_scores(evidence: Vec<Evidence>, scores: &[f64], top_k: usize) -> Vec<Evidence> {
    let mut scored: Vec<Evidence> = evidence
        .into_iter()
        .zip(scores)
        .map(|(mut e, &score)| {
            e.rerank_score = Some(score);
            e
        })
        .collect();
    scored.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(Ordering::Equal)
    });
    scored.truncate(top_k);
    scored
}

// ============ Local cross-encoder (fastembed) ============

/// Cross-encoder run locally via fastembed. The model is downloaded on
/// first use and kept loaded.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalReranker {
    model_name: String,
    fastembed_model: fastembed::RerankerModel,
    loaded: Arc<std::sync::Mutex<Option<fastembed::TextRerank>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalReranker {
    pub fn new(model: Option<&str>) -> Result<Self> {
        let model_name = model.unwrap_or("bge-reranker-base").to_string();
        let fastembed_model = match model_name.as_str() {
            "bge-reranker-base" => fastembed::RerankerModel::BGERerankerBase,
            "jina-reranker-v1-turbo-en" => fastembed::RerankerModel::JINARerankerV1TurboEn,
            other => bail!(
                "Unknown local reranker model: '{}'. Supported models: \
                 bge-reranker-base, jina-reranker-v1-turbo-en",
                other
            ),
        };
        Ok(Self {
            model_name,
            fastembed_model,
            loaded: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Reranker for LocalReranker {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        let query = query.to_string();
        let passages = passages.to_vec();
        let count = passages.len();
        let loaded = self.loaded.clone();
        let fastembed_model = self.fastembed_model.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.is_none() {
                let model = fastembed::TextRerank::try_new(
                    fastembed::RerankInitOptions::new(fastembed_model).with_show_download_progress(true),
                )
                .map_err(|e| RerankError::Unavailable(format!("Failed to initialize reranker: {}", e)))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| RerankError::Unavailable("reranker not loaded".into()))?;

            let documents: Vec<&str> = passages.iter().map(String::as_str).collect();
            let results = model
                .rerank(query.as_str(), &documents, false, None)
                .map_err(|e| RerankError::Unavailable(format!("Reranking failed: {}", e)))?;

            // Results come back sorted by score; put them back in passage order.
            let mut scores = vec![f64::NEG_INFINITY; count];
            for r in results {
                if let Some(slot) = scores.get_mut(r.index) {
                    *slot = r.score as f64;
                }
            }
            Ok(scores)
        })
        .await
        .map_err(|e| RerankError::Unavailable(e.to_string()))?
    }
}

/// Create the reranker named by `retrieval.reranker`; `None` for `"none"`.
pub fn create_reranker(config: &RetrievalConfig) -> Result<Option<Arc<dyn Reranker>>> {
    match config.reranker.as_str() {
        "none" => Ok(None),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Some(Arc::new(LocalReranker::new(config.reranker_model.as_deref())?))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local reranker requires --features local-embeddings-fastembed"),
        other => bail!("Unknown reranker: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores a passage by how many query words it contains.
    struct OverlapReranker;

    #[async_trait]
    impl Reranker for OverlapReranker {
        fn model_name(&self) -> &str {
            "overlap"
        }

        async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
            let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
            Ok(passages
                .iter()
                .map(|p| {
                    let p = p.to_lowercase();
                    words.iter().filter(|w| p.contains(w.as_str())).count() as f64
                })
                .collect())
        }
    }

    struct ShortReranker;

    #[async_trait]
    impl Reranker for ShortReranker {
        fn model_name(&self) -> &str {
            "short"
        }

        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f64>, RerankError> {
            Ok(vec![1.0])
        }
    }

    fn evidence(doc: &str, text: &str, score: f64) -> Evidence {
        Evidence {
            chunk_id: format!("{}#0", doc),
            source_document: doc.to_string(),
            text: text.to_string(),
            score,
            dense_score: Some(score),
            sparse_score: None,
            dense_similarity: Some(score),
            bm25_score: None,
            dense_rank: Some(0),
            sparse_rank: None,
            rerank_score: None,
        }
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_truncates() {
        let fused = vec![
            evidence("billing", "Invoices are emailed monthly.", 0.9),
            evidence("account", "Reset your password from the login page.", 0.6),
            evidence("security", "Enable two-factor authentication in settings.", 0.5),
        ];

        let reranked = rerank(&OverlapReranker, "reset password login", fused, 2)
            .await
            .unwrap();

        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].source_document, "account");
        assert_eq!(reranked[0].rerank_score, Some(3.0));
        // Ties keep the fused order.
        assert_eq!(reranked[1].source_document, "billing");
        assert!((reranked[0].score - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rerank_rejects_score_count_mismatch() {
        let fused = vec![evidence("a", "one", 0.9), evidence("b", "two", 0.8)];
        let err = rerank(&ShortReranker, "q", fused, 5).await.unwrap_err();
        assert_eq!(err, RerankError::ScoreCount { expected: 2, got: 1 });
    }

    #[tokio::test]
    async fn test_rerank_of_nothing() {
        assert!(rerank(&ShortReranker, "q", Vec::new(), 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_create_reranker() {
        assert!(create_reranker(&RetrievalConfig::default()).unwrap().is_none());

        let mut config = RetrievalConfig::default();
        config.reranker = "magic".to_string();
        assert!(create_reranker(&config).is_err());
    }
}

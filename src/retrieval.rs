//! The loaded knowledge index: both retrievers plus the chunk table that
//! turns fused hits back into evidence text.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use support_harness_core::dense::DenseRetriever;
use support_harness_core::embedding::Embedder;
use support_harness_core::fusion::FusedHit;
use support_harness_core::models::Chunk;
use support_harness_core::sparse::SparseRetriever;

use crate::config::RetrievalConfig;
use crate::index_store;

/// A fused hit resolved to its chunk, with provenance.
///
/// `score` is the fused score, relative to the other hits of the same
/// query. `dense_similarity` and `bm25_score` are the absolute retriever
/// scores behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub chunk_id: String,
    pub source_document: String,
    pub text: String,
    pub score: f64,
    pub dense_score: Option<f64>,
    pub sparse_score: Option<f64>,
    pub dense_similarity: Option<f64>,
    pub bm25_score: Option<f64>,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    /// Cross-encoder score, when a reranker ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

/// Whether any evidence is actually about the query: it shares a term with
/// it (a BM25 match) or its raw cosine similarity reaches `min_similarity`.
///
/// The dense retriever always returns its nearest rows, so an off-topic
/// question still produces fused evidence; this is what tells it apart.
pub fn passes_relevance_floor(evidence: &[Evidence], min_similarity: f64) -> bool {
    evidence.iter().any(|e| {
        e.bm25_score.is_some() || e.dense_similarity.is_some_and(|s| s >= min_similarity)
    })
}

/// Distinct source documents in evidence rank order.
pub fn distinct_sources(evidence: &[Evidence]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for item in evidence {
        if !sources.contains(&item.source_document) {
            sources.push(item.source_document.clone());
        }
    }
    sources
}

pub struct KnowledgeIndex {
    pub dense: DenseRetriever,
    pub sparse: SparseRetriever,
    chunks: HashMap<String, Chunk>,
}

impl KnowledgeIndex {
    pub fn empty(embedder: Arc<dyn Embedder>, retrieval: &RetrievalConfig) -> Self {
        Self {
            dense: DenseRetriever::new(embedder),
            sparse: sparse_retriever(retrieval),
            chunks: HashMap::new(),
        }
    }

    /// Embed and index `chunks` from scratch.
    pub async fn build(
        embedder: Arc<dyn Embedder>,
        retrieval: &RetrievalConfig,
        batch_size: usize,
        chunks: Vec<Chunk>,
    ) -> Result<Self> {
        let mut dense = DenseRetriever::new(embedder).with_batch_size(batch_size);
        dense.index(&chunks).await?;
        let mut sparse = sparse_retriever(retrieval);
        sparse.index(&chunks);

        Ok(Self {
            dense,
            sparse,
            chunks: chunks.into_iter().map(|c| (c.id.clone(), c)).collect(),
        })
    }

    /// Restore the index persisted by `shx index`.
    pub async fn load(
        pool: &SqlitePool,
        embedder: Arc<dyn Embedder>,
        retrieval: &RetrievalConfig,
    ) -> Result<Self> {
        let chunks = index_store::load_chunks(pool).await?;
        let rows = index_store::load_dense_rows(pool).await?;

        let mut dense = DenseRetriever::new(embedder);
        dense.load(rows);
        let mut sparse = sparse_retriever(retrieval);
        sparse.index(&chunks);

        Ok(Self {
            dense,
            sparse,
            chunks: chunks.into_iter().map(|c| (c.id.clone(), c)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, id: &str) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    /// Resolve fused hits to evidence, dropping ids the chunk table no
    /// longer knows.
    pub fn evidence(&self, hits: &[FusedHit]) -> Vec<Evidence> {
        hits.iter()
            .filter_map(|hit| {
                let chunk = self.chunks.get(&hit.chunk_id)?;
                Some(Evidence {
                    chunk_id: hit.chunk_id.clone(),
                    source_document: chunk.source_document.clone(),
                    text: chunk.text.clone(),
                    score: hit.score,
                    dense_score: hit.dense_score,
                    sparse_score: hit.sparse_score,
                    dense_similarity: hit.dense_similarity,
                    bm25_score: hit.bm25_score,
                    dense_rank: hit.dense_rank,
                    sparse_rank: hit.sparse_rank,
                    rerank_score: None,
                })
            })
            .collect()
    }
}

fn sparse_retriever(retrieval: &RetrievalConfig) -> SparseRetriever {
    match &retrieval.stopwords {
        Some(words) => SparseRetriever::new().with_stopwords(words.iter().cloned()),
        None => SparseRetriever::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use support_harness_core::chunk::{build_chunks, ChunkingParams};
    use support_harness_core::models::SourceDocument;

    fn hit(chunk_id: &str, score: f64) -> FusedHit {
        FusedHit {
            chunk_id: chunk_id.to_string(),
            score,
            dense_score: Some(score),
            sparse_score: None,
            dense_similarity: Some(score),
            bm25_score: None,
            dense_rank: Some(0),
            sparse_rank: None,
        }
    }

    #[tokio::test]
    async fn test_build_and_resolve_evidence() {
        let chunks = build_chunks(
            &[
                SourceDocument::new("account", "Reset your password from the login page."),
                SourceDocument::new("billing", "Invoices are sent monthly."),
            ],
            &ChunkingParams::default(),
        );
        let index = KnowledgeIndex::build(
            Arc::new(HashEmbedder::new(64)),
            &RetrievalConfig::default(),
            16,
            chunks,
        )
        .await
        .unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.dense.len(), 2);

        let evidence = index.evidence(&[hit("billing#0", 0.9), hit("missing#3", 0.5)]);
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].source_document, "billing");
        assert_eq!(evidence[0].text, "Invoices are sent monthly.");
    }

    #[test]
    fn test_distinct_sources_keeps_rank_order() {
        let make = |chunk: &str, doc: &str| Evidence {
            chunk_id: chunk.to_string(),
            source_document: doc.to_string(),
            text: String::new(),
            score: 0.0,
            dense_score: None,
            sparse_score: None,
            dense_similarity: None,
            bm25_score: None,
            dense_rank: None,
            sparse_rank: None,
            rerank_score: None,
        };
        let evidence = vec![make("b#1", "b"), make("a#0", "a"), make("b#0", "b")];
        assert_eq!(distinct_sources(&evidence), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_relevance_floor_uses_raw_scores() {
        let chunks = build_chunks(
            &[
                SourceDocument::new("account", "Reset your password from the login page."),
                SourceDocument::new("billing", "Invoices are sent monthly."),
            ],
            &ChunkingParams::default(),
        );
        let index = KnowledgeIndex::build(
            Arc::new(HashEmbedder::new(256)),
            &RetrievalConfig::default(),
            16,
            chunks,
        )
        .await
        .unwrap();

        let evidence_for = |dense: Vec<_>, sparse: Vec<_>| {
            let hits = support_harness_core::fusion::fuse(&dense, &sparse, &Default::default()).unwrap();
            index.evidence(&hits)
        };

        // On topic: BM25 matches, so the floor passes whatever the cosine.
        let query = "reset password";
        let evidence = evidence_for(
            index.dense.query(query, 2).await.unwrap(),
            index.sparse.query(query, 2),
        );
        assert_eq!(evidence[0].source_document, "account");
        assert!(evidence[0].bm25_score.is_some());
        assert!(passes_relevance_floor(&evidence, 0.99));

        // Off topic: the dense side still returns both chunks, fused to a
        // top score of 0.5, but nothing clears the absolute floor.
        let query = "football world cup";
        let evidence = evidence_for(index.dense.query(query, 2).await.unwrap(), Vec::new());
        assert_eq!(evidence.len(), 2);
        assert!((evidence[0].score - 0.5).abs() < 1e-9);
        assert!(evidence.iter().all(|e| e.dense_similarity.unwrap_or(0.0) < 0.2));
        assert!(!passes_relevance_floor(&evidence, 0.2));
    }
}

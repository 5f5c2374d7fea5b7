//! Dense (embedding) retriever.
//!
//! Holds one embedding per chunk and answers queries with a brute-force
//! cosine scan. Rows keep insertion order, which is also the tie-break
//! order for equal scores.

use std::sync::Arc;

use tracing::debug;

use crate::embedding::{cosine_similarity, Embedder, EmbeddingError};
use crate::models::{Chunk, RetrievalResult, RetrieverKind};

/// Number of chunk texts sent to the embedder per request when indexing.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// One indexed chunk vector.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseRow {
    pub chunk_id: String,
    pub source_document: String,
    pub vector: Vec<f32>,
}

pub struct DenseRetriever {
    embedder: Arc<dyn Embedder>,
    rows: Vec<DenseRow>,
    batch_size: usize,
}

impl DenseRetriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            rows: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embed every chunk and replace the index wholesale.
    ///
    /// On error the previous index is left untouched.
    pub async fn index(&mut self, chunks: &[Chunk]) -> Result<(), EmbeddingError> {
        let mut rows = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            for (chunk, vector) in batch.iter().zip(vectors) {
                rows.push(DenseRow {
                    chunk_id: chunk.id.clone(),
                    source_document: chunk.source_document.clone(),
                    vector,
                });
            }
        }

        debug!(rows = rows.len(), model = self.embedder.model_name(), "dense index built");
        self.rows = rows;
        Ok(())
    }

    /// Restore a previously persisted index without re-embedding.
    pub fn load(&mut self, rows: Vec<DenseRow>) {
        self.rows = rows;
    }

    pub fn rows(&self) -> &[DenseRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Top-`k` chunks by cosine similarity to the embedded query.
    ///
    /// An embedding failure is returned as an error, never as an empty list.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievalResult>, EmbeddingError> {
        if k == 0 || self.rows.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embedder.embed(text).await?;
        Ok(self.query_vector(&query_vec, k))
    }

    /// Top-`k` chunks by their best cosine similarity to any of `texts`.
    ///
    /// All texts are embedded in one batch. Scores stay raw cosines, so a
    /// chunk that only one variation matches keeps that variation's score.
    pub async fn query_many(
        &self,
        texts: &[String],
        k: usize,
    ) -> Result<Vec<RetrievalResult>, EmbeddingError> {
        if k == 0 || self.rows.is_empty() || texts.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.embedder.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        let scored = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let best = vectors
                    .iter()
                    .map(|v| cosine_similarity(v, &row.vector) as f64)
                    .fold(f64::NEG_INFINITY, f64::max);
                (i, best)
            })
            .collect();
        Ok(self.rank(scored, k))
    }

    /// Rank against an already-embedded query.
    pub fn query_vector(&self, query_vec: &[f32], k: usize) -> Vec<RetrievalResult> {
        let scored = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| (i, cosine_similarity(query_vec, &row.vector) as f64))
            .collect();
        self.rank(scored, k)
    }

    fn rank(&self, mut scored: Vec<(usize, f64)>, k: usize) -> Vec<RetrievalResult> {
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, score)| RetrievalResult {
                chunk_id: self.rows[i].chunk_id.clone(),
                score,
                retriever_kind: RetrieverKind::Dense,
            })
            .collect()
    }
}

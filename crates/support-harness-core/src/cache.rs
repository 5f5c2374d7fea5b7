//! Semantic response cache.
//!
//! Maps previously answered queries to their responses by embedding
//! similarity rather than exact text. Lookups are a linear cosine scan over
//! live entries; the capacity bound keeps that scan small.
//!
//! Entries are append-only. A store never overwrites an existing entry,
//! even for identical query text. Expired entries are never served, and
//! are pruned lazily the next time something is stored.
//!
//! Concurrency: entries sit behind a `RwLock`. Lookups share the read
//! lock; a store embeds the query first and only then takes the write
//! lock, so readers never observe a half-applied store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::embedding::{cosine_similarity, Embedder, EmbeddingError};

/// Source of "now" for entry ages.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheParams {
    /// Minimum cosine similarity for a hit.
    pub similarity_threshold: f64,
    /// Entries at or beyond this age are never served.
    pub ttl: Duration,
    /// Maximum number of entries kept after a store.
    pub capacity: usize,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.90,
            ttl: Duration::from_secs(3600),
            capacity: 10_000,
        }
    }
}

/// A cached answer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    #[serde(skip)]
    pub query_embedding: Vec<f32>,
    pub canonical_query_text: String,
    pub response_text: String,
    pub sources: Vec<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub live_entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct SemanticCache {
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    params: CacheParams,
    entries: RwLock<Vec<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

impl SemanticCache {
    pub fn new(embedder: Arc<dyn Embedder>, params: CacheParams) -> Self {
        Self::with_clock(embedder, params, Arc::new(SystemClock))
    }

    pub fn with_clock(embedder: Arc<dyn Embedder>, params: CacheParams, clock: Arc<dyn Clock>) -> Self {
        Self {
            embedder,
            clock,
            params,
            entries: RwLock::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    /// Look up with the configured similarity threshold.
    pub async fn lookup(&self, query: &str) -> Result<Option<CacheHit>, EmbeddingError> {
        self.lookup_with_threshold(query, self.params.similarity_threshold)
            .await
    }

    /// Look up with an explicit threshold (e.g. a stricter one for
    /// complex queries).
    pub async fn lookup_with_threshold(
        &self,
        query: &str,
        threshold: f64,
    ) -> Result<Option<CacheHit>, EmbeddingError> {
        if self.live_len() == 0 {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        let embedding = self.embedder.embed(query).await?;
        Ok(self.lookup_embedding(&embedding, threshold))
    }

    /// Best live entry with similarity ≥ `threshold`, if any.
    pub fn lookup_embedding(&self, embedding: &[f32], threshold: f64) -> Option<CacheHit> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<(&CacheEntry, f64)> = None;
        for entry in entries.iter() {
            if !self.is_live(entry, now) {
                continue;
            }
            let sim = cosine_similarity(embedding, &entry.query_embedding) as f64;
            if sim < threshold {
                continue;
            }
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((entry, sim));
            }
        }

        match best {
            Some((entry, similarity)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(similarity, query = %entry.canonical_query_text, "semantic cache hit");
                Some(CacheHit {
                    entry: entry.clone(),
                    similarity,
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Embed `query` and append a new entry.
    pub async fn store(
        &self,
        query: &str,
        response: &str,
        sources: &[String],
        confidence: f64,
    ) -> Result<(), EmbeddingError> {
        let query_embedding = self.embedder.embed(query).await?;
        self.insert_entry(CacheEntry {
            query_embedding,
            canonical_query_text: query.to_string(),
            response_text: response.to_string(),
            sources: sources.to_vec(),
            confidence,
            created_at: self.clock.now(),
        });
        Ok(())
    }

    /// Append a pre-built entry, pruning expired entries and evicting the
    /// oldest until the capacity bound holds.
    pub fn insert_entry(&self, entry: CacheEntry) {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let before = entries.len();
        entries.retain(|e| self.is_live(e, now));
        let mut evicted = before - entries.len();

        entries.push(entry);

        while entries.len() > self.params.capacity {
            let oldest = entries
                .iter()
                .enumerate()
                .min_by_key(|(i, e)| (e.created_at, *i))
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    entries.remove(i);
                    evicted += 1;
                }
                None => break,
            }
        }

        self.stores.fetch_add(1, Ordering::Relaxed);
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// Total stored entries, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries still within their TTL.
    pub fn live_len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| self.is_live(e, now))
            .count()
    }

    /// Snapshot of stored entries in insertion order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.len(),
            live_entries: self.live_len(),
            capacity: self.params.capacity,
            hits,
            misses,
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn is_live(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.created_at).to_std() {
            Ok(age) => age < self.params.ttl,
            // Created "in the future" relative to the clock: age is zero.
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Mutex::new(Utc::now()))
        }
        fn advance(&self, d: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::from_std(d).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Bag-of-letters embedding: identical text gives identical vectors.
    struct LetterEmbedder;

    #[async_trait]
    impl Embedder for LetterEmbedder {
        fn model_name(&self) -> &str {
            "letters"
        }
        fn dims(&self) -> usize {
            26
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 26];
                    for c in t.to_ascii_lowercase().bytes() {
                        if c.is_ascii_lowercase() {
                            v[(c - b'a') as usize] += 1.0;
                        }
                    }
                    v
                })
                .collect())
        }
    }

    fn cache(capacity: usize) -> (SemanticCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let params = CacheParams {
            similarity_threshold: 0.9,
            ttl: Duration::from_secs(3600),
            capacity,
        };
        (
            SemanticCache::with_clock(Arc::new(LetterEmbedder), params, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_store_then_lookup_round_trip() {
        let (cache, _) = cache(10);
        let sources = vec!["billing/refunds".to_string()];
        cache
            .store("How do refunds work?", "Refunds take 5 days.", &sources, 0.85)
            .await
            .unwrap();

        let hit = cache.lookup("How do refunds work?").await.unwrap().unwrap();
        assert_eq!(hit.entry.response_text, "Refunds take 5 days.");
        assert_eq!(hit.entry.sources, sources);
        assert!((hit.similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dissimilar_query_misses() {
        let (cache, _) = cache(10);
        cache.store("refund", "r", &[], 0.9).await.unwrap();
        assert!(cache.lookup("xyz zzz qqq").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_never_served() {
        let (cache, clock) = cache(10);
        cache.store("reset password", "r", &[], 0.9).await.unwrap();
        clock.advance(Duration::from_secs(3601));
        assert!(cache.lookup("reset password").await.unwrap().is_none());
        // Lazy expiry: still stored until the next store prunes it.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.live_len(), 0);
    }

    #[tokio::test]
    async fn test_prebuilt_stale_entry_never_served() {
        let (cache, clock) = cache(10);
        let embedding = LetterEmbedder.embed("cancel plan").await.unwrap();
        cache.insert_entry(CacheEntry {
            query_embedding: embedding.clone(),
            canonical_query_text: "cancel plan".into(),
            response_text: "stale".into(),
            sources: vec![],
            confidence: 0.9,
            created_at: clock.now() - chrono::Duration::seconds(3601),
        });
        assert!(cache.lookup_embedding(&embedding, 0.9).is_none());
    }

    #[tokio::test]
    async fn test_store_prunes_expired() {
        let (cache, clock) = cache(10);
        cache.store("one", "1", &[], 0.9).await.unwrap();
        clock.advance(Duration::from_secs(4000));
        cache.store("two", "2", &[], 0.9).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_single_oldest() {
        let (cache, clock) = cache(3);
        for q in ["alpha", "bravo", "charlie", "delta"] {
            cache.store(q, q, &[], 0.9).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        let remaining: Vec<String> = cache
            .entries()
            .into_iter()
            .map(|e| e.canonical_query_text)
            .collect();
        assert_eq!(remaining, vec!["bravo", "charlie", "delta"]);
    }

    #[tokio::test]
    async fn test_store_appends_never_overwrites() {
        let (cache, _) = cache(10);
        cache.store("same", "first", &[], 0.9).await.unwrap();
        cache.store("same", "second", &[], 0.9).await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_threshold() {
        let (cache, _) = cache(10);
        cache.store("abc", "r", &[], 0.9).await.unwrap();
        // "abd" vs "abc": cosine 2/3.
        assert!(cache.lookup_with_threshold("abd", 0.6).await.unwrap().is_some());
        assert!(cache.lookup_with_threshold("abd", 0.7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_counts_hits_and_misses() {
        let (cache, _) = cache(10);
        cache.lookup("empty cache").await.unwrap();
        cache.store("billing", "b", &[], 0.9).await.unwrap();
        cache.lookup("billing").await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }
}

//! Sparse (BM25) retriever.
//!
//! An inverted index over chunk text, rebuilt wholesale on every
//! [`SparseRetriever::index`] call. Scoring is Okapi BM25:
//!
//! ```text
//! idf(t)      = ln(1 + (N - df + 0.5) / (df + 0.5))
//! score(d, q) = Σ idf(t) · tf·(k1 + 1) / (tf + k1·(1 - b + b·|d|/avgdl))
//! ```
//!
//! Only chunks sharing at least one query term are returned.

use std::collections::{HashMap, HashSet};

use crate::models::{Chunk, RetrievalResult, RetrieverKind};

pub const DEFAULT_K1: f64 = 1.5;
pub const DEFAULT_B: f64 = 0.75;

/// English stopwords dropped from both documents and queries.
pub const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "could", "do", "does",
    "for", "from", "had", "has", "have", "how", "i", "if", "in", "into", "is", "it", "its", "me",
    "my", "no", "not", "of", "on", "or", "our", "should", "so", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "to", "too", "us", "was", "we", "were",
    "what", "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

#[derive(Debug, Clone, Copy)]
struct Posting {
    ordinal: usize,
    tf: u32,
}

pub struct SparseRetriever {
    k1: f64,
    b: f64,
    stopwords: HashSet<String>,
    chunk_ids: Vec<String>,
    doc_lengths: Vec<usize>,
    avg_doc_length: f64,
    postings: HashMap<String, Vec<Posting>>,
}

impl SparseRetriever {
    pub fn new() -> Self {
        Self::with_parameters(DEFAULT_K1, DEFAULT_B)
    }

    pub fn with_parameters(k1: f64, b: f64) -> Self {
        Self {
            k1,
            b,
            stopwords: DEFAULT_STOPWORDS.iter().map(|s| s.to_string()).collect(),
            chunk_ids: Vec::new(),
            doc_lengths: Vec::new(),
            avg_doc_length: 0.0,
            postings: HashMap::new(),
        }
    }

    /// Replace the stopword set. Takes effect on the next `index` call.
    pub fn with_stopwords<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stopwords = words.into_iter().map(|w| w.into().to_lowercase()).collect();
        self
    }

    /// Rebuild the index from `chunks`, replacing any previous contents.
    pub fn index(&mut self, chunks: &[Chunk]) {
        self.chunk_ids.clear();
        self.doc_lengths.clear();
        self.postings.clear();

        for (ordinal, chunk) in chunks.iter().enumerate() {
            let tokens = self.tokenize(&chunk.text);

            let mut term_freq: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_freq.entry(token.clone()).or_insert(0) += 1;
            }
            for (term, tf) in term_freq {
                self.postings
                    .entry(term)
                    .or_default()
                    .push(Posting { ordinal, tf });
            }

            self.chunk_ids.push(chunk.id.clone());
            self.doc_lengths.push(tokens.len());
        }

        let total: usize = self.doc_lengths.iter().sum();
        self.avg_doc_length = if self.chunk_ids.is_empty() {
            0.0
        } else {
            total as f64 / self.chunk_ids.len() as f64
        };
    }

    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Top-`k` chunks by BM25 score. No shared terms yields an empty list.
    pub fn query(&self, text: &str, k: usize) -> Vec<RetrievalResult> {
        self.query_many(&[text], k)
    }

    /// Top-`k` chunks by their best BM25 score over several phrasings of
    /// one question. Only chunks matching at least one phrasing are returned.
    pub fn query_many<S: AsRef<str>>(&self, texts: &[S], k: usize) -> Vec<RetrievalResult> {
        if k == 0 || self.chunk_ids.is_empty() {
            return Vec::new();
        }

        let mut scores = vec![0.0f64; self.chunk_ids.len()];
        let mut matched = vec![false; self.chunk_ids.len()];

        for text in texts {
            let mut text_scores = vec![0.0f64; self.chunk_ids.len()];
            let mut seen = HashSet::new();
            for term in self.tokenize(text.as_ref()) {
                if !seen.insert(term.clone()) {
                    continue;
                }
                let Some(postings) = self.postings.get(&term) else {
                    continue;
                };
                let idf = self.idf(postings.len());
                for p in postings {
                    text_scores[p.ordinal] += idf * self.term_score(p.tf, self.doc_lengths[p.ordinal]);
                    matched[p.ordinal] = true;
                }
            }
            for (best, score) in scores.iter_mut().zip(text_scores) {
                *best = best.max(score);
            }
        }

        let mut hits: Vec<(usize, f64)> = scores
            .into_iter()
            .enumerate()
            .filter(|(i, _)| matched[*i])
            .collect();

        // Candidates are in ordinal order; the stable sort keeps it for ties.
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);

        hits.into_iter()
            .map(|(i, score)| RetrievalResult {
                chunk_id: self.chunk_ids[i].clone(),
                score,
                retriever_kind: RetrieverKind::Sparse,
            })
            .collect()
    }

    fn idf(&self, df: usize) -> f64 {
        let n = self.chunk_ids.len() as f64;
        let df = df as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn term_score(&self, tf: u32, doc_length: usize) -> f64 {
        let tf = tf as f64;
        let len_ratio = if self.avg_doc_length > 0.0 {
            doc_length as f64 / self.avg_doc_length
        } else {
            1.0
        };
        (tf * (self.k1 + 1.0)) / (tf + self.k1 * (1.0 - self.b + self.b * len_ratio))
    }

    /// Lowercase, split on non-alphanumeric characters, drop stopwords.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty() && !self.stopwords.contains(*s))
            .map(str::to_string)
            .collect()
    }
}

impl Default for SparseRetriever {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            source_document: id.to_string(),
            position: 0,
            char_start: 0,
            char_end: text.chars().count(),
            hash: String::new(),
        }
    }

    fn indexed() -> SparseRetriever {
        let mut r = SparseRetriever::new();
        r.index(&[
            chunk("refunds", "Refunds are issued to the original payment method within 5 days."),
            chunk("password", "To reset your password, open the login page and click Forgot password."),
            chunk("export", "Export your workspace data as CSV from Settings."),
        ]);
        r
    }

    #[test]
    fn test_tokenize_drops_stopwords_and_punctuation() {
        let r = SparseRetriever::new();
        let tokens = r.tokenize("How do I reset MY password?!");
        assert_eq!(tokens, vec!["reset", "password"]);
    }

    #[test]
    fn test_query_ranks_matching_chunk_first() {
        let r = indexed();
        let hits = r.query("forgot my password", 10);
        assert_eq!(hits[0].chunk_id, "password");
        assert_eq!(hits[0].retriever_kind, RetrieverKind::Sparse);
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn test_only_matching_chunks_returned() {
        let r = indexed();
        let hits = r.query("csv export", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "export");
    }

    #[test]
    fn test_no_shared_terms_is_empty() {
        let r = indexed();
        assert!(r.query("kubernetes helm chart", 10).is_empty());
        assert!(r.query("the and of", 10).is_empty());
    }

    #[test]
    fn test_term_frequency_raises_score() {
        let mut r = SparseRetriever::new();
        r.index(&[
            chunk("once", "invoice sent monthly"),
            chunk("twice", "invoice invoice monthly"),
        ]);
        let hits = r.query("invoice", 10);
        assert_eq!(hits[0].chunk_id, "twice");
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut r = SparseRetriever::new();
        r.index(&[chunk("c1", "billing plan"), chunk("c2", "billing plan"), chunk("c3", "billing plan")]);
        let ids: Vec<String> = r.query("billing", 10).into_iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_truncates_to_k() {
        let mut r = SparseRetriever::new();
        let chunks: Vec<Chunk> = (0..20).map(|i| chunk(&format!("c{}", i), "api key rotation")).collect();
        r.index(&chunks);
        assert_eq!(r.query("api", 5).len(), 5);
    }

    #[test]
    fn test_reindex_replaces_contents() {
        let mut r = indexed();
        r.index(&[chunk("new", "two factor authentication")]);
        assert_eq!(r.len(), 1);
        assert!(r.query("password", 10).is_empty());
        assert_eq!(r.query("authentication", 10)[0].chunk_id, "new");
    }

    #[test]
    fn test_custom_stopwords() {
        let mut r = SparseRetriever::new().with_stopwords(["billing"]);
        r.index(&[chunk("c1", "billing plan")]);
        assert!(r.query("billing", 10).is_empty());
        assert_eq!(r.query("plan", 10).len(), 1);
    }

    #[test]
    fn test_query_many_takes_best_phrasing() {
        let r = indexed();
        let single = r.query("forgot password", 10);
        let many = r.query_many(&["forgot password", "csv export"], 10);

        let ids: Vec<&str> = many.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"password") && ids.contains(&"export"));
        let password = many.iter().find(|h| h.chunk_id == "password").unwrap();
        assert!((password.score - single[0].score).abs() < 1e-12);
    }

    #[test]
    fn test_deterministic() {
        let r = indexed();
        assert_eq!(r.query("reset password login", 10), r.query("reset password login", 10));
    }
}

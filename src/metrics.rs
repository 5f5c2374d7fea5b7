//! In-process request metrics for `/stats`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Requests kept for latency and confidence averages.
const DEFAULT_HISTORY: usize = 1000;

/// One finished request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSample {
    pub latency_ms: u64,
    pub retrieval_ms: Option<u64>,
    pub generation_ms: Option<u64>,
    pub confidence: f64,
    pub intent: String,
    pub cache_hit: bool,
    pub escalated: bool,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub avg_retrieval_ms: f64,
    pub avg_generation_ms: f64,
    pub avg_confidence: f64,
    pub cache_hit_rate: f64,
    pub escalation_rate: f64,
    pub requests_per_intent: BTreeMap<String, u64>,
}

struct MetricsState {
    total: u64,
    cache_hits: u64,
    escalations: u64,
    errors: u64,
    per_intent: BTreeMap<String, u64>,
    history: VecDeque<RequestSample>,
}

pub struct Metrics {
    max_history: usize,
    state: Mutex<MetricsState>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl Metrics {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            state: Mutex::new(MetricsState {
                total: 0,
                cache_hits: 0,
                escalations: 0,
                errors: 0,
                per_intent: BTreeMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    pub fn record(&self, sample: RequestSample) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.total += 1;
        if sample.cache_hit {
            state.cache_hits += 1;
        }
        if sample.escalated {
            state.escalations += 1;
        }
        if sample.error {
            state.errors += 1;
        }
        *state.per_intent.entry(sample.intent.clone()).or_insert(0) += 1;

        state.history.push_back(sample);
        while state.history.len() > self.max_history {
            state.history.pop_front();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let rate = |count: u64| {
            if state.total == 0 {
                0.0
            } else {
                count as f64 / state.total as f64
            }
        };

        let mut latencies: Vec<u64> = state.history.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        let p95_latency_ms = if latencies.is_empty() {
            0
        } else {
            let idx = ((latencies.len() as f64) * 0.95).ceil() as usize;
            latencies[idx.saturating_sub(1).min(latencies.len() - 1)]
        };

        MetricsSnapshot {
            total_requests: state.total,
            errors: state.errors,
            avg_latency_ms: mean(state.history.iter().map(|s| s.latency_ms as f64)),
            p95_latency_ms,
            avg_retrieval_ms: mean(state.history.iter().filter_map(|s| s.retrieval_ms).map(|v| v as f64)),
            avg_generation_ms: mean(state.history.iter().filter_map(|s| s.generation_ms).map(|v| v as f64)),
            avg_confidence: mean(state.history.iter().map(|s| s.confidence)),
            cache_hit_rate: rate(state.cache_hits),
            escalation_rate: rate(state.escalations),
            requests_per_intent: state.per_intent.clone(),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(latency_ms: u64, intent: &str, cache_hit: bool, escalated: bool) -> RequestSample {
        RequestSample {
            latency_ms,
            retrieval_ms: Some(latency_ms / 2),
            generation_ms: None,
            confidence: 0.8,
            intent: intent.to_string(),
            cache_hit,
            escalated,
            error: false,
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = Metrics::default().snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.p95_latency_ms, 0);
        assert_eq!(snapshot.cache_hit_rate, 0.0);
    }

    #[test]
    fn test_rates_and_percentile() {
        let metrics = Metrics::default();
        for i in 1..=20 {
            metrics.record(sample(i * 10, "question", i % 4 == 0, i % 5 == 0));
        }
        metrics.record(sample(5, "greeting", false, false));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 21);
        assert_eq!(snapshot.requests_per_intent["question"], 20);
        assert_eq!(snapshot.requests_per_intent["greeting"], 1);
        assert!((snapshot.cache_hit_rate - 5.0 / 21.0).abs() < 1e-9);
        assert!((snapshot.escalation_rate - 4.0 / 21.0).abs() < 1e-9);
        assert_eq!(snapshot.p95_latency_ms, 190);
        assert_eq!(snapshot.avg_generation_ms, 0.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = Metrics::new(2);
        metrics.record(sample(1000, "question", false, false));
        metrics.record(sample(10, "question", false, false));
        metrics.record(sample(20, "question", false, false));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert!((snapshot.avg_latency_ms - 15.0).abs() < 1e-9);
    }
}

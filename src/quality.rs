//! Answer confidence and the quality gate.

use std::collections::HashSet;

use serde::Serialize;

use support_harness_core::sparse::DEFAULT_STOPWORDS;

use crate::config::QualityConfig;
use crate::retrieval::Evidence;

/// Answers shorter than this (in characters) are treated as unhelpful.
const MIN_ANSWER_CHARS: usize = 20;

/// Answers with less of their vocabulary found in the evidence are treated
/// as unsupported by it.
pub const MIN_GROUNDING: f64 = 0.4;
const UNGROUNDED_CAP: f64 = 0.3;

const HEDGING_PHRASES: &[&str] = &[
    "i don't know",
    "i do not know",
    "i'm not sure",
    "i am not sure",
    "i cannot help",
    "i can't help",
    "i don't have information",
    "i do not have information",
];

/// Where the quality gate sends an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityVerdict {
    Respond,
    /// Delivered, but queued for human review.
    RespondFlagged,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub confidence_threshold: f64,
    pub escalation_threshold: f64,
}

impl QualityGate {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            escalation_threshold: config.escalation_threshold,
        }
    }

    /// Both bounds are inclusive on the upper side: a confidence exactly at
    /// a threshold takes the better outcome.
    pub fn judge(&self, confidence: f64) -> QualityVerdict {
        if confidence >= self.confidence_threshold {
            QualityVerdict::Respond
        } else if confidence >= self.escalation_threshold {
            QualityVerdict::RespondFlagged
        } else {
            QualityVerdict::Escalate
        }
    }
}

/// Groundedness estimate for an answer the generator did not score.
///
/// `top fused score + min(0.15, 0.03 × evidence count) + 0.1 × grounding`,
/// capped at 0.95, where grounding is the share of the answer's content
/// words that occur in the evidence. An answer with grounding below
/// [`MIN_GROUNDING`] is capped at `0.3 × grounding / MIN_GROUNDING`, so a
/// fully unsupported answer scores 0. Short or hedging answers are capped
/// at 0.3 and answers without evidence score 0.4.
pub fn estimate_confidence(answer: &str, evidence: &[Evidence]) -> f64 {
    let Some(top) = evidence.first() else {
        return 0.4;
    };

    let source_bonus = (evidence.len() as f64 * 0.03).min(0.15);
    let grounding = grounding(answer, evidence);

    let mut confidence = (top.score + source_bonus + grounding * 0.1).min(0.95);

    if grounding < MIN_GROUNDING {
        confidence = confidence.min(UNGROUNDED_CAP * grounding / MIN_GROUNDING);
    }
    if answer.trim().chars().count() < MIN_ANSWER_CHARS || is_hedging(answer) {
        confidence = confidence.min(0.3);
    }

    confidence.max(0.0)
}

/// Share of the answer's content words that also occur in the evidence.
/// An answer with no content words has no support.
pub fn grounding(answer: &str, evidence: &[Evidence]) -> f64 {
    let answer_terms = content_terms(answer);
    if answer_terms.is_empty() {
        return 0.0;
    }
    let evidence_terms: HashSet<String> = evidence.iter().flat_map(|e| content_terms(&e.text)).collect();
    answer_terms.intersection(&evidence_terms).count() as f64 / answer_terms.len() as f64
}

pub fn is_hedging(answer: &str) -> bool {
    let lower = answer.to_lowercase().replace('\u{2019}', "'");
    HEDGING_PHRASES.iter().any(|p| lower.contains(p))
}

fn content_terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1 && !DEFAULT_STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

//! Human handoff: escalation reasons, priority, and the handoff package.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::retrieval::Evidence;

/// Evidence previews carried into a handoff.
const MAX_HANDOFF_EVIDENCE: usize = 5;
const PREVIEW_CHARS: usize = 200;

const SECURITY_MARKERS: &[&str] = &[
    "hacked",
    "security breach",
    "data breach",
    "unauthorized access",
    "compromised",
    "fraud",
    "phishing",
];

const URGENCY_MARKERS: &[&str] = &["urgent", "emergency", "asap", "immediately", "right now"];

const FRUSTRATION_MARKERS: &[&str] = &[
    "frustrated",
    "angry",
    "unacceptable",
    "ridiculous",
    "terrible",
    "worst",
    "furious",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Neither retriever found anything.
    NoEvidence,
    /// Passages came back, but none shares a term with the question or
    /// clears the similarity floor.
    LowRelevance,
    /// The answer scored below the escalation threshold.
    LowConfidence,
    /// Every credential failed or the generator errored or timed out.
    GenerationUnavailable,
    /// The customer asked for a person.
    UserRequest,
}

impl EscalationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationReason::NoEvidence => "no_results",
            EscalationReason::LowRelevance => "low_relevance",
            EscalationReason::LowConfidence => "low_confidence",
            EscalationReason::GenerationUnavailable => "generation_unavailable",
            EscalationReason::UserRequest => "user_request",
        }
    }

    fn base_priority(self) -> Priority {
        match self {
            EscalationReason::UserRequest => Priority::Normal,
            _ => Priority::Medium,
        }
    }
}

/// Queue priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Normal,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Normal => "normal",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::Critical => "Critical",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Normal => "Normal",
        }
    }
}

/// Security concerns outrank urgency and frustration, which outrank a very
/// low confidence; otherwise the reason decides.
pub fn priority_for(reason: EscalationReason, query: &str, confidence: Option<f64>) -> Priority {
    let lower = query.to_lowercase();
    let mentions = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if mentions(SECURITY_MARKERS) {
        Priority::Critical
    } else if mentions(URGENCY_MARKERS) || mentions(FRUSTRATION_MARKERS) {
        Priority::High
    } else if confidence.is_some_and(|c| c < 0.3) {
        Priority::Medium
    } else {
        reason.base_priority()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidencePreview {
    pub source: String,
    pub content_preview: String,
    pub relevance_score: f64,
}

impl EvidencePreview {
    fn from_evidence(evidence: &Evidence) -> Self {
        let content_preview = if evidence.text.chars().count() > PREVIEW_CHARS {
            let cut: String = evidence.text.chars().take(PREVIEW_CHARS).collect();
            format!("{}...", cut)
        } else {
            evidence.text.clone()
        };
        Self {
            source: evidence.source_document.clone(),
            content_preview,
            relevance_score: evidence.score,
        }
    }
}

/// Everything a human agent needs to pick the conversation up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Handoff {
    pub ticket_id: String,
    pub reason: EscalationReason,
    pub priority: Priority,
    pub query: String,
    /// Best-available partial answer, if generation got that far.
    pub partial_answer: Option<String>,
    pub confidence: Option<f64>,
    pub evidence: Vec<EvidencePreview>,
    pub created_at: DateTime<Utc>,
}

impl Handoff {
    pub fn new(
        ticket_id: String,
        reason: EscalationReason,
        query: &str,
        partial_answer: Option<String>,
        confidence: Option<f64>,
        evidence: &[Evidence],
    ) -> Self {
        Self {
            ticket_id,
            reason,
            priority: priority_for(reason, query, confidence),
            query: query.to_string(),
            partial_answer,
            confidence,
            evidence: evidence
                .iter()
                .take(MAX_HANDOFF_EVIDENCE)
                .map(EvidencePreview::from_evidence)
                .collect(),
            created_at: Utc::now(),
        }
    }

    /// The message shown to the customer.
    pub fn customer_message(&self) -> String {
        let found = match &self.partial_answer {
            Some(answer) if !answer.trim().is_empty() => answer.clone(),
            _ => "No relevant information found.".to_string(),
        };
        format!(
            "I apologize, but I wasn't able to fully resolve your question.\n\n\
             I've escalated this to our support team and they'll follow up with you shortly.\n\n\
             **Ticket ID**: {}\n\
             **Priority**: {}\n\n\
             In the meantime, here's what I found that might help:\n{}\n\n\
             Our team will reach out to you soon. Is there anything else I can help with?",
            self.ticket_id,
            self.priority.label(),
            found
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(i: usize, text: &str) -> Evidence {
        Evidence {
            chunk_id: format!("doc{}#0", i),
            source_document: format!("doc{}", i),
            text: text.to_string(),
            score: 1.0 - i as f64 * 0.1,
            dense_score: None,
            sparse_score: None,
            dense_similarity: None,
            bm25_score: None,
            dense_rank: None,
            sparse_rank: None,
            rerank_score: None,
        }
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(
            priority_for(EscalationReason::UserRequest, "my account was hacked, urgent", None),
            Priority::Critical
        );
        assert_eq!(
            priority_for(EscalationReason::UserRequest, "this is urgent", None),
            Priority::High
        );
        assert_eq!(
            priority_for(EscalationReason::LowConfidence, "how do exports work", Some(0.2)),
            Priority::Medium
        );
        assert_eq!(
            priority_for(EscalationReason::NoEvidence, "how do exports work", None),
            Priority::Medium
        );
        assert_eq!(
            priority_for(EscalationReason::UserRequest, "can I talk to a person", None),
            Priority::Normal
        );
    }

    #[test]
    fn test_handoff_limits_and_truncates_evidence() {
        let long = "x".repeat(250);
        let items: Vec<Evidence> = (0..7).map(|i| evidence(i, &long)).collect();
        let handoff = Handoff::new(
            "abc12345".into(),
            EscalationReason::LowConfidence,
            "q",
            None,
            Some(0.4),
            &items,
        );
        assert_eq!(handoff.evidence.len(), 5);
        assert_eq!(handoff.evidence[0].content_preview.chars().count(), 203);
        assert!(handoff.evidence[0].content_preview.ends_with("..."));
    }

    #[test]
    fn test_customer_message() {
        let handoff = Handoff::new(
            "abc12345".into(),
            EscalationReason::NoEvidence,
            "where is my parcel",
            None,
            None,
            &[],
        );
        let message = handoff.customer_message();
        assert!(message.contains("**Ticket ID**: abc12345"));
        assert!(message.contains("**Priority**: Medium"));
        assert!(message.contains("No relevant information found."));
    }
}

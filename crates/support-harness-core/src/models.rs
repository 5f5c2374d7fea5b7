//! Core data models shared by the retrieval, caching, and routing layers.
//!
//! These types represent the chunks, retrieval hits, and routing decisions
//! that flow through a single support query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw knowledge-base document before chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Stable document identifier (e.g. `billing/refunds`).
    pub id: String,
    /// Full markdown body.
    pub text: String,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A contiguous slice of a document's text.
///
/// Chunks are immutable once built. `char_start` and `char_end` are
/// character offsets into the source text (end-exclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source_document: String,
    pub position: usize,
    pub char_start: usize,
    pub char_end: usize,
    /// SHA-256 of `text`, used to detect stale embeddings.
    pub hash: String,
}

/// Which retriever produced a [`RetrievalResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverKind {
    Dense,
    Sparse,
}

/// A single ranked hit from one retriever.
///
/// Score semantics depend on `retriever_kind`: cosine similarity for
/// dense hits, BM25 for sparse hits. Scores are only comparable within
/// one result list until normalized by fusion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub score: f64,
    pub retriever_kind: RetrieverKind,
}

/// Conversational or product intent assigned by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Farewell,
    Appreciation,
    SmallTalk,
    Chitchat,
    /// A genuine product question that needs retrieval.
    Question,
}

impl Intent {
    /// Whether this intent is answered with a fixed reply and no retrieval.
    pub fn is_conversational(self) -> bool {
        !matches!(self, Intent::Question)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::Farewell => "farewell",
            Intent::Appreciation => "appreciation",
            Intent::SmallTalk => "small_talk",
            Intent::Chitchat => "chitchat",
            Intent::Question => "question",
        }
    }

    /// Parse an intent label as produced by an external classifier.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "greeting" => Some(Intent::Greeting),
            "farewell" => Some(Intent::Farewell),
            "appreciation" => Some(Intent::Appreciation),
            "small_talk" | "smalltalk" => Some(Intent::SmallTalk),
            "chitchat" | "off_topic" => Some(Intent::Chitchat),
            "question" | "complaint" | "request" | "feedback" => Some(Intent::Question),
            _ => None,
        }
    }

    /// The fixed reply used on the direct-reply fast path.
    pub fn canned_reply(self) -> &'static str {
        match self {
            Intent::Greeting => {
                "Hi there! I'm the support assistant. Ask me anything about your account, billing, or product features."
            }
            Intent::Farewell => "Goodbye! If anything else comes up, just send a message.",
            Intent::Appreciation => "You're welcome! Let me know if there's anything else I can help with.",
            Intent::SmallTalk => {
                "I'm an AI support assistant and I'm here to help with questions about the product. What can I help you with?"
            }
            Intent::Chitchat => {
                "I'm best at product questions. Try asking about billing, accounts, integrations, or settings."
            }
            Intent::Question => "",
        }
    }
}

/// Complexity tier for non-conversational queries.
///
/// Drives cache threshold choice, retrieval candidate sizing, and the
/// generation model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Moderate => "moderate",
            ComplexityTier::Complex => "complex",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(ComplexityTier::Simple),
            "moderate" | "standard" => Some(ComplexityTier::Moderate),
            "complex" | "specialized" => Some(ComplexityTier::Complex),
            _ => None,
        }
    }
}

/// Per-query routing decision. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterDecision {
    pub intent: Intent,
    pub complexity_tier: ComplexityTier,
    /// The normalized table phrase that matched on the pattern tier.
    pub matched_pattern: Option<String>,
    /// The user explicitly asked for a human or flagged urgency.
    pub handoff_requested: bool,
}

impl RouterDecision {
    pub fn is_direct_reply(&self) -> bool {
        self.intent.is_conversational()
    }
}

/// One completed exchange, handed to the ticketing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub escalated: bool,
    pub confidence: f64,
    pub user_id: Option<String>,
    pub ticket_id: Option<String>,
    pub sources: Vec<String>,
    pub escalation_reason: Option<String>,
}

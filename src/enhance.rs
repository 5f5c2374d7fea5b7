//! Query enhancement before retrieval.
//!
//! A [`QueryEnhancer`] rewrites the customer's question into extra
//! retrieval texts: alternative phrasings (multi-query) and, for complex
//! questions, a hypothetical documentation passage whose embedding tends
//! to land nearer the real answer than the question does. The
//! [`ExpansionPlan`] for the question's tier decides which are asked for.
//!
//! Enhancement is best effort. The graph retrieves with the original
//! question alone whenever the enhancer fails or times out.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use support_harness_core::models::ComplexityTier;

use crate::config::GenerationConfig;
use crate::generation::{chat_completion, chat_endpoint, CredentialPool};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("query enhancement failed: {0}")]
pub struct EnhanceError(pub String);

/// Which expansions to request for a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionPlan {
    pub multi_query: bool,
    pub hypothetical_document: bool,
}

impl ExpansionPlan {
    /// Simple questions retrieve as asked; moderate ones get rephrasings;
    /// complex ones also get a hypothetical answer.
    pub fn for_tier(tier: ComplexityTier) -> Self {
        match tier {
            ComplexityTier::Simple => Self {
                multi_query: false,
                hypothetical_document: false,
            },
            ComplexityTier::Moderate => Self {
                multi_query: true,
                hypothetical_document: false,
            },
            ComplexityTier::Complex => Self {
                multi_query: true,
                hypothetical_document: true,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.multi_query && !self.hypothetical_document
    }
}

/// Extra retrieval texts for one question. The original question is not
/// repeated here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnhancedQuery {
    pub variations: Vec<String>,
    pub hypothetical_document: Option<String>,
}

impl EnhancedQuery {
    /// Texts embedded for the dense side: the original, every variation,
    /// then the hypothetical document.
    pub fn dense_texts(&self, original: &str) -> Vec<String> {
        let mut texts = self.sparse_texts(original);
        texts.extend(self.hypothetical_document.iter().cloned());
        texts
    }

    /// Texts scored by BM25. The hypothetical document is left out: its
    /// invented wording would match on terms the customer never used.
    pub fn sparse_texts(&self, original: &str) -> Vec<String> {
        std::iter::once(original.to_string())
            .chain(self.variations.iter().cloned())
            .collect()
    }
}

#[async_trait]
pub trait QueryEnhancer: Send + Sync {
    async fn enhance(&self, query: &str, plan: ExpansionPlan) -> Result<EnhancedQuery, EnhanceError>;
}

const MULTI_QUERY_PROMPT: &str = "You help improve search over SaaS support documentation.
Rewrite the customer's question as alternative phrasings that could retrieve the relevant documentation.
Vary terminology, synonyms and perspective.
Reply with one phrasing per line, without numbering or commentary.";

const HYPOTHETICAL_PROMPT: &str = "You are a SaaS customer support expert.
Write a short passage, as it might appear in the support documentation, that answers the customer's question.
Use common support terminology.";

/// Enhancer backed by the chat endpoint, using the fast model and the
/// shared credential pool.
pub struct LlmQueryEnhancer {
    endpoint: String,
    model: String,
    max_variations: usize,
    client: reqwest::Client,
    pool: Arc<CredentialPool>,
}

impl LlmQueryEnhancer {
    pub fn new(config: &GenerationConfig, pool: Arc<CredentialPool>, max_variations: usize) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            endpoint: chat_endpoint(&config.url),
            model: config.models.simple.clone(),
            max_variations: max_variations.max(1),
            client,
            pool,
        })
    }

    async fn complete(&self, system: &str, query: &str, temperature: f64) -> Result<String, EnhanceError> {
        let lease = self
            .pool
            .lease()
            .ok_or_else(|| EnhanceError("no credential available".into()))?;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": query}
            ]
        });

        chat_completion(&self.client, &self.endpoint, &lease.credential.secret, &body)
            .await
            .map_err(|e| {
                if e.is_credential_error() {
                    self.pool.mark_exhausted(lease.index);
                }
                EnhanceError(e.to_string())
            })
    }
}

#[async_trait]
impl QueryEnhancer for LlmQueryEnhancer {
    async fn enhance(&self, query: &str, plan: ExpansionPlan) -> Result<EnhancedQuery, EnhanceError> {
        if plan.is_empty() {
            return Ok(EnhancedQuery::default());
        }

        let variations = async {
            if plan.multi_query {
                Some(self.complete(MULTI_QUERY_PROMPT, query, 0.7).await)
            } else {
                None
            }
        };
        let hypothetical = async {
            if plan.hypothetical_document {
                Some(self.complete(HYPOTHETICAL_PROMPT, query, 0.7).await)
            } else {
                None
            }
        };
        let (variations, hypothetical) = tokio::join!(variations, hypothetical);

        let mut enhanced = EnhancedQuery::default();
        let mut last_error = None;

        match variations {
            Some(Ok(text)) => enhanced.variations = parse_variations(&text, query, self.max_variations),
            Some(Err(e)) => {
                warn!("multi-query expansion failed: {}", e);
                last_error = Some(e);
            }
            None => {}
        }
        match hypothetical {
            Some(Ok(text)) if !text.trim().is_empty() => {
                enhanced.hypothetical_document = Some(text.trim().to_string())
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("hypothetical document generation failed: {}", e);
                last_error = Some(e);
            }
            None => {}
        }

        match last_error {
            Some(e) if enhanced == EnhancedQuery::default() => Err(e),
            _ => Ok(enhanced),
        }
    }
}

/// One phrasing per line, list markers stripped, repeats and echoes of
/// the original dropped, at most `max` kept.
pub fn parse_variations(text: &str, original: &str, max: usize) -> Vec<String> {
    let original = original.trim().to_lowercase();
    let mut variations: Vec<String> = Vec::new();

    for line in text.lines() {
        let line = strip_list_marker(line.trim()).trim_matches('"').trim();
        if line.is_empty() || line.to_lowercase() == original {
            continue;
        }
        if variations.iter().any(|v| v.eq_ignore_ascii_case(line)) {
            continue;
        }
        variations.push(line.to_string());
        if variations.len() == max {
            break;
        }
    }
    variations
}

/// `"1. x"`, `"2) x"`, `"- x"` and `"* x"` become `"x"`. A leading number
/// without a marker (`"2FA setup"`) is kept.
fn strip_list_marker(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        return rest.trim_start();
    }
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_by_tier() {
        assert!(ExpansionPlan::for_tier(ComplexityTier::Simple).is_empty());

        let moderate = ExpansionPlan::for_tier(ComplexityTier::Moderate);
        assert!(moderate.multi_query);
        assert!(!moderate.hypothetical_document);

        let complex = ExpansionPlan::for_tier(ComplexityTier::Complex);
        assert!(complex.multi_query && complex.hypothetical_document);
    }

    #[test]
    fn test_texts_per_retriever() {
        let enhanced = EnhancedQuery {
            variations: vec!["change my password".into()],
            hypothetical_document: Some("Open Settings and choose Security.".into()),
        };
        assert_eq!(
            enhanced.sparse_texts("reset password"),
            vec!["reset password", "change my password"]
        );
        assert_eq!(
            enhanced.dense_texts("reset password"),
            vec!["reset password", "change my password", "Open Settings and choose Security."]
        );
        assert_eq!(EnhancedQuery::default().dense_texts("hi"), vec!["hi"]);
    }

    #[test]
    fn test_parse_variations_strips_markers_and_repeats() {
        let reply = "1. How can I change my password?\n\
                     - how can i change my password?\n\
                     \n\
                     * \"I forgot my login credentials\"\n\
                     How do I reset my password?\n\
                     Recover account access\n\
                     One more";
        let variations = parse_variations(reply, "How do I reset my password?", 3);
        assert_eq!(
            variations,
            vec![
                "How can I change my password?",
                "I forgot my login credentials",
                "Recover account access",
            ]
        );
    }

    #[test]
    fn test_list_marker_needs_punctuation() {
        assert_eq!(strip_list_marker("2) Enable 2FA"), "Enable 2FA");
        assert_eq!(strip_list_marker("2FA setup"), "2FA setup");
        assert_eq!(strip_list_marker("• Billing help"), "Billing help");
    }

    #[test]
    fn test_parse_variations_of_empty_reply() {
        assert!(parse_variations("\n  \n", "anything", 3).is_empty());
    }

    #[tokio::test]
    async fn test_llm_enhancer_without_credentials_fails() {
        let pool = Arc::new(CredentialPool::new(Vec::new(), std::time::Duration::ZERO));
        let enhancer = LlmQueryEnhancer::new(&GenerationConfig::default(), pool, 3).unwrap();

        let err = enhancer
            .enhance("How do I export data?", ExpansionPlan::for_tier(ComplexityTier::Moderate))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no credential"));

        let skipped = enhancer
            .enhance("Hi", ExpansionPlan::for_tier(ComplexityTier::Simple))
            .await
            .unwrap();
        assert_eq!(skipped, EnhancedQuery::default());
    }
}

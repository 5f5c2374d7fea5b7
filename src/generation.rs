//! Answer generation.
//!
//! The [`Generator`] trait is the seam to the language model. Two
//! implementations ship:
//! - **[`OpenAIChatGenerator`]**: any OpenAI-compatible
//!   `/chat/completions` endpoint, one model per complexity tier.
//! - **[`ExtractiveGenerator`]**: offline; stitches the top evidence
//!   passages into an answer. Needs no credentials.
//!
//! API keys live in a [`CredentialPool`] that the orchestration graph
//! owns and leases from. A quota or auth failure marks the leased key
//! exhausted for a cool-down period so concurrent requests skip it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use support_harness_core::models::{ComplexityTier, Intent};
use support_harness_core::router::{Classification, ClassifierError, IntentClassifier};

use crate::config::{GenerationConfig, ModelTiers};
use crate::retrieval::Evidence;

/// Failure reported by a generator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Rate limit or quota hit on the leased credential.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The leased credential was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("generation timed out")]
    Timeout,
    #[error("generation failed: {0}")]
    Other(String),
}

impl GenerationError {
    /// Errors that a different credential might fix.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, GenerationError::QuotaExceeded(_) | GenerationError::Auth(_))
    }
}

/// Generated answer text and the generator's own confidence, if it has one.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub confidence: Option<f64>,
    pub model: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Whether calls need a leased credential.
    fn needs_credential(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        query: &str,
        evidence: &[Evidence],
        tier: ComplexityTier,
        credential: Option<&Credential>,
    ) -> Result<GenerationOutput, GenerationError>;
}

// ============ Credentials ============

/// One API key. `Debug` never prints the secret.
#[derive(Clone)]
pub struct Credential {
    pub name: String,
    pub secret: String,
}

impl Credential {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A credential handed out by [`CredentialPool::lease`].
#[derive(Debug, Clone)]
pub struct Lease {
    pub index: usize,
    pub credential: Credential,
}

struct PoolState {
    cursor: usize,
    exhausted_at: Vec<Option<Instant>>,
}

/// Round-robin pool of API keys with per-key exhaustion cool-down.
///
/// Selection and marking happen under one mutex, so two concurrent
/// requests never both pick a key the other has just marked exhausted.
pub struct CredentialPool {
    credentials: Vec<Credential>,
    cooldown: Duration,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>, cooldown: Duration) -> Self {
        let n = credentials.len();
        Self {
            credentials,
            cooldown,
            state: Mutex::new(PoolState {
                cursor: 0,
                exhausted_at: vec![None; n],
            }),
        }
    }

    /// Build from environment variables, skipping unset or empty ones.
    pub fn from_env(names: &[String], cooldown: Duration) -> Self {
        let mut credentials = Vec::new();
        for name in names {
            match std::env::var(name) {
                Ok(secret) if !secret.trim().is_empty() => {
                    credentials.push(Credential::new(name.clone(), secret))
                }
                _ => tracing::warn!(env = %name, "credential environment variable not set; skipping"),
            }
        }
        Self::new(credentials, cooldown)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Next usable credential in round-robin order, or `None` when every
    /// credential is cooling down.
    pub fn lease(&self) -> Option<Lease> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let n = self.credentials.len();
        let now = Instant::now();

        for step in 0..n {
            let index = (state.cursor + step) % n;
            let usable = match state.exhausted_at[index] {
                None => true,
                Some(at) => now.duration_since(at) >= self.cooldown,
            };
            if usable {
                state.exhausted_at[index] = None;
                state.cursor = (index + 1) % n;
                return Some(Lease {
                    index,
                    credential: self.credentials[index].clone(),
                });
            }
        }
        None
    }

    pub fn mark_exhausted(&self, index: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = state.exhausted_at.get_mut(index) {
            *slot = Some(Instant::now());
            tracing::warn!(credential = %self.credentials[index].name, "credential marked exhausted");
        }
    }

    /// Credentials not currently cooling down.
    pub fn available(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        state
            .exhausted_at
            .iter()
            .filter(|slot| match slot {
                None => true,
                Some(at) => now.duration_since(*at) >= self.cooldown,
            })
            .count()
    }
}

// ============ OpenAI-compatible chat ============

const ANSWER_PROMPT: &str = "You are a helpful SaaS customer support agent. Answer the customer's question using ONLY the provided documentation.

Rules:
1. Base your answer only on the documentation below.
2. If the documentation does not contain the answer, say so clearly.
3. Be concise but thorough, with specific steps where they apply.
4. Use a friendly, professional tone.";

pub struct OpenAIChatGenerator {
    endpoint: String,
    models: ModelTiers,
    temperature: f64,
    client: reqwest::Client,
}

impl OpenAIChatGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            endpoint: chat_endpoint(&config.url),
            models: config.models.clone(),
            temperature: config.temperature,
            client,
        })
    }
}

pub(crate) fn chat_endpoint(base: &str) -> String {
    format!("{}/chat/completions", base.trim_end_matches('/'))
}

/// Render evidence as numbered source blocks for the prompt.
pub fn build_context(evidence: &[Evidence]) -> String {
    if evidence.is_empty() {
        return "No relevant documentation found.".to_string();
    }
    evidence
        .iter()
        .enumerate()
        .map(|(i, e)| format!("[Source {} - {}]\n{}\n", i + 1, e.source_document, e.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Generator for OpenAIChatGenerator {
    async fn generate(
        &self,
        query: &str,
        evidence: &[Evidence],
        tier: ComplexityTier,
        credential: Option<&Credential>,
    ) -> Result<GenerationOutput, GenerationError> {
        let credential =
            credential.ok_or_else(|| GenerationError::Auth("no credential supplied".into()))?;
        let model = self.models.for_tier(tier).to_string();

        let body = serde_json::json!({
            "model": model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": ANSWER_PROMPT},
                {
                    "role": "user",
                    "content": format!(
                        "Relevant documentation:\n{}\n\nCustomer question: {}",
                        build_context(evidence),
                        query
                    )
                }
            ]
        });

        let text = chat_completion(&self.client, &self.endpoint, &credential.secret, &body).await?;
        Ok(GenerationOutput {
            text,
            confidence: None,
            model,
        })
    }
}

pub(crate) async fn chat_completion(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    body: &serde_json::Value,
) -> Result<String, GenerationError> {
    let response = client
        .post(endpoint)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::Other(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, body_text);
        return Err(match status.as_u16() {
            429 => GenerationError::QuotaExceeded(message),
            401 | 403 => GenerationError::Auth(message),
            _ => GenerationError::Other(message),
        });
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| GenerationError::Other(e.to_string()))?;
    parse_chat_response(&json)
}

/// Extracts `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, GenerationError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| GenerationError::Other("invalid chat response: missing content".into()))
}

// ============ Extractive ============

/// Answers with the top evidence passages verbatim.
pub struct ExtractiveGenerator {
    max_passages: usize,
}

impl ExtractiveGenerator {
    pub fn new(max_passages: usize) -> Self {
        Self {
            max_passages: max_passages.max(1),
        }
    }
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn needs_credential(&self) -> bool {
        false
    }

    async fn generate(
        &self,
        _query: &str,
        evidence: &[Evidence],
        _tier: ComplexityTier,
        _credential: Option<&Credential>,
    ) -> Result<GenerationOutput, GenerationError> {
        if evidence.is_empty() {
            return Err(GenerationError::Other("no evidence to extract from".into()));
        }

        let passages: Vec<String> = evidence
            .iter()
            .take(self.max_passages)
            .map(|e| e.text.trim().to_string())
            .collect();

        Ok(GenerationOutput {
            text: format!(
                "Here's what I found in our documentation:\n\n{}",
                passages.join("\n\n")
            ),
            confidence: None,
            model: "extractive".to_string(),
        })
    }
}

// ============ Intent classification ============

const CLASSIFY_PROMPT: &str = "Classify this customer support message. Respond with ONLY a JSON object:
{\"intent\": \"question\" | \"greeting\" | \"farewell\" | \"appreciation\" | \"small_talk\" | \"chitchat\",
 \"complexity\": \"simple\" | \"moderate\" | \"complex\"}

simple: FAQs, yes/no questions, basic lookups.
moderate: how-to questions and information retrieval.
complex: multi-step issues, troubleshooting, anything needing reasoning.";

/// Router classifier backed by the chat endpoint, using the fast model.
pub struct LlmIntentClassifier {
    endpoint: String,
    model: String,
    client: reqwest::Client,
    pool: Arc<CredentialPool>,
}

impl LlmIntentClassifier {
    pub fn new(config: &GenerationConfig, pool: Arc<CredentialPool>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            endpoint: chat_endpoint(&config.url),
            model: config.models.simple.clone(),
            client,
            pool,
        })
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, query: &str) -> Result<Classification, ClassifierError> {
        let lease = self
            .pool
            .lease()
            .ok_or_else(|| ClassifierError("no credential available".into()))?;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                {"role": "system", "content": CLASSIFY_PROMPT},
                {"role": "user", "content": query}
            ]
        });

        let text = chat_completion(&self.client, &self.endpoint, &lease.credential.secret, &body)
            .await
            .map_err(|e| {
                if e.is_credential_error() {
                    self.pool.mark_exhausted(lease.index);
                }
                ClassifierError(e.to_string())
            })?;

        parse_classification(&text)
    }
}

/// Parse the classifier's JSON verdict, tolerating surrounding prose or
/// code fences.
pub fn parse_classification(text: &str) -> Result<Classification, ClassifierError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json_str = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(ClassifierError(format!("no JSON object in reply: {}", text))),
    };

    let json: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| ClassifierError(e.to_string()))?;

    let intent = json
        .get("intent")
        .and_then(|v| v.as_str())
        .and_then(Intent::parse)
        .ok_or_else(|| ClassifierError("missing or unknown intent".into()))?;
    let complexity_tier = json
        .get("complexity")
        .and_then(|v| v.as_str())
        .and_then(ComplexityTier::parse)
        .unwrap_or(ComplexityTier::Moderate);

    Ok(Classification {
        intent,
        complexity_tier,
    })
}

/// Create the generator named by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveGenerator::default())),
        "openai" => Ok(Arc::new(OpenAIChatGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize, cooldown: Duration) -> CredentialPool {
        CredentialPool::new(
            (0..n)
                .map(|i| Credential::new(format!("KEY_{}", i), format!("secret-{}", i)))
                .collect(),
            cooldown,
        )
    }

    fn evidence(doc: &str, text: &str) -> Evidence {
        Evidence {
            chunk_id: format!("{}#0", doc),
            source_document: doc.to_string(),
            text: text.to_string(),
            score: 1.0,
            dense_score: Some(1.0),
            sparse_score: None,
            dense_similarity: Some(0.8),
            bm25_score: None,
            dense_rank: Some(0),
            sparse_rank: None,
            rerank_score: None,
        }
    }

    #[test]
    fn test_pool_round_robin() {
        let pool = pool(3, Duration::from_secs(60));
        let order: Vec<usize> = (0..4).map(|_| pool.lease().unwrap().index).collect();
        assert_eq!(order, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_pool_skips_exhausted() {
        let pool = pool(2, Duration::from_secs(60));
        let first = pool.lease().unwrap();
        pool.mark_exhausted(first.index);
        assert_eq!(pool.available(), 1);

        assert_eq!(pool.lease().unwrap().index, 1);
        assert_eq!(pool.lease().unwrap().index, 1);

        pool.mark_exhausted(1);
        assert!(pool.lease().is_none());
    }

    #[test]
    fn test_pool_cooldown_expires() {
        let pool = pool(1, Duration::ZERO);
        let lease = pool.lease().unwrap();
        pool.mark_exhausted(lease.index);
        assert!(pool.lease().is_some());
    }

    #[test]
    fn test_empty_pool() {
        let pool = CredentialPool::new(Vec::new(), Duration::from_secs(1));
        assert!(pool.is_empty());
        assert!(pool.lease().is_none());
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let debug = format!("{:?}", Credential::new("OPENAI_API_KEY", "sk-very-secret"));
        assert!(debug.contains("OPENAI_API_KEY"));
        assert!(!debug.contains("sk-very-secret"));
    }

    #[tokio::test]
    async fn test_extractive_uses_top_passages() {
        let generator = ExtractiveGenerator::new(2);
        assert!(!generator.needs_credential());

        let out = generator
            .generate(
                "q",
                &[
                    evidence("a", "First passage."),
                    evidence("b", "Second passage."),
                    evidence("c", "Third passage."),
                ],
                ComplexityTier::Simple,
                None,
            )
            .await
            .unwrap();
        assert!(out.text.contains("First passage."));
        assert!(out.text.contains("Second passage."));
        assert!(!out.text.contains("Third passage."));
        assert_eq!(out.model, "extractive");
    }

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "  Go to Settings.  "}}]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "Go to Settings.");
        assert!(parse_chat_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_classification() {
        let c = parse_classification("```json\n{\"intent\": \"question\", \"complexity\": \"complex\"}\n```")
            .unwrap();
        assert_eq!(c.intent, Intent::Question);
        assert_eq!(c.complexity_tier, ComplexityTier::Complex);

        let c = parse_classification("{\"intent\": \"greeting\"}").unwrap();
        assert_eq!(c.intent, Intent::Greeting);
        assert_eq!(c.complexity_tier, ComplexityTier::Moderate);

        assert!(parse_classification("not json").is_err());
        assert!(parse_classification("{\"intent\": \"dance\"}").is_err());
    }

    #[test]
    fn test_build_context_numbers_sources() {
        let context = build_context(&[evidence("billing", "Invoices monthly.")]);
        assert!(context.starts_with("[Source 1 - billing]"));
        assert_eq!(build_context(&[]), "No relevant documentation found.");
    }
}

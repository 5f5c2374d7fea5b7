//! The per-request orchestration state machine.
//!
//! ```text
//! Start → Route ─┬─ DirectReply ───────────────────────────────┐
//!                ├─ Escalate (handoff requested) ──────────────┤
//!                └─ CacheCheck ─┬─ Respond (hit) ──────────────┤
//!                               └─ Retrieve ─┬─ Escalate ──────┤ → End
//!                                            │  (none, or none relevant)
//!                                            └─ Generate ─┬─ Escalate
//!                                                         └─ QualityCheck ─┬─ Respond
//!                                                                          └─ Escalate
//! ```
//!
//! Each state runs one [`SupportGraph::step`] that returns a tagged
//! [`Transition`]; [`advance`] folds the transition's payload into the
//! run and names the next state. Transitions form a DAG, so no state is
//! entered twice for the same query.
//!
//! Collaborator failures never escape: they are mapped to transitions.
//! The only user-visible failure is both retrievers failing, which ends
//! the run with `error: true`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use support_harness_core::cache::{CacheHit, SemanticCache};
use support_harness_core::fusion::{fuse, CandidateSizing, FusionError, FusionParams};
use support_harness_core::models::{ComplexityTier, ConversationTurn, Intent, RetrievalResult, RouterDecision};
use support_harness_core::router::Router;

use crate::config::Config;
use crate::enhance::{EnhancedQuery, ExpansionPlan, QueryEnhancer};
use crate::escalation::{EscalationReason, Handoff};
use crate::generation::{CredentialPool, GenerationError, GenerationOutput, Generator};
use crate::metrics::{Metrics, RequestSample};
use crate::quality::{estimate_confidence, QualityGate, QualityVerdict};
use crate::rerank::{rerank, Reranker};
use crate::retrieval::{distinct_sources, passes_relevance_floor, Evidence, KnowledgeIndex};
use crate::tickets::{TicketSink, TurnRecord};

/// Shown when the run fails for reasons the customer cannot act on.
pub const FAILURE_MESSAGE: &str =
    "I'm sorry, I couldn't process your request right now. Please try again in a moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Start,
    Route,
    DirectReply,
    CacheCheck,
    Retrieve,
    Generate,
    QualityCheck,
    Respond,
    Escalate,
    End,
}

/// The outcome of one state's step.
#[derive(Debug)]
pub enum Transition {
    Started,
    /// Pattern tier (or classifier) chose a conversational intent.
    PatternMatched(RouterDecision),
    HandoffRequested(RouterDecision),
    Routed(RouterDecision),
    Replied(String),
    CacheHit(CacheHit),
    CacheMiss,
    EvidenceFound(RetrievalOutcome),
    NoEvidence(RetrievalOutcome),
    /// Passages came back but none is about the question.
    WeakEvidence(RetrievalOutcome),
    /// Both retrievers failed or timed out.
    RetrievalFailed(String),
    Generated { output: GenerationOutput, elapsed_ms: u64 },
    GenerationUnavailable { reason: String, elapsed_ms: u64 },
    Passed { confidence: f64, flagged: bool },
    BelowThreshold { confidence: f64 },
    Responded,
    Escalated(Handoff),
}

#[derive(Debug)]
pub struct RetrievalOutcome {
    pub evidence: Vec<Evidence>,
    pub elapsed_ms: u64,
}

/// Incoming chat message.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    pub user_id: Option<String>,
    pub ticket_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Exactly one per run.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub response: String,
    pub sources: Vec<String>,
    pub confidence: f64,
    pub escalated: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    pub intent: Intent,
    pub complexity_tier: ComplexityTier,
    pub cache_hit: bool,
    pub flagged_for_review: bool,
    pub escalation_reason: Option<EscalationReason>,
    pub handoff: Option<Handoff>,
    pub ticket_id: String,
    pub model_used: Option<String>,
    pub request_id: String,
    pub latency_ms: u64,
    /// States visited, in order, ending with `End`.
    pub trace: Vec<State>,
}

/// Tunables pulled from [`Config`].
#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub dense_top_k: usize,
    pub sparse_top_k: usize,
    pub fusion: FusionParams,
    pub retrieval_timeout: Duration,
    pub generation_timeout: Duration,
    /// Raw cosine a passage without a BM25 match must reach to count as
    /// relevant.
    pub min_dense_similarity: f64,
    pub cache_threshold: f64,
    pub complex_cache_threshold: f64,
    pub quality: QualityGate,
}

impl GraphSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dense_top_k: config.retrieval.dense_top_k,
            sparse_top_k: config.retrieval.sparse_top_k,
            fusion: config.retrieval.fusion_params(),
            retrieval_timeout: config.retrieval.timeout(),
            generation_timeout: config.generation.timeout(),
            min_dense_similarity: config.retrieval.min_dense_similarity,
            cache_threshold: config.cache.similarity_threshold,
            complex_cache_threshold: config.cache.complex_similarity_threshold,
            quality: QualityGate::new(&config.quality),
        }
    }

    fn cache_threshold_for(&self, tier: ComplexityTier) -> f64 {
        match tier {
            ComplexityTier::Complex => self.complex_cache_threshold,
            _ => self.cache_threshold,
        }
    }
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Collaborators the graph is wired to.
pub struct GraphDeps {
    pub router: Router,
    /// `None` disables caching.
    pub cache: Option<Arc<SemanticCache>>,
    pub index: Arc<KnowledgeIndex>,
    /// `None` retrieves with the question as asked.
    pub enhancer: Option<Arc<dyn QueryEnhancer>>,
    /// `None` keeps the fused order.
    pub reranker: Option<Arc<dyn Reranker>>,
    pub generator: Arc<dyn Generator>,
    pub credentials: Arc<CredentialPool>,
    pub tickets: Arc<dyn TicketSink>,
    pub metrics: Arc<Metrics>,
}

pub struct SupportGraph {
    deps: GraphDeps,
    settings: GraphSettings,
}

/// Mutable state of one run.
#[derive(Debug)]
pub struct Run {
    request_id: String,
    query: String,
    user_id: Option<String>,
    ticket_id: String,
    decision: Option<RouterDecision>,
    cache_hit: Option<CacheHit>,
    evidence: Vec<Evidence>,
    generation: Option<GenerationOutput>,
    confidence: Option<f64>,
    flagged: bool,
    escalation: Option<EscalationReason>,
    handoff: Option<Handoff>,
    response: Option<String>,
    error: Option<String>,
    retrieval_ms: Option<u64>,
    generation_ms: Option<u64>,
}

impl Run {
    fn new(request: ChatRequest) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            query: request.message,
            user_id: request.user_id,
            ticket_id: request.ticket_id.unwrap_or_else(new_ticket_id),
            decision: None,
            cache_hit: None,
            evidence: Vec::new(),
            generation: None,
            confidence: None,
            flagged: false,
            escalation: None,
            handoff: None,
            response: None,
            error: None,
            retrieval_ms: None,
            generation_ms: None,
        }
    }

    fn tier(&self) -> ComplexityTier {
        self.decision
            .as_ref()
            .map_or(ComplexityTier::Moderate, |d| d.complexity_tier)
    }
}

fn new_ticket_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Fold a transition into the run and pick the next state.
pub fn advance(run: &mut Run, transition: Transition) -> State {
    match transition {
        Transition::Started => State::Route,
        Transition::PatternMatched(decision) => {
            run.decision = Some(decision);
            State::DirectReply
        }
        Transition::HandoffRequested(decision) => {
            run.decision = Some(decision);
            run.escalation = Some(EscalationReason::UserRequest);
            State::Escalate
        }
        Transition::Routed(decision) => {
            run.decision = Some(decision);
            State::CacheCheck
        }
        Transition::Replied(text) => {
            run.response = Some(text);
            run.confidence = Some(1.0);
            State::End
        }
        Transition::CacheHit(hit) => {
            run.confidence = Some(hit.entry.confidence);
            run.cache_hit = Some(hit);
            State::Respond
        }
        Transition::CacheMiss => State::Retrieve,
        Transition::EvidenceFound(outcome) => {
            run.retrieval_ms = Some(outcome.elapsed_ms);
            run.evidence = outcome.evidence;
            State::Generate
        }
        Transition::NoEvidence(outcome) => {
            run.retrieval_ms = Some(outcome.elapsed_ms);
            run.evidence = outcome.evidence;
            run.escalation = Some(EscalationReason::NoEvidence);
            State::Escalate
        }
        Transition::WeakEvidence(outcome) => {
            run.retrieval_ms = Some(outcome.elapsed_ms);
            run.evidence = outcome.evidence;
            run.escalation = Some(EscalationReason::LowRelevance);
            State::Escalate
        }
        Transition::RetrievalFailed(reason) => {
            run.error = Some(reason);
            State::End
        }
        Transition::Generated { output, elapsed_ms } => {
            run.generation_ms = Some(elapsed_ms);
            run.generation = Some(output);
            State::QualityCheck
        }
        Transition::GenerationUnavailable { reason, elapsed_ms } => {
            warn!(reason = %reason, "generation unavailable, escalating");
            run.generation_ms = Some(elapsed_ms);
            run.escalation = Some(EscalationReason::GenerationUnavailable);
            State::Escalate
        }
        Transition::Passed { confidence, flagged } => {
            run.confidence = Some(confidence);
            run.flagged = flagged;
            State::Respond
        }
        Transition::BelowThreshold { confidence } => {
            run.confidence = Some(confidence);
            run.escalation = Some(EscalationReason::LowConfidence);
            State::Escalate
        }
        Transition::Responded => State::End,
        Transition::Escalated(handoff) => {
            run.response = Some(handoff.customer_message());
            run.handoff = Some(handoff);
            State::End
        }
    }
}

impl SupportGraph {
    pub fn new(deps: GraphDeps, settings: GraphSettings) -> Self {
        Self { deps, settings }
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    pub fn cache(&self) -> Option<&Arc<SemanticCache>> {
        self.deps.cache.as_ref()
    }

    pub fn index(&self) -> &Arc<KnowledgeIndex> {
        &self.deps.index
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.deps.metrics
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.deps.credentials
    }

    /// Drive one request from `Start` to `End`.
    pub async fn run(&self, request: ChatRequest) -> ChatOutcome {
        let started = Instant::now();
        let mut run = Run::new(request);
        let mut trace = Vec::new();
        let mut state = State::Start;

        loop {
            trace.push(state);
            if state == State::End {
                break;
            }
            let transition = self.step(state, &mut run).await;
            let next = advance(&mut run, transition);
            debug!(request_id = %run.request_id, from = ?state, to = ?next, "transition");
            if next != State::End && trace.contains(&next) {
                run.error = Some(format!("state {:?} entered twice", next));
                trace.push(State::End);
                break;
            }
            state = next;
        }

        let outcome = self.finish(run, trace, started).await;
        info!(
            request_id = %outcome.request_id,
            intent = outcome.intent.as_str(),
            escalated = outcome.escalated,
            cache_hit = outcome.cache_hit,
            confidence = outcome.confidence,
            latency_ms = outcome.latency_ms,
            "chat handled"
        );
        outcome
    }

    async fn step(&self, state: State, run: &mut Run) -> Transition {
        match state {
            State::Start => Transition::Started,
            State::Route => self.route(&run.query).await,
            State::DirectReply => {
                let intent = run.decision.as_ref().map_or(Intent::Greeting, |d| d.intent);
                Transition::Replied(intent.canned_reply().to_string())
            }
            State::CacheCheck => self.cache_check(&run.query, run.tier()).await,
            State::Retrieve => self.retrieve(&run.query, run.tier()).await,
            State::Generate => self.generate(&run.query, &run.evidence, run.tier()).await,
            State::QualityCheck => self.quality_check(run),
            State::Respond => self.respond(run).await,
            State::Escalate => self.escalate(run),
            // The run loop stops before stepping `End`.
            State::End => Transition::Responded,
        }
    }

    async fn route(&self, query: &str) -> Transition {
        let decision = self.deps.router.classify(query).await;
        if decision.is_direct_reply() {
            Transition::PatternMatched(decision)
        } else if decision.handoff_requested {
            Transition::HandoffRequested(decision)
        } else {
            Transition::Routed(decision)
        }
    }

    async fn cache_check(&self, query: &str, tier: ComplexityTier) -> Transition {
        let Some(cache) = &self.deps.cache else {
            return Transition::CacheMiss;
        };
        let threshold = self.settings.cache_threshold_for(tier);

        match tokio::time::timeout(
            self.settings.retrieval_timeout,
            cache.lookup_with_threshold(query, threshold),
        )
        .await
        {
            Ok(Ok(Some(hit))) => Transition::CacheHit(hit),
            Ok(Ok(None)) => Transition::CacheMiss,
            Ok(Err(e)) => {
                warn!("cache lookup failed, treating as miss: {}", e);
                Transition::CacheMiss
            }
            Err(_) => {
                warn!("cache lookup timed out, treating as miss");
                Transition::CacheMiss
            }
        }
    }

    /// Expansion is best effort: any enhancer failure retrieves with the
    /// question alone.
    async fn expand(&self, query: &str, tier: ComplexityTier) -> EnhancedQuery {
        let plan = ExpansionPlan::for_tier(tier);
        let Some(enhancer) = self.deps.enhancer.as_ref().filter(|_| !plan.is_empty()) else {
            return EnhancedQuery::default();
        };
        match tokio::time::timeout(self.settings.generation_timeout, enhancer.enhance(query, plan)).await {
            Ok(Ok(enhanced)) => {
                debug!(
                    variations = enhanced.variations.len(),
                    hypothetical = enhanced.hypothetical_document.is_some(),
                    "query expanded"
                );
                enhanced
            }
            Ok(Err(e)) => {
                warn!("{}; retrieving with the original query", e);
                EnhancedQuery::default()
            }
            Err(_) => {
                warn!("query enhancement timed out; retrieving with the original query");
                EnhancedQuery::default()
            }
        }
    }

    async fn retrieve(&self, query: &str, tier: ComplexityTier) -> Transition {
        let started = Instant::now();
        let sizing = CandidateSizing::for_tier(tier, self.settings.dense_top_k, self.settings.sparse_top_k);
        let timeout = self.settings.retrieval_timeout;
        let index = &self.deps.index;

        let enhanced = self.expand(query, tier).await;
        let dense_texts = enhanced.dense_texts(query);
        let sparse_texts = enhanced.sparse_texts(query);

        let dense_fut = async {
            match tokio::time::timeout(timeout, index.dense.query_many(&dense_texts, sizing.dense_top_k)).await {
                Ok(Ok(results)) => Ok(results),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("dense retrieval timed out".to_string()),
            }
        };

        let sparse_index = Arc::clone(index);
        let sparse_fut = async move {
            let task = tokio::task::spawn_blocking(move || {
                sparse_index.sparse.query_many(&sparse_texts, sizing.sparse_top_k)
            });
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(results)) => Ok(results),
                Ok(Err(e)) => Err(format!("sparse retrieval failed: {}", e)),
                Err(_) => Err("sparse retrieval timed out".to_string()),
            }
        };

        let (dense, sparse) = tokio::join!(dense_fut, sparse_fut);

        let (dense, sparse): (Vec<RetrievalResult>, Vec<RetrievalResult>) = match (dense, sparse) {
            (Ok(d), Ok(s)) => (d, s),
            (Err(e), Ok(s)) => {
                warn!("dense retrieval failed, using sparse only: {}", e);
                (Vec::new(), s)
            }
            (Ok(d), Err(e)) => {
                warn!("sparse retrieval failed, using dense only: {}", e);
                (d, Vec::new())
            }
            (Err(de), Err(se)) => {
                return Transition::RetrievalFailed(format!("dense: {}; sparse: {}", de, se));
            }
        };

        debug!(dense = dense.len(), sparse = sparse.len(), "retrieval done");

        // A reranker sees twice the final evidence count to choose from.
        let top_k = self.settings.fusion.rerank_top_k;
        let mut fusion = self.settings.fusion;
        if self.deps.reranker.is_some() {
            fusion.rerank_top_k = top_k * 2;
        }

        let hits = match fuse(&dense, &sparse, &fusion) {
            Ok(hits) => hits,
            Err(FusionError::NoEvidenceFound) => {
                return Transition::NoEvidence(RetrievalOutcome {
                    evidence: Vec::new(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        };
        let mut evidence = index.evidence(&hits);

        if evidence.is_empty() {
            return Transition::NoEvidence(RetrievalOutcome {
                evidence,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        if !passes_relevance_floor(&evidence, self.settings.min_dense_similarity) {
            evidence.truncate(top_k);
            return Transition::WeakEvidence(RetrievalOutcome {
                evidence,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        if let Some(reranker) = &self.deps.reranker {
            let fused = evidence.clone();
            evidence = match tokio::time::timeout(timeout, rerank(reranker.as_ref(), query, evidence, top_k)).await {
                Ok(Ok(reranked)) => reranked,
                Ok(Err(e)) => {
                    warn!(model = reranker.model_name(), "{}; keeping fused order", e);
                    fused
                }
                Err(_) => {
                    warn!(model = reranker.model_name(), "reranking timed out; keeping fused order");
                    fused
                }
            };
        }
        evidence.truncate(top_k);

        Transition::EvidenceFound(RetrievalOutcome {
            evidence,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Call the generator, rotating through the credential pool on quota
    /// or auth failures.
    async fn generate(&self, query: &str, evidence: &[Evidence], tier: ComplexityTier) -> Transition {
        let started = Instant::now();
        let timeout = self.settings.generation_timeout;
        let generator = &self.deps.generator;
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        if !generator.needs_credential() {
            return match tokio::time::timeout(timeout, generator.generate(query, evidence, tier, None)).await {
                Ok(Ok(output)) => Transition::Generated {
                    output,
                    elapsed_ms: elapsed(started),
                },
                Ok(Err(e)) => Transition::GenerationUnavailable {
                    reason: e.to_string(),
                    elapsed_ms: elapsed(started),
                },
                Err(_) => Transition::GenerationUnavailable {
                    reason: GenerationError::Timeout.to_string(),
                    elapsed_ms: elapsed(started),
                },
            };
        }

        let pool = &self.deps.credentials;
        for _ in 0..pool.len() {
            let Some(lease) = pool.lease() else {
                break;
            };

            let result = tokio::time::timeout(
                timeout,
                generator.generate(query, evidence, tier, Some(&lease.credential)),
            )
            .await;

            match result {
                Ok(Ok(output)) => {
                    return Transition::Generated {
                        output,
                        elapsed_ms: elapsed(started),
                    }
                }
                Ok(Err(e)) if e.is_credential_error() => {
                    warn!(credential = %lease.credential.name, "{}; rotating credential", e);
                    pool.mark_exhausted(lease.index);
                }
                Ok(Err(e)) => {
                    return Transition::GenerationUnavailable {
                        reason: e.to_string(),
                        elapsed_ms: elapsed(started),
                    }
                }
                Err(_) => {
                    return Transition::GenerationUnavailable {
                        reason: GenerationError::Timeout.to_string(),
                        elapsed_ms: elapsed(started),
                    }
                }
            }
        }

        Transition::GenerationUnavailable {
            reason: "credential pool exhausted".to_string(),
            elapsed_ms: elapsed(started),
        }
    }

    fn quality_check(&self, run: &Run) -> Transition {
        let Some(output) = &run.generation else {
            return Transition::BelowThreshold { confidence: 0.0 };
        };

        let confidence = output
            .confidence
            .unwrap_or_else(|| estimate_confidence(&output.text, &run.evidence))
            .clamp(0.0, 1.0);

        match self.settings.quality.judge(confidence) {
            QualityVerdict::Respond => Transition::Passed {
                confidence,
                flagged: false,
            },
            QualityVerdict::RespondFlagged => Transition::Passed {
                confidence,
                flagged: true,
            },
            QualityVerdict::Escalate => Transition::BelowThreshold { confidence },
        }
    }

    async fn respond(&self, run: &mut Run) -> Transition {
        if let Some(hit) = &run.cache_hit {
            run.response = Some(hit.entry.response_text.clone());
            return Transition::Responded;
        }

        let Some(output) = &run.generation else {
            return Transition::Responded;
        };
        run.response = Some(output.text.clone());

        if !run.flagged {
            if let (Some(cache), Some(confidence)) = (&self.deps.cache, run.confidence) {
                let sources = distinct_sources(&run.evidence);
                let stored = tokio::time::timeout(
                    self.settings.retrieval_timeout,
                    cache.store(&run.query, &output.text, &sources, confidence),
                )
                .await;
                match stored {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("cache store failed: {}", e),
                    Err(_) => warn!("cache store timed out"),
                }
            }
        }

        Transition::Responded
    }

    fn escalate(&self, run: &Run) -> Transition {
        let reason = run.escalation.unwrap_or(EscalationReason::LowConfidence);
        let handoff = Handoff::new(
            run.ticket_id.clone(),
            reason,
            &run.query,
            run.generation.as_ref().map(|g| g.text.clone()),
            run.confidence,
            &run.evidence,
        );
        info!(
            ticket_id = %handoff.ticket_id,
            reason = reason.as_str(),
            priority = handoff.priority.as_str(),
            "escalating to human support"
        );
        Transition::Escalated(handoff)
    }

    /// Build the outcome, hand the turn to the ticket sink and record metrics.
    async fn finish(&self, run: Run, trace: Vec<State>, started: Instant) -> ChatOutcome {
        let decision = run.decision.clone();
        let intent = decision.as_ref().map_or(Intent::Question, |d| d.intent);
        let complexity_tier = decision
            .as_ref()
            .map_or(ComplexityTier::Moderate, |d| d.complexity_tier);
        let escalated = run.handoff.is_some();
        let error = run.error.is_some();

        if let Some(reason) = &run.error {
            warn!(request_id = %run.request_id, "request failed: {}", reason);
        }

        let sources = match (&run.cache_hit, escalated || error) {
            (Some(hit), _) => hit.entry.sources.clone(),
            (None, false) if run.generation.is_some() => distinct_sources(&run.evidence),
            _ => Vec::new(),
        };

        let response = if error {
            FAILURE_MESSAGE.to_string()
        } else {
            run.response.clone().unwrap_or_else(|| FAILURE_MESSAGE.to_string())
        };
        let confidence = if error { 0.0 } else { run.confidence.unwrap_or(0.0) };

        let latency_ms = started.elapsed().as_millis() as u64;

        let record = TurnRecord {
            turn: ConversationTurn {
                query: run.query.clone(),
                response: response.clone(),
                timestamp: Utc::now(),
                escalated,
                confidence,
                user_id: run.user_id.clone(),
                ticket_id: Some(run.ticket_id.clone()),
                sources: sources.clone(),
                escalation_reason: run.escalation.filter(|_| escalated).map(|r| r.as_str().to_string()),
            },
            needs_review: escalated || run.flagged || error,
            priority: run.handoff.as_ref().map(|h| h.priority),
        };
        if let Err(e) = self.deps.tickets.record(record).await {
            warn!("ticket sink rejected turn: {}", e);
        }

        self.deps.metrics.record(RequestSample {
            latency_ms,
            retrieval_ms: run.retrieval_ms,
            generation_ms: run.generation_ms,
            confidence,
            intent: intent.as_str().to_string(),
            cache_hit: run.cache_hit.is_some(),
            escalated,
            error,
        });

        ChatOutcome {
            response,
            sources,
            confidence,
            escalated,
            error,
            intent,
            complexity_tier,
            cache_hit: run.cache_hit.is_some(),
            flagged_for_review: run.flagged,
            escalation_reason: if escalated { run.escalation } else { None },
            model_used: run.generation.as_ref().map(|g| g.model.clone()),
            handoff: run.handoff,
            ticket_id: run.ticket_id,
            request_id: run.request_id,
            latency_ms,
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(intent: Intent, handoff: bool) -> RouterDecision {
        RouterDecision {
            intent,
            complexity_tier: ComplexityTier::Moderate,
            matched_pattern: None,
            handoff_requested: handoff,
        }
    }

    fn run() -> Run {
        Run::new(ChatRequest::new("how do I export data"))
    }

    #[test]
    fn test_route_transitions() {
        let mut r = run();
        assert_eq!(advance(&mut r, Transition::Started), State::Route);
        assert_eq!(
            advance(&mut r, Transition::PatternMatched(decision(Intent::Greeting, false))),
            State::DirectReply
        );
        assert_eq!(
            advance(&mut r, Transition::Routed(decision(Intent::Question, false))),
            State::CacheCheck
        );
        assert_eq!(
            advance(&mut r, Transition::HandoffRequested(decision(Intent::Question, true))),
            State::Escalate
        );
        assert_eq!(r.escalation, Some(EscalationReason::UserRequest));
    }

    #[test]
    fn test_no_evidence_goes_to_escalate() {
        let mut r = run();
        let next = advance(
            &mut r,
            Transition::NoEvidence(RetrievalOutcome {
                evidence: Vec::new(),
                elapsed_ms: 3,
            }),
        );
        assert_eq!(next, State::Escalate);
        assert_eq!(r.escalation, Some(EscalationReason::NoEvidence));
        assert_eq!(r.retrieval_ms, Some(3));
    }

    #[test]
    fn test_weak_evidence_escalates_as_low_relevance() {
        let mut r = run();
        let next = advance(
            &mut r,
            Transition::WeakEvidence(RetrievalOutcome {
                evidence: Vec::new(),
                elapsed_ms: 5,
            }),
        );
        assert_eq!(next, State::Escalate);
        assert_eq!(r.escalation, Some(EscalationReason::LowRelevance));
        assert_eq!(r.retrieval_ms, Some(5));
    }

    #[test]
    fn test_quality_transitions() {
        let mut r = run();
        assert_eq!(
            advance(&mut r, Transition::Passed { confidence: 0.6, flagged: true }),
            State::Respond
        );
        assert!(r.flagged);
        assert_eq!(
            advance(&mut r, Transition::BelowThreshold { confidence: 0.2 }),
            State::Escalate
        );
        assert_eq!(r.escalation, Some(EscalationReason::LowConfidence));
    }

    #[test]
    fn test_generation_unavailable_escalates() {
        let mut r = run();
        let next = advance(
            &mut r,
            Transition::GenerationUnavailable {
                reason: "credential pool exhausted".into(),
                elapsed_ms: 0,
            },
        );
        assert_eq!(next, State::Escalate);
        assert_eq!(r.escalation, Some(EscalationReason::GenerationUnavailable));
    }

    #[test]
    fn test_retrieval_failure_ends_with_error() {
        let mut r = run();
        assert_eq!(
            advance(&mut r, Transition::RetrievalFailed("both down".into())),
            State::End
        );
        assert!(r.error.is_some());
    }

    #[test]
    fn test_request_ticket_id_is_kept() {
        let r = Run::new(ChatRequest {
            message: "hi".into(),
            user_id: None,
            ticket_id: Some("abc".into()),
        });
        assert_eq!(r.ticket_id, "abc");
        assert_eq!(run().ticket_id.len(), 8);
    }
}

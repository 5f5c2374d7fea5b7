//! TOML configuration.
//!
//! Every section and field has a default, so a config file only needs to
//! name what it changes. [`load_config`] parses and validates; validation
//! errors name the offending key.
//!
//! Credentials are never stored in the file. Providers that need an API
//! key read it from the environment variable(s) named here.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use support_harness_core::cache::CacheParams;
use support_harness_core::chunk::ChunkingParams;
use support_harness_core::fusion::FusionParams;
use support_harness_core::models::ComplexityTier;
use support_harness_core::router::RouterParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/support.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    #[serde(default = "default_kb_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            root: default_kb_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_kb_root() -> PathBuf {
    PathBuf::from("./data/knowledge_base")
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    77
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkingParams {
        ChunkingParams {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub dense_top_k: usize,
    #[serde(default = "default_top_k")]
    pub sparse_top_k: usize,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_weight")]
    pub sparse_weight: f64,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
    /// Replaces the built-in English stopword list when set.
    #[serde(default)]
    pub stopwords: Option<Vec<String>>,
    /// Evidence with no BM25 match needs at least this raw cosine
    /// similarity, or the question is treated as out of scope.
    #[serde(default = "default_min_dense_similarity")]
    pub min_dense_similarity: f64,
    /// Rewrite non-simple queries with the generation provider before
    /// retrieving (multi-query, plus a hypothetical answer for complex ones).
    #[serde(default)]
    pub query_expansion: bool,
    #[serde(default = "default_max_query_variations")]
    pub max_query_variations: usize,
    /// `"none"` or `"local"` (cross-encoder, needs the fastembed feature).
    #[serde(default = "default_reranker")]
    pub reranker: String,
    #[serde(default)]
    pub reranker_model: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_top_k: default_top_k(),
            sparse_top_k: default_top_k(),
            rerank_top_k: default_rerank_top_k(),
            dense_weight: default_weight(),
            sparse_weight: default_weight(),
            timeout_secs: default_retrieval_timeout(),
            stopwords: None,
            min_dense_similarity: default_min_dense_similarity(),
            query_expansion: false,
            max_query_variations: default_max_query_variations(),
            reranker: default_reranker(),
            reranker_model: None,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_rerank_top_k() -> usize {
    5
}
fn default_weight() -> f64 {
    0.5
}
fn default_retrieval_timeout() -> u64 {
    10
}
fn default_min_dense_similarity() -> f64 {
    0.2
}
fn default_max_query_variations() -> usize {
    3
}
fn default_reranker() -> String {
    "none".to_string()
}

impl RetrievalConfig {
    pub fn fusion_params(&self) -> FusionParams {
        FusionParams {
            dense_weight: self.dense_weight,
            sparse_weight: self.sparse_weight,
            rerank_top_k: self.rerank_top_k,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Stricter threshold applied to complex queries.
    #[serde(default = "default_complex_similarity_threshold")]
    pub complex_similarity_threshold: f64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_similarity_threshold(),
            complex_similarity_threshold: default_complex_similarity_threshold(),
            ttl_secs: default_ttl_secs(),
            capacity: default_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_similarity_threshold() -> f64 {
    0.90
}
fn default_complex_similarity_threshold() -> f64 {
    0.95
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_capacity() -> usize {
    10_000
}

impl CacheConfig {
    pub fn params(&self) -> CacheParams {
        CacheParams {
            similarity_threshold: self.similarity_threshold,
            ttl: Duration::from_secs(self.ttl_secs),
            capacity: self.capacity,
        }
    }

    pub fn threshold_for(&self, tier: ComplexityTier) -> f64 {
        match tier {
            ComplexityTier::Complex => self.complex_similarity_threshold,
            _ => self.similarity_threshold,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_greeting_prefix_max_words")]
    pub greeting_prefix_max_words: usize,
    /// Send ambiguous queries to the generation provider for classification.
    #[serde(default)]
    pub llm_classifier: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            greeting_prefix_max_words: default_greeting_prefix_max_words(),
            llm_classifier: false,
        }
    }
}

fn default_greeting_prefix_max_words() -> usize {
    3
}

impl RouterConfig {
    pub fn params(&self) -> RouterParams {
        RouterParams {
            greeting_prefix_max_words: self.greeting_prefix_max_words,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_escalation_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default)]
    pub models: ModelTiers,
    /// Environment variables holding the API keys of the credential pool,
    /// tried in order.
    #[serde(default = "default_credential_env")]
    pub credential_env: Vec<String>,
    #[serde(default = "default_credential_cooldown")]
    pub credential_cooldown_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            url: default_generation_url(),
            models: ModelTiers::default(),
            credential_env: default_credential_env(),
            credential_cooldown_secs: default_credential_cooldown(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_generation_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_credential_env() -> Vec<String> {
    vec!["OPENAI_API_KEY".to_string()]
}
fn default_credential_cooldown() -> u64 {
    60
}
fn default_temperature() -> f64 {
    0.3
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Generation model per complexity tier.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelTiers {
    #[serde(default = "default_fast_model")]
    pub simple: String,
    #[serde(default = "default_fast_model")]
    pub moderate: String,
    #[serde(default = "default_strong_model")]
    pub complex: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            simple: default_fast_model(),
            moderate: default_fast_model(),
            complex: default_strong_model(),
        }
    }
}

fn default_fast_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_strong_model() -> String {
    "gpt-4o".to_string()
}

impl ModelTiers {
    pub fn for_tier(&self, tier: ComplexityTier) -> &str {
        match tier {
            ComplexityTier::Simple => &self.simple,
            ComplexityTier::Moderate => &self.moderate,
            ComplexityTier::Complex => &self.complex,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    // Retrieval
    let r = &config.retrieval;
    if r.dense_top_k == 0 || r.sparse_top_k == 0 || r.rerank_top_k == 0 {
        bail!("retrieval.dense_top_k, sparse_top_k and rerank_top_k must be >= 1");
    }
    if r.dense_weight < 0.0 || r.sparse_weight < 0.0 || r.dense_weight + r.sparse_weight <= 0.0 {
        bail!("retrieval.dense_weight and sparse_weight must be >= 0 and not both 0");
    }
    if r.timeout_secs == 0 {
        bail!("retrieval.timeout_secs must be > 0");
    }
    if !(-1.0..=1.0).contains(&r.min_dense_similarity) {
        bail!("retrieval.min_dense_similarity must be in [-1.0, 1.0]");
    }
    if r.max_query_variations == 0 {
        bail!("retrieval.max_query_variations must be >= 1");
    }
    match r.reranker.as_str() {
        "none" | "local" => {}
        other => bail!("Unknown reranker: '{}'. Must be none or local.", other),
    }

    // Cache
    let c = &config.cache;
    for (key, v) in [
        ("similarity_threshold", c.similarity_threshold),
        ("complex_similarity_threshold", c.complex_similarity_threshold),
    ] {
        if !(0.0..=1.0).contains(&v) {
            bail!("cache.{} must be in [0.0, 1.0]", key);
        }
    }
    if c.capacity == 0 {
        bail!("cache.capacity must be >= 1");
    }
    if c.ttl_secs == 0 {
        bail!("cache.ttl_secs must be > 0");
    }

    // Quality gates
    let q = &config.quality;
    if !(0.0..=1.0).contains(&q.confidence_threshold) || !(0.0..=1.0).contains(&q.escalation_threshold) {
        bail!("quality thresholds must be in [0.0, 1.0]");
    }
    if q.escalation_threshold > q.confidence_threshold {
        bail!("quality.escalation_threshold must be <= quality.confidence_threshold");
    }

    // Embedding
    let e = &config.embedding;
    match e.provider.as_str() {
        "hash" | "local" => {}
        "openai" | "ollama" => {
            if e.model.is_none() {
                bail!("embedding.model must be specified when provider is '{}'", e.provider);
            }
            if e.dims.is_none() || e.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
            other
        ),
    }
    if e.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if e.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    // Generation
    let g = &config.generation;
    match g.provider.as_str() {
        "extractive" => {}
        "openai" => {
            if g.credential_env.is_empty() {
                bail!("generation.credential_env must name at least one environment variable");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be extractive or openai.",
            other
        ),
    }
    if g.timeout_secs == 0 {
        bail!("generation.timeout_secs must be > 0");
    }
    if config.router.llm_classifier && g.provider != "openai" {
        bail!("router.llm_classifier requires generation.provider = \"openai\"");
    }
    if r.query_expansion && g.provider != "openai" {
        bail!("retrieval.query_expansion requires generation.provider = \"openai\"");
    }

    Ok(())
}

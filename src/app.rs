//! Wiring: build the index from the knowledge base, and assemble the
//! orchestration graph from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;

use support_harness_core::cache::SemanticCache;
use support_harness_core::chunk::build_chunks;
use support_harness_core::dense::DenseRetriever;
use support_harness_core::router::Router;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::enhance::{LlmQueryEnhancer, QueryEnhancer};
use crate::generation::{create_generator, CredentialPool, LlmIntentClassifier};
use crate::graph::{GraphDeps, GraphSettings, SupportGraph};
use crate::index_store;
use crate::kb::scan_knowledge_base;
use crate::metrics::Metrics;
use crate::rerank::create_reranker;
use crate::retrieval::KnowledgeIndex;
use crate::tickets::TicketStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub documents: usize,
    pub chunks: usize,
    pub model: String,
    pub dims: usize,
}

/// Rebuild the stored index from the knowledge base.
pub async fn run_index(config: &Config) -> Result<IndexReport> {
    let documents = scan_knowledge_base(&config.knowledge_base)?;
    let chunks = build_chunks(&documents, &config.chunking.params());
    tracing::info!(documents = documents.len(), chunks = chunks.len(), "chunked knowledge base");

    let embedder = create_embedder(&config.embedding)?;
    let mut dense = DenseRetriever::new(embedder.clone()).with_batch_size(config.embedding.batch_size);
    dense.index(&chunks).await?;

    let pool = db::connect(&config.db).await?;
    index_store::save_index(&pool, &chunks, dense.rows(), embedder.model_name(), embedder.dims()).await?;
    pool.close().await;

    Ok(IndexReport {
        documents: documents.len(),
        chunks: chunks.len(),
        model: embedder.model_name().to_string(),
        dims: embedder.dims(),
    })
}

/// A ready-to-serve graph plus the stores the server exposes.
pub struct App {
    pub graph: Arc<SupportGraph>,
    pub tickets: Arc<TicketStore>,
}

/// Load the stored index and wire every collaborator named in `config`.
pub async fn build_app(config: &Config) -> Result<App> {
    let embedder = create_embedder(&config.embedding)?;

    let pool = db::connect(&config.db).await?;
    match index_store::load_meta(&pool).await? {
        Some(meta) if meta.model != embedder.model_name() => bail!(
            "Index was built with embedding model '{}' but '{}' is configured; run `shx index`",
            meta.model,
            embedder.model_name()
        ),
        Some(meta) => tracing::info!(model = %meta.model, built_at = %meta.built_at, "loaded index"),
        None => tracing::warn!("No index found; every question will be escalated until `shx index` runs"),
    }
    let index = KnowledgeIndex::load(&pool, embedder.clone(), &config.retrieval).await?;
    pool.close().await;

    let cache = config
        .cache
        .enabled
        .then(|| Arc::new(SemanticCache::new(embedder.clone(), config.cache.params())));

    let credentials = Arc::new(if config.generation.provider == "openai" {
        CredentialPool::from_env(
            &config.generation.credential_env,
            Duration::from_secs(config.generation.credential_cooldown_secs),
        )
    } else {
        CredentialPool::new(Vec::new(), Duration::ZERO)
    });
    if config.generation.provider == "openai" && credentials.is_empty() {
        tracing::warn!("No generation credentials available; answers will be escalated");
    }

    let mut router = Router::new(config.router.params());
    if config.router.llm_classifier {
        router = router.with_classifier(Arc::new(LlmIntentClassifier::new(
            &config.generation,
            credentials.clone(),
        )?));
    }

    let enhancer: Option<Arc<dyn QueryEnhancer>> = if config.retrieval.query_expansion {
        Some(Arc::new(LlmQueryEnhancer::new(
            &config.generation,
            credentials.clone(),
            config.retrieval.max_query_variations,
        )?))
    } else {
        None
    };
    let reranker = create_reranker(&config.retrieval)?;
    if let Some(reranker) = &reranker {
        tracing::info!(model = reranker.model_name(), "cross-encoder reranking enabled");
    }

    let tickets = Arc::new(TicketStore::new());
    let graph = SupportGraph::new(
        GraphDeps {
            router,
            cache,
            index: Arc::new(index),
            enhancer,
            reranker,
            generator: create_generator(&config.generation)?,
            credentials,
            tickets: tickets.clone(),
            metrics: Arc::new(Metrics::default()),
        },
        GraphSettings::from_config(config),
    );

    Ok(App {
        graph: Arc::new(graph),
        tickets,
    })
}

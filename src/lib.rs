//! # Support Harness
//!
//! A retrieval-augmented customer-support agent.
//!
//! Support Harness answers customer questions from a markdown knowledge
//! base. Each question is routed, checked against a semantic response
//! cache, answered from hybrid (dense + BM25) retrieval, and scored by a
//! quality gate. Anything it cannot answer confidently becomes a
//! prioritized handoff in the human ticket queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Knowledge    │──▶│ Chunk+Embed  │──▶│  SQLite  │
//! │ base (*.md)  │   │  (shx index) │   │  index   │
//! └──────────────┘   └──────────────┘   └────┬─────┘
//!                                            │ load
//!                                            ▼
//!   ┌──────────┐    ┌──────────────────────────────────────────┐
//!   │ CLI/HTTP │───▶│ SupportGraph: route → cache → retrieve → │
//!   │ /chat    │    │ generate → quality → respond | escalate  │
//!   └──────────┘    └───────────────────┬──────────────────────┘
//!                                       ▼
//!                                 ┌──────────┐
//!                                 │ Tickets  │
//!                                 └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`kb`] | Knowledge-base scanning |
//! | [`db`] / [`index_store`] | SQLite persistence of chunks and vectors |
//! | [`embedding`] | Embedding providers (hash, OpenAI, Ollama, fastembed) |
//! | [`retrieval`] | The loaded dense + sparse index |
//! | [`enhance`] | Multi-query and hypothetical-document query expansion |
//! | [`rerank`] | Optional cross-encoder reranking |
//! | [`generation`] | Answer generators and the credential pool |
//! | [`quality`] | Confidence estimation and the quality gate |
//! | [`escalation`] | Handoff construction and priority |
//! | [`tickets`] | In-memory ticket store |
//! | [`metrics`] | Request metrics |
//! | [`graph`] | The per-request state machine |
//! | [`app`] | Index building and app assembly |
//! | [`server`] | HTTP chat server |

pub mod app;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enhance;
pub mod escalation;
pub mod generation;
pub mod graph;
pub mod index_store;
pub mod kb;
pub mod metrics;
pub mod quality;
pub mod rerank;
pub mod retrieval;
pub mod server;
pub mod tickets;

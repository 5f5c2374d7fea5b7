//! # Support Harness Core
//!
//! The retrieval and routing core of Support Harness: data models,
//! chunking, the embedding trait, dense and BM25 retrievers, hybrid
//! fusion, the semantic cache, and the query router.
//!
//! This crate does no network or filesystem I/O and has no runtime
//! dependency on tokio. Collaborators (embedding models, intent
//! classifiers) are reached through traits implemented by the
//! `support-harness` app crate.

pub mod cache;
pub mod chunk;
pub mod dense;
pub mod embedding;
pub mod fusion;
pub mod models;
pub mod router;
pub mod sparse;

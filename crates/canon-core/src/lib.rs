//! # Canon Core
//!
//! Semantic deduplication for vector-indexed knowledge stores: data models,
//! storage traits with an in-memory backend, the relationship classifier,
//! canonical record management, contradiction tracking, the per-item
//! orchestrator, canonical-aware retrieval, and batch reconciliation.
//!
//! This crate has no sqlx, HTTP, or filesystem dependencies. The `canon`
//! crate supplies the SQLite store, the LLM classifier, and the CLI.

pub mod access;
pub mod batch;
pub mod cache;
pub mod canonical;
pub mod classifier;
pub mod contradiction;
pub mod error;
pub mod events;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod service;
pub mod similarity;
pub mod store;
pub mod vector;

pub use error::{DedupError, Result};

//! # Canon
//!
//! **Semantic memory deduplication for vector-indexed knowledge stores.**
//!
//! Canon keeps one authoritative chunk per fact. New chunks are compared with
//! their nearest neighbours, classified (equivalent, complementary,
//! contradictory, superseding, subset, distinct), and then merged into a
//! canonical record, linked, flagged, superseded, or queued for a human.
//! Retrieval collapses variants into their canonical so results stay diverse.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ canon CLI  │──▶│  DedupService    │──▶│  SqliteStore  │
//! │ (ingest,   │   │  (canon-core)    │   │  chunks, recs │
//! │ reconcile) │   └────────┬─────────┘   └───────────────┘
//! └────────────┘            │
//!                           ▼
//!                  ┌──────────────────┐
//!                  │ OpenAiClassifier │  (optional, slow path)
//!                  └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! canon init                          # create database
//! canon ingest chunks.jsonl           # store + deduplicate
//! canon similar <chunk-id>            # canonical-aware neighbours
//! canon reconcile start --dry-run     # what a full pass would do
//! canon reconcile start               # deduplicate everything
//! canon contradictions list --status pending
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Idempotent schema creation |
//! | [`sqlite_store`] | `SqliteStore`: every `canon_core` storage trait over SQLite |
//! | [`classifier`] | OpenAI-compatible text classifier with retry/backoff |
//! | [`app`] | Builds a `DedupService` from configuration |
//! | [`ingest`] | JSONL ingestion with bounded concurrency |
//! | [`search`] | `similar` and `duplicates` commands |
//! | [`canonical`] | Canonical record inspection and manual promotion/detachment |
//! | [`contradictions`] | Contradiction listing and resolution |
//! | [`reviews`] | Review queue listing and decisions |
//! | [`reconcile`] | Batch reconciliation job control |
//! | [`progress`] | Batch progress reporting on stderr |
//! | [`stats`] | Database statistics |

pub mod app;
pub mod canonical;
pub mod classifier;
pub mod config;
pub mod contradictions;
pub mod db;
pub mod ingest;
pub mod migrate;
pub mod progress;
pub mod reconcile;
pub mod reviews;
pub mod search;
pub mod sqlite_store;
pub mod stats;

//! # Manual KB
//!
//! Turns support consultations into reviewed, versioned knowledge-base
//! manuals.
//!
//! The lifecycle, conflict detection and review rules live in
//! [`manual_kb_core`]. This crate supplies the storage and model adapters
//! behind its traits and the `mkb` command line.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌──────────────────┐   ┌───────────────────┐
//! │ Consultations │──▶│  Drafter (chat)  │──▶│  manual_kb_core   │
//! └───────────────┘   └──────────────────┘   │ lifecycle/review  │
//!                                            └─────────┬─────────┘
//!                        ┌─────────────────────────────┤
//!                        ▼                             ▼
//!                 ┌──────────────┐             ┌───────────────┐
//!                 │ SQLite repo  │             │ vector index  │
//!                 │ + retry jobs │             │ (embeddings)  │
//!                 └──────────────┘             └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_repo`] | `ManualRepository` over SQLite |
//! | [`retry_queue`] | `RetryQueue` over SQLite |
//! | [`embedding`] | Embedding providers |
//! | [`vector_index`] | `SimilarityIndex` over stored embeddings |
//! | [`generation`] | Chat-model `Drafter` |
//! | [`app`] | Engine wiring |

pub mod app;
pub mod config;
pub mod consultations;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod http;
pub mod index_cmd;
pub mod manuals;
pub mod migrate;
pub mod retry_queue;
pub mod search;
pub mod sqlite_repo;
pub mod stats;
pub mod tasks;
pub mod vector_index;

//! # Manual KB Core
//!
//! The manual lifecycle and conflict-detection engine behind Manual KB:
//! data models, the DRAFT → APPROVED → DEPRECATED state machine, version
//! labelling, similarity-driven conflict classification, grounding checks
//! for generated content, and the review-task workflow.
//!
//! Storage, the similarity index, the drafting backend and the retry queue
//! are traits ([`repository::ManualRepository`], [`index::SimilarityIndex`],
//! [`generation::Drafter`], [`queue::RetryQueue`]), each with an in-memory
//! implementation. This crate contains no tokio, sqlx, or network
//! dependencies; the `manual-kb` app crate supplies SQLite and HTTP
//! adapters.

pub mod conflict;
pub mod engine;
pub mod error;
pub mod generation;
pub mod index;
pub mod lifecycle;
pub mod maintenance;
pub mod models;
pub mod params;
pub mod queue;
pub mod repository;
pub mod review;
pub mod search;
pub mod source_text;
pub mod validation;
pub mod version;

pub use engine::{Collaborators, Engine};
pub use error::{ManualError, Result};

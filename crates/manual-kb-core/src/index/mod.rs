//! Similarity index abstraction.
//!
//! The [`SimilarityIndex`] trait is the engine's only view of the semantic
//! index. The index is a rebuildable projection of APPROVED manuals, never a
//! source of truth: it can be dropped and refilled from the repository.
//!
//! Implementations must return hits sorted by descending score, with scores
//! in `[0.0, 1.0]`. An empty or below-threshold result is an empty `Vec`,
//! never an error; errors mean the index itself is unavailable.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::LogicalKey;

/// Metadata stored alongside each indexed manual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub business_type: String,
    pub error_code: String,
}

impl From<&LogicalKey> for IndexMetadata {
    fn from(key: &LogicalKey) -> Self {
        Self {
            business_type: key.business_type.clone(),
            error_code: key.error_code.clone(),
        }
    }
}

/// Restricts a search to hits whose metadata matches every set field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub business_type: Option<String>,
    pub error_code: Option<String>,
}

impl MetadataFilter {
    pub fn for_key(key: &LogicalKey) -> Self {
        Self {
            business_type: Some(key.business_type.clone()),
            error_code: Some(key.error_code.clone()),
        }
    }

    pub fn matches(&self, meta: &IndexMetadata) -> bool {
        self.business_type
            .as_deref()
            .map_or(true, |bt| bt == meta.business_type)
            && self
                .error_code
                .as_deref()
                .map_or(true, |ec| ec == meta.error_code)
    }
}

/// Bundles the inputs of a single search call.
#[derive(Debug, Clone)]
pub struct IndexQuery<'a> {
    pub text: &'a str,
    pub top_k: usize,
    pub filter: Option<&'a MetadataFilter>,
    /// Hits scoring below this are dropped by the index.
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    /// Manual entry id.
    pub id: String,
    pub score: f64,
    pub metadata: IndexMetadata,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Insert or replace the text stored under `id`.
    async fn index(&self, id: &str, text: &str, metadata: &IndexMetadata) -> Result<()>;

    async fn search(&self, query: &IndexQuery<'_>) -> Result<Vec<IndexHit>>;

    /// Remove `id`. Removing an absent id succeeds.
    async fn delete(&self, id: &str) -> Result<()>;
}

//! Semantic search over approved manuals.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{ManualError, Result};
use crate::index::{IndexQuery, MetadataFilter, SimilarityIndex};
use crate::models::{ManualEntry, ManualStatus};
use crate::repository::ManualRepository;

/// Extra hits requested from the index to make up for stale ones.
const OVERFETCH: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ManualHit {
    pub entry: ManualEntry,
    pub score: f64,
}

#[derive(Clone)]
pub struct ManualSearch {
    repository: Arc<dyn ManualRepository>,
    index: Arc<dyn SimilarityIndex>,
}

impl ManualSearch {
    pub fn new(repository: Arc<dyn ManualRepository>, index: Arc<dyn SimilarityIndex>) -> Self {
        Self { repository, index }
    }

    /// Up to `limit` APPROVED manuals ranked by similarity to `query`.
    ///
    /// The index may briefly hold entries that were deprecated after it was
    /// last synced; those are resolved through the repository and dropped.
    /// Unlike the lifecycle operations, an unavailable index is an error
    /// here since there is nothing to degrade to.
    pub async fn search_manuals(
        &self,
        query: &str,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<ManualHit>> {
        if query.trim().is_empty() {
            return Err(ManualError::validation("search query must not be empty"));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let hits = self
            .index
            .search(&IndexQuery {
                text: query,
                top_k: limit + OVERFETCH,
                filter: Some(filter),
                threshold: None,
            })
            .await
            .map_err(ManualError::IndexUnavailable)?;

        let mut out = Vec::with_capacity(limit);
        for hit in hits {
            let entry = self
                .repository
                .get_entry(&hit.id)
                .await
                .map_err(ManualError::Storage)?;
            if let Some(entry) = entry.filter(|e| e.status == ManualStatus::Approved) {
                out.push(ManualHit {
                    entry,
                    score: hit.score,
                });
                if out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}

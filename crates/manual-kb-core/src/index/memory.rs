//! In-memory [`SimilarityIndex`] for tests and offline runs.
//!
//! Scoring is deterministic: the cosine of the two texts' token sets
//! (`|A ∩ B| / sqrt(|A| × |B|)`), which always lands in `[0, 1]`. Tests that
//! need an exact score can pin one per id with [`InMemoryIndex::pin_score`].
//! Each operation can be switched to fail to simulate an outage.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{IndexHit, IndexMetadata, IndexQuery, SimilarityIndex};
use crate::validation::normalize;

struct StoredText {
    tokens: HashSet<String>,
    metadata: IndexMetadata,
}

pub struct InMemoryIndex {
    items: RwLock<HashMap<String, StoredText>>,
    pinned: RwLock<HashMap<String, f64>>,
    fail_index: AtomicBool,
    fail_search: AtomicBool,
    fail_delete: AtomicBool,
    index_calls: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            pinned: RwLock::new(HashMap::new()),
            fail_index: AtomicBool::new(false),
            fail_search: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            index_calls: AtomicUsize::new(0),
        }
    }

    /// Report `score` for `id` on every search, whatever the query.
    pub fn pin_score(&self, id: &str, score: f64) {
        self.pinned.write().unwrap().insert(id.to_string(), score);
    }

    pub fn fail_index(&self, fail: bool) {
        self.fail_index.store(fail, Ordering::SeqCst);
    }

    pub fn fail_search(&self, fail: bool) {
        self.fail_search.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Fail every operation.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_index(unavailable);
        self.fail_search(unavailable);
        self.fail_delete(unavailable);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.read().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `index` calls, including failed ones.
    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    normalize(text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn token_cosine(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    shared / ((a.len() as f64) * (b.len() as f64)).sqrt()
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    async fn index(&self, id: &str, text: &str, metadata: &IndexMetadata) -> Result<()> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_index.load(Ordering::SeqCst) {
            bail!("in-memory index: writes disabled");
        }
        self.items.write().unwrap().insert(
            id.to_string(),
            StoredText {
                tokens: tokenize(text),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn search(&self, query: &IndexQuery<'_>) -> Result<Vec<IndexHit>> {
        if self.fail_search.load(Ordering::SeqCst) {
            bail!("in-memory index: search disabled");
        }
        let query_tokens = tokenize(query.text);
        let items = self.items.read().unwrap();
        let pinned = self.pinned.read().unwrap();

        let mut hits: Vec<IndexHit> = items
            .iter()
            .filter(|(_, stored)| query.filter.map_or(true, |f| f.matches(&stored.metadata)))
            .map(|(id, stored)| IndexHit {
                id: id.clone(),
                score: pinned
                    .get(id)
                    .copied()
                    .unwrap_or_else(|| token_cosine(&query_tokens, &stored.tokens)),
                metadata: stored.metadata.clone(),
            })
            .filter(|hit| query.threshold.map_or(true, |t| hit.score >= t))
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(query.top_k);
        Ok(hits)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            bail!("in-memory index: deletes disabled");
        }
        self.items.write().unwrap().remove(id);
        Ok(())
    }
}

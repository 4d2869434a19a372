//! A [`Drafter`] that replays canned responses.
//!
//! Drafts are served FIFO from a queue; when the queue is empty the fallback
//! draft (if any) is returned. `compare` always returns the configured
//! comparison. Either call can be switched to fail.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{Comparison, Drafter, GeneratedDraft};

#[derive(Default)]
pub struct ScriptedDrafter {
    queued: Mutex<VecDeque<GeneratedDraft>>,
    fallback: Mutex<Option<GeneratedDraft>>,
    comparison: Mutex<Comparison>,
    fail_draft: AtomicBool,
    fail_compare: AtomicBool,
    compare_calls: AtomicUsize,
}

impl ScriptedDrafter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `draft` whenever the queue is empty.
    pub fn with_fallback(draft: GeneratedDraft) -> Self {
        let drafter = Self::new();
        *drafter.fallback.lock().unwrap() = Some(draft);
        drafter
    }

    pub fn push_draft(&self, draft: GeneratedDraft) {
        self.queued.lock().unwrap().push_back(draft);
    }

    pub fn set_comparison(&self, comparison: Comparison) {
        *self.comparison.lock().unwrap() = comparison;
    }

    pub fn fail_draft(&self, fail: bool) {
        self.fail_draft.store(fail, Ordering::SeqCst);
    }

    pub fn fail_compare(&self, fail: bool) {
        self.fail_compare.store(fail, Ordering::SeqCst);
    }

    pub fn compare_calls(&self) -> usize {
        self.compare_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Drafter for ScriptedDrafter {
    async fn draft(&self, _source_text: &str, _instructions: &str) -> Result<GeneratedDraft> {
        if self.fail_draft.load(Ordering::SeqCst) {
            bail!("scripted drafter: draft disabled");
        }
        if let Some(next) = self.queued.lock().unwrap().pop_front() {
            return Ok(next);
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("scripted drafter: no draft queued"))
    }

    async fn compare(&self, _old_text: &str, _new_text: &str) -> Result<Comparison> {
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_compare.load(Ordering::SeqCst) {
            bail!("scripted drafter: compare disabled");
        }
        Ok(self.comparison.lock().unwrap().clone())
    }
}

//! Conflict detection: classify a draft against approved knowledge.
//!
//! # Algorithm
//!
//! 1. Render the draft with [`manual_text`] and query the similarity index
//!    for the top `top_k` hits on the draft's logical key at or above
//!    `search_floor`.
//! 2. Resolve each hit through the repository and keep only APPROVED
//!    entries on the same key (never the draft itself).
//! 3. Pick the best survivor: highest score, then higher version label,
//!    then later approval time.
//! 4. Classify the best score:
//!
//! | Score                               | Kind         | Review task |
//! |-------------------------------------|--------------|-------------|
//! | `>= similar_threshold`              | `Similar`    | no          |
//! | `>= supplement_threshold`           | `Supplement` | yes         |
//! | below, or no survivor               | `New`        | no          |
//!
//! Detection is best-effort. If the index cannot be searched the draft is
//! classified `New` with no score, and a warning is logged.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Entity, ManualError, Result};
use crate::generation::Drafter;
use crate::index::{IndexQuery, MetadataFilter, SimilarityIndex};
use crate::models::{ManualEntry, ManualStatus, ReviewTask, TaskEvent, TaskReason, TaskStatus};
use crate::params::EngineParams;
use crate::repository::{ManualRepository, TaskAnnotation, TaskInsert, TaskMatch};
use crate::source_text::manual_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Near-duplicate of an approved manual; reuse it instead.
    Similar,
    /// Overlaps an approved manual enough to need human reconciliation.
    Supplement,
    /// Independent of existing approved knowledge.
    New,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Similar => "SIMILAR",
            ConflictKind::Supplement => "SUPPLEMENT",
            ConflictKind::New => "NEW",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictResult {
    pub kind: ConflictKind,
    /// The approved entry the draft was compared against. Only set for
    /// `Similar` and `Supplement`.
    pub matched_entry: Option<ManualEntry>,
    /// Best approved candidate's score, if any candidate survived.
    pub similarity_score: Option<f64>,
    /// Review task opened (or reused) for this draft.
    pub task_id: Option<String>,
}

impl ConflictResult {
    /// `New` with nothing matched.
    pub fn unmatched() -> Self {
        Self {
            kind: ConflictKind::New,
            matched_entry: None,
            similarity_score: None,
            task_id: None,
        }
    }
}

/// A surviving candidate.
struct Candidate {
    entry: ManualEntry,
    score: f64,
}

/// Highest score first; ties go to the freshest approval.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.entry.version.cmp(&b.entry.version))
        .then_with(|| a.entry.approved_at.cmp(&b.entry.approved_at))
}

#[derive(Clone)]
pub struct ConflictDetector {
    repository: Arc<dyn ManualRepository>,
    index: Arc<dyn SimilarityIndex>,
    drafter: Arc<dyn Drafter>,
    params: Arc<EngineParams>,
}

impl ConflictDetector {
    pub fn new(
        repository: Arc<dyn ManualRepository>,
        index: Arc<dyn SimilarityIndex>,
        drafter: Arc<dyn Drafter>,
        params: Arc<EngineParams>,
    ) -> Self {
        Self {
            repository,
            index,
            drafter,
            params,
        }
    }

    pub fn classify(&self, score: f64) -> ConflictKind {
        if score >= self.params.similar_threshold {
            ConflictKind::Similar
        } else if score >= self.params.supplement_threshold {
            ConflictKind::Supplement
        } else {
            ConflictKind::New
        }
    }

    /// Classify `draft` and open a review task when the result is
    /// `Supplement`.
    ///
    /// Fails with a state error if `draft` is not a DRAFT. Repository
    /// failures surface as storage errors; index failures never do.
    pub async fn check_conflict(&self, draft: &ManualEntry) -> Result<ConflictResult> {
        if !draft.is_draft() {
            return Err(ManualError::state(
                Entity::Manual,
                &draft.id,
                draft.status,
                ManualStatus::Draft,
            ));
        }

        let text = manual_text(&draft.content);
        let filter = MetadataFilter::for_key(&draft.key);
        let query = IndexQuery {
            text: &text,
            top_k: self.params.top_k,
            filter: Some(&filter),
            threshold: Some(self.params.search_floor),
        };
        let hits = match self.index.search(&query).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(
                    entry_id = %draft.id,
                    key = %draft.key,
                    error = %format!("{:#}", e),
                    "similarity index unavailable; classifying draft as NEW"
                );
                return Ok(ConflictResult::unmatched());
            }
        };

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.id == draft.id {
                continue;
            }
            let entry = self
                .repository
                .get_entry(&hit.id)
                .await
                .map_err(ManualError::Storage)?;
            match entry {
                Some(entry) if entry.status == ManualStatus::Approved && entry.key == draft.key => {
                    candidates.push(Candidate {
                        entry,
                        score: hit.score,
                    });
                }
                _ => {}
            }
        }

        let best = match candidates.into_iter().max_by(rank) {
            Some(best) => best,
            None => return Ok(ConflictResult::unmatched()),
        };

        match self.classify(best.score) {
            ConflictKind::Similar => Ok(ConflictResult {
                kind: ConflictKind::Similar,
                matched_entry: Some(best.entry),
                similarity_score: Some(best.score),
                task_id: None,
            }),
            ConflictKind::Supplement => {
                let task_id = self.open_supplement_task(draft, &best, &text).await?;
                Ok(ConflictResult {
                    kind: ConflictKind::Supplement,
                    matched_entry: Some(best.entry),
                    similarity_score: Some(best.score),
                    task_id: Some(task_id),
                })
            }
            ConflictKind::New => Ok(ConflictResult {
                kind: ConflictKind::New,
                matched_entry: None,
                similarity_score: Some(best.score),
                task_id: None,
            }),
        }
    }

    /// Open the review task for a `Supplement` result. A draft that already
    /// has an open task keeps it; if that task names no approved manual yet
    /// (an ungrounded draft, say), the match is recorded on it.
    async fn open_supplement_task(
        &self,
        draft: &ManualEntry,
        best: &Candidate,
        draft_text: &str,
    ) -> Result<String> {
        let existing = self
            .repository
            .find_open_task_for_entry(&draft.id)
            .await
            .map_err(ManualError::Storage)?;
        if let Some(task) = existing.as_ref().filter(|t| t.old_entry_id.is_some()) {
            return Ok(task.id.clone());
        }

        let (differences, summary) = match self
            .drafter
            .compare(&manual_text(&best.entry.content), draft_text)
            .await
        {
            Ok(cmp) => {
                let summary = Some(cmp.summary).filter(|s| !s.trim().is_empty());
                (Some(cmp.differences), summary)
            }
            Err(e) => {
                warn!(
                    entry_id = %draft.id,
                    matched_id = %best.entry.id,
                    error = %format!("{:#}", e),
                    "comparison failed; opening review task without differences"
                );
                (None, None)
            }
        };

        if let Some(task) = existing {
            let mut notes = summary.clone().unwrap_or_else(|| {
                format!(
                    "overlaps approved manual {} (score {:.2})",
                    best.entry.id, best.score
                )
            });
            if let Some(earlier) = task.differences.as_ref().filter(|d| !d.is_empty()) {
                notes = format!("{}; earlier findings: {}", notes, earlier.join("; "));
            }
            let annotation = TaskAnnotation {
                matched: Some(TaskMatch {
                    old_entry_id: best.entry.id.clone(),
                    similarity_score: best.score,
                    differences: differences.clone(),
                }),
                event: TaskEvent::note("system", TaskStatus::Todo, notes),
            };
            let attached = self
                .repository
                .annotate_task(&task.id, &annotation)
                .await
                .map_err(ManualError::Storage)?;
            if attached {
                info!(
                    task_id = %task.id,
                    entry_id = %draft.id,
                    matched_id = %best.entry.id,
                    score = best.score,
                    "attached approved match to open review task"
                );
                return Ok(task.id);
            }
            // Closed or matched in the meantime.
        }

        let task = ReviewTask::open(
            &draft.id,
            Some(best.entry.id.clone()),
            TaskReason::Conflict,
            Some(best.score),
            differences,
            summary,
        );
        self.open_task(task).await
    }

    async fn existing_open_task(&self, entry_id: &str) -> Result<Option<String>> {
        Ok(self
            .repository
            .find_open_task_for_entry(entry_id)
            .await
            .map_err(ManualError::Storage)?
            .map(|t| t.id))
    }

    /// Persist `task` unless the draft already has an open task, in which
    /// case the existing task's id is returned instead.
    pub async fn open_task(&self, task: ReviewTask) -> Result<String> {
        if let Some(existing) = self.existing_open_task(&task.new_entry_id).await? {
            return Ok(existing);
        }
        match self
            .repository
            .insert_task(&task)
            .await
            .map_err(ManualError::Storage)?
        {
            TaskInsert::Inserted => {
                info!(
                    task_id = %task.id,
                    entry_id = %task.new_entry_id,
                    reason = task.reason.as_str(),
                    score = ?task.similarity_score,
                    "opened review task"
                );
                Ok(task.id)
            }
            TaskInsert::AlreadyOpen(existing) => Ok(existing),
        }
    }
}

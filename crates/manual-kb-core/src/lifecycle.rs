//! The manual state machine.
//!
//! ```text
//!            approve                deprecate / superseded
//!   DRAFT ─────────────▶ APPROVED ─────────────────────────▶ DEPRECATED
//!     │ update (DRAFT only)
//!     │ delete (DRAFT only)
//! ```
//!
//! Every transition checks its precondition before the first write and
//! fails with [`ManualError::State`] when it does not hold. Approval writes
//! the status flip, version snapshot, sibling deprecation and (from the
//! review workflow) the task closure as one repository commit. Index
//! maintenance happens after the commit and never fails the operation:
//! an index error becomes a retry job, reported through [`IndexSync`].

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conflict::{ConflictDetector, ConflictResult};
use crate::error::{Entity, ManualError, Result};
use crate::generation::{Drafter, MAX_KEYWORDS};
use crate::index::{IndexMetadata, SimilarityIndex};
use crate::models::{
    LogicalKey, ManualContent, ManualEntry, ManualStatus, ManualVersion, ReviewTask, TaskEvent,
    TaskReason, TaskStatus,
};
use crate::params::EngineParams;
use crate::queue::{entry_payload, RetryJobKind, RetryQueue};
use crate::repository::{
    ApprovalCommit, CommitOutcome, DeleteOutcome, EntryFilter, ManualRepository, TaskAnnotation,
    TaskClosure,
};
use crate::source_text::{consultation_text, manual_text};
use crate::validation::GroundingReport;
use crate::version::VersionLabel;

/// Commit attempts before an approval that keeps losing the lineage race
/// gives up.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Where a new draft comes from.
#[derive(Debug, Clone)]
pub enum DraftSource {
    /// Generate the draft from a stored consultation.
    Consultation { consultation_id: String },
    /// Hand-written content.
    Authored(AuthoredDraft),
}

#[derive(Debug, Clone)]
pub struct AuthoredDraft {
    pub key: LogicalKey,
    pub content: ManualContent,
    /// When set (and grounding is enforced) the content is checked against
    /// this consultation.
    pub source_consultation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DraftOptions {
    /// Check generated content against its source text and force a review
    /// task when it is not grounded.
    pub enforce_grounding: bool,
    /// Overrides the engine's default drafting instructions.
    pub instructions: Option<String>,
}

impl Default for DraftOptions {
    fn default() -> Self {
        Self {
            enforce_grounding: true,
            instructions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftOutcome {
    pub entry: ManualEntry,
    /// `None` when grounding was not checked.
    pub grounding: Option<GroundingReport>,
    pub conflict: ConflictResult,
    /// The task the draft is waiting on, whether opened for a conflict or
    /// because the content is ungrounded.
    pub review_task_id: Option<String>,
}

/// Field-level changes to a draft. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct ManualPatch {
    pub keywords: Option<Vec<String>>,
    pub topic: Option<String>,
    pub background: Option<String>,
    pub guideline: Option<String>,
}

impl ManualPatch {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_none()
            && self.topic.is_none()
            && self.background.is_none()
            && self.guideline.is_none()
    }

    fn apply(&self, content: &ManualContent) -> ManualContent {
        ManualContent {
            keywords: self
                .keywords
                .clone()
                .unwrap_or_else(|| content.keywords.clone()),
            topic: self.topic.clone().unwrap_or_else(|| content.topic.clone()),
            background: self
                .background
                .clone()
                .unwrap_or_else(|| content.background.clone()),
            guideline: self
                .guideline
                .clone()
                .unwrap_or_else(|| content.guideline.clone()),
        }
    }
}

/// Outcome of the index step that follows a committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexSync {
    /// The index reflects the write.
    Synced,
    /// The index call failed; a retry job will replay it.
    Deferred { job_id: String },
    /// The index call failed and the retry job could not be queued either.
    Unsynced { reason: String },
}

impl IndexSync {
    pub fn is_synced(&self) -> bool {
        matches!(self, IndexSync::Synced)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    /// The entry as committed: APPROVED with its new label.
    pub entry: ManualEntry,
    pub version: ManualVersion,
    /// Ids of siblings moved to DEPRECATED by this approval.
    pub deprecated: Vec<String>,
    pub index: IndexSync,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeprecationOutcome {
    pub entry: ManualEntry,
    pub index: IndexSync,
}

/// Trim every field and check the shape rules shared by all writes.
pub fn tidy_content(content: &ManualContent) -> Result<ManualContent> {
    let keywords: Vec<String> = content
        .keywords
        .iter()
        .map(|k| k.trim().to_string())
        .collect();
    if keywords.is_empty() {
        return Err(ManualError::validation("at least one keyword is required"));
    }
    if keywords.len() > MAX_KEYWORDS {
        return Err(ManualError::validation(format!(
            "at most {} keywords are allowed, got {}",
            MAX_KEYWORDS,
            keywords.len()
        )));
    }
    if keywords.iter().any(|k| k.is_empty()) {
        return Err(ManualError::validation("keywords must not be blank"));
    }
    let topic = content.topic.trim().to_string();
    if topic.is_empty() {
        return Err(ManualError::validation("topic must not be empty"));
    }
    Ok(ManualContent {
        keywords,
        topic,
        background: content.background.trim().to_string(),
        guideline: content.guideline.trim().to_string(),
    })
}

fn tidy_key(key: &LogicalKey) -> Result<LogicalKey> {
    let key = LogicalKey::new(key.business_type.trim(), key.error_code.trim());
    if key.business_type.is_empty() || key.error_code.is_empty() {
        return Err(ManualError::validation(
            "business_type and error_code must not be empty",
        ));
    }
    Ok(key)
}

fn require_actor(actor: &str, role: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(ManualError::validation(format!("{} must not be empty", role)));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ManualLifecycle {
    repository: Arc<dyn ManualRepository>,
    index: Arc<dyn SimilarityIndex>,
    drafter: Arc<dyn Drafter>,
    retry_queue: Arc<dyn RetryQueue>,
    detector: ConflictDetector,
    params: Arc<EngineParams>,
}

impl ManualLifecycle {
    pub fn new(
        repository: Arc<dyn ManualRepository>,
        index: Arc<dyn SimilarityIndex>,
        drafter: Arc<dyn Drafter>,
        retry_queue: Arc<dyn RetryQueue>,
        params: Arc<EngineParams>,
    ) -> Self {
        let detector = ConflictDetector::new(
            repository.clone(),
            index.clone(),
            drafter.clone(),
            params.clone(),
        );
        Self {
            repository,
            index,
            drafter,
            retry_queue,
            detector,
            params,
        }
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub async fn get(&self, entry_id: &str) -> Result<ManualEntry> {
        self.repository
            .get_entry(entry_id)
            .await
            .map_err(ManualError::Storage)?
            .ok_or_else(|| ManualError::not_found(Entity::Manual, entry_id))
    }

    pub async fn list(&self, filter: &EntryFilter) -> Result<Vec<ManualEntry>> {
        self.repository
            .list_entries(filter)
            .await
            .map_err(ManualError::Storage)
    }

    /// Every version recorded for `entry_id`, oldest first.
    pub async fn versions(&self, entry_id: &str) -> Result<Vec<ManualVersion>> {
        self.get(entry_id).await?;
        self.repository
            .list_versions(entry_id)
            .await
            .map_err(ManualError::Storage)
    }

    pub async fn current_version(&self, entry_id: &str) -> Result<Option<ManualVersion>> {
        self.get(entry_id).await?;
        self.repository
            .find_latest_version(entry_id)
            .await
            .map_err(ManualError::Storage)
    }

    /// Re-run conflict detection for an existing draft.
    pub async fn check(&self, entry_id: &str) -> Result<ConflictResult> {
        let entry = self.get(entry_id).await?;
        self.detector.check_conflict(&entry).await
    }

    /// Persist a new DRAFT and classify it against approved knowledge.
    ///
    /// Consultation drafts call the drafting backend first; a backend
    /// failure is returned before anything is written. Grounding failures
    /// never block the write, but they guarantee the draft a review task.
    pub async fn create_draft(
        &self,
        source: DraftSource,
        options: &DraftOptions,
    ) -> Result<DraftOutcome> {
        let (key, content, source_consultation_id, source_text) = match source {
            DraftSource::Consultation { consultation_id } => {
                let consultation = self
                    .repository
                    .get_consultation(&consultation_id)
                    .await
                    .map_err(ManualError::Storage)?
                    .ok_or_else(|| ManualError::not_found(Entity::Consultation, &consultation_id))?;
                let key = tidy_key(&consultation.logical_key())?;
                let text = consultation_text(&consultation);
                let instructions = options
                    .instructions
                    .as_deref()
                    .unwrap_or(&self.params.instructions);
                let generated = self
                    .drafter
                    .draft(&text, instructions)
                    .await
                    .map_err(ManualError::Generation)?;
                let content = generated
                    .into_content()
                    .map_err(|msg| ManualError::Generation(anyhow!(msg)))?;
                (key, content, Some(consultation_id), Some(text))
            }
            DraftSource::Authored(authored) => {
                let key = tidy_key(&authored.key)?;
                let content = tidy_content(&authored.content)?;
                let text = match (&authored.source_consultation_id, options.enforce_grounding) {
                    (Some(id), true) => {
                        let consultation = self
                            .repository
                            .get_consultation(id)
                            .await
                            .map_err(ManualError::Storage)?
                            .ok_or_else(|| ManualError::not_found(Entity::Consultation, id))?;
                        Some(consultation_text(&consultation))
                    }
                    _ => None,
                };
                (key, content, authored.source_consultation_id, text)
            }
        };

        let grounding = match (&source_text, options.enforce_grounding) {
            (Some(text), true) => Some(GroundingReport::check(&content, text)),
            _ => None,
        };

        let entry = ManualEntry::new_draft(key, content, source_consultation_id);
        self.repository
            .insert_entry(&entry)
            .await
            .map_err(ManualError::Storage)?;
        info!(entry_id = %entry.id, key = %entry.key, "created draft");

        let conflict = match self.detector.check_conflict(&entry).await {
            Ok(result) => result,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "conflict check failed; treating draft as NEW");
                ConflictResult::unmatched()
            }
        };

        let mut review_task_id = conflict.task_id.clone();
        if let Some(report) = grounding.as_ref().filter(|r| !r.is_grounded()) {
            if review_task_id.is_none() {
                let task = ReviewTask::open(
                    &entry.id,
                    conflict.matched_entry.as_ref().map(|m| m.id.clone()),
                    TaskReason::Ungrounded,
                    conflict.similarity_score,
                    Some(report.findings()),
                    Some("generated content is not grounded in its source".to_string()),
                );
                review_task_id = Some(self.detector.open_task(task).await?);
            } else if let Some(task_id) = &review_task_id {
                let annotation = TaskAnnotation {
                    matched: None,
                    event: TaskEvent::note(
                        "system",
                        TaskStatus::Todo,
                        format!("not grounded in source: {}", report.findings().join("; ")),
                    ),
                };
                let noted = self
                    .repository
                    .annotate_task(task_id, &annotation)
                    .await
                    .map_err(ManualError::Storage)?;
                if !noted {
                    warn!(task_id = %task_id, "review task no longer open; grounding findings not recorded");
                }
            }
            warn!(
                entry_id = %entry.id,
                findings = report.findings().len(),
                "draft content not grounded in source; routed to review"
            );
        }

        Ok(DraftOutcome {
            entry,
            grounding,
            conflict,
            review_task_id,
        })
    }

    /// Apply `patch` to a DRAFT.
    pub async fn update(&self, entry_id: &str, patch: &ManualPatch) -> Result<ManualEntry> {
        if patch.is_empty() {
            return Err(ManualError::validation("update contains no changes"));
        }
        let mut entry = self.get(entry_id).await?;
        if !entry.is_draft() {
            return Err(ManualError::state(
                Entity::Manual,
                entry_id,
                entry.status,
                ManualStatus::Draft,
            ));
        }
        let content = tidy_content(&patch.apply(&entry.content))?;
        let now = Utc::now();
        let updated = self
            .repository
            .update_draft_content(entry_id, &content, now)
            .await
            .map_err(ManualError::Storage)?;
        if !updated {
            return Err(self.manual_state_error(entry_id, ManualStatus::Draft).await);
        }
        entry.content = content;
        entry.updated_at = now;
        debug!(entry_id, "updated draft");
        Ok(entry)
    }

    /// Approve a DRAFT on behalf of `approver`.
    pub async fn approve(&self, entry_id: &str, approver: &str) -> Result<ApprovalOutcome> {
        self.approve_inner(entry_id, approver, None).await
    }

    /// Approve a DRAFT and close `closure`'s task in the same commit.
    pub(crate) async fn approve_with_task(
        &self,
        entry_id: &str,
        approver: &str,
        closure: TaskClosure,
    ) -> Result<ApprovalOutcome> {
        self.approve_inner(entry_id, approver, Some(closure)).await
    }

    async fn approve_inner(
        &self,
        entry_id: &str,
        approver: &str,
        closure: Option<TaskClosure>,
    ) -> Result<ApprovalOutcome> {
        require_actor(approver, "approver")?;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let entry = self.get(entry_id).await?;
            if !entry.is_draft() {
                return Err(ManualError::state(
                    Entity::Manual,
                    entry_id,
                    entry.status,
                    ManualStatus::Draft,
                ));
            }

            let previous = self
                .repository
                .find_latest_version_for_key(&entry.key)
                .await
                .map_err(ManualError::Storage)?
                .map(|v| v.label);
            let label = VersionLabel::following(previous)?;
            let approved_at = Utc::now();
            let version = ManualVersion {
                id: Uuid::new_v4().to_string(),
                entry_id: entry.id.clone(),
                key: entry.key.clone(),
                label,
                snapshot: entry.content.clone(),
                approved_by: approver.trim().to_string(),
                approved_at,
            };
            let commit = ApprovalCommit {
                entry_id: entry.id.clone(),
                key: entry.key.clone(),
                version: version.clone(),
                previous_label: previous,
                task: closure.clone(),
            };

            let deprecated = match self
                .repository
                .commit_approval(&commit)
                .await
                .map_err(ManualError::Storage)?
            {
                CommitOutcome::Committed { deprecated } => deprecated,
                CommitOutcome::LineageMoved => {
                    debug!(entry_id, attempt, "version lineage moved; retrying approval");
                    continue;
                }
                CommitOutcome::EntryNotDraft => {
                    return Err(self.manual_state_error(entry_id, ManualStatus::Draft).await);
                }
                CommitOutcome::TaskNotOpen => {
                    let task_id = closure.as_ref().map(|c| c.task_id.as_str()).unwrap_or("");
                    return Err(self.task_state_error(task_id).await);
                }
            };

            let mut approved = entry;
            approved.status = ManualStatus::Approved;
            approved.version = Some(label);
            approved.approved_at = Some(approved_at);
            approved.updated_at = approved_at;
            info!(
                entry_id = %approved.id,
                key = %approved.key,
                version = %label,
                approver = %version.approved_by,
                deprecated = deprecated.len(),
                "approved manual"
            );

            let index = self.index_entry(&approved).await;
            for sibling in &deprecated {
                self.unindex(sibling).await;
            }

            return Ok(ApprovalOutcome {
                entry: approved,
                version,
                deprecated,
                index,
            });
        }

        Err(ManualError::Storage(anyhow!(
            "approval of {} lost the version race {} times",
            entry_id,
            MAX_COMMIT_ATTEMPTS
        )))
    }

    /// Delete a DRAFT together with its open review tasks.
    ///
    /// Returns the number of review tasks removed.
    pub async fn delete(&self, entry_id: &str) -> Result<u64> {
        let entry = self.get(entry_id).await?;
        if !entry.is_draft() {
            return Err(ManualError::state(
                Entity::Manual,
                entry_id,
                entry.status,
                ManualStatus::Draft,
            ));
        }

        // Drafts are never indexed; the delete only clears strays.
        if let Err(e) = self.index.delete(entry_id).await {
            warn!(entry_id, error = %format!("{:#}", e), "index delete failed for draft");
        }

        match self
            .repository
            .delete_draft(entry_id)
            .await
            .map_err(ManualError::Storage)?
        {
            DeleteOutcome::Deleted { removed_tasks } => {
                info!(entry_id, removed_tasks, "deleted draft");
                Ok(removed_tasks)
            }
            DeleteOutcome::NotFound => Err(ManualError::not_found(Entity::Manual, entry_id)),
            DeleteOutcome::NotDraft(status) => Err(ManualError::state(
                Entity::Manual,
                entry_id,
                status,
                ManualStatus::Draft,
            )),
        }
    }

    /// Retire an APPROVED manual without a successor.
    pub async fn deprecate(&self, entry_id: &str, actor: &str) -> Result<DeprecationOutcome> {
        require_actor(actor, "actor")?;
        let mut entry = self.get(entry_id).await?;
        if entry.status != ManualStatus::Approved {
            return Err(ManualError::state(
                Entity::Manual,
                entry_id,
                entry.status,
                ManualStatus::Approved,
            ));
        }
        let now = Utc::now();
        let changed = self
            .repository
            .deprecate_entry(entry_id, now)
            .await
            .map_err(ManualError::Storage)?;
        if !changed {
            return Err(self.manual_state_error(entry_id, ManualStatus::Approved).await);
        }
        entry.status = ManualStatus::Deprecated;
        entry.updated_at = now;
        info!(entry_id, actor, "deprecated manual");

        let index = self.unindex(entry_id).await;
        Ok(DeprecationOutcome { entry, index })
    }

    /// Index an APPROVED entry, deferring to the retry queue on failure.
    async fn index_entry(&self, entry: &ManualEntry) -> IndexSync {
        let text = manual_text(&entry.content);
        match self
            .index
            .index(&entry.id, &text, &IndexMetadata::from(&entry.key))
            .await
        {
            Ok(()) => IndexSync::Synced,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %format!("{:#}", e), "index write failed");
                self.defer(RetryJobKind::IndexEntry, &entry.id).await
            }
        }
    }

    /// Drop an entry from the index, deferring to the retry queue on failure.
    async fn unindex(&self, entry_id: &str) -> IndexSync {
        match self.index.delete(entry_id).await {
            Ok(()) => IndexSync::Synced,
            Err(e) => {
                warn!(entry_id, error = %format!("{:#}", e), "index delete failed");
                self.defer(RetryJobKind::RemoveFromIndex, entry_id).await
            }
        }
    }

    async fn defer(&self, kind: RetryJobKind, entry_id: &str) -> IndexSync {
        match self.retry_queue.enqueue(kind, entry_payload(entry_id)).await {
            Ok(job_id) => {
                info!(entry_id, job_id = %job_id, kind = %kind, "queued index retry");
                IndexSync::Deferred { job_id }
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(entry_id, kind = %kind, error = %reason, "could not queue index retry");
                IndexSync::Unsynced { reason }
            }
        }
    }

    /// Explain why a compare-and-set on an entry did not apply.
    async fn manual_state_error(&self, entry_id: &str, required: ManualStatus) -> ManualError {
        match self.get(entry_id).await {
            Ok(entry) => ManualError::state(Entity::Manual, entry_id, entry.status, required),
            Err(e) => e,
        }
    }

    /// Explain why a task transition did not apply.
    pub(crate) async fn task_state_error(&self, task_id: &str) -> ManualError {
        match self.repository.get_task(task_id).await {
            Ok(Some(task)) => ManualError::state(Entity::Task, task_id, task.status, "TODO"),
            Ok(None) => ManualError::not_found(Entity::Task, task_id),
            Err(e) => ManualError::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;
    use crate::generation::scripted::ScriptedDrafter;
    use crate::generation::GeneratedDraft;
    use crate::index::memory::InMemoryIndex;
    use crate::generation::Comparison;
    use crate::models::Consultation;
    use crate::queue::memory::InMemoryRetryQueue;
    use crate::repository::memory::InMemoryRepository;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        index: Arc<InMemoryIndex>,
        drafter: Arc<ScriptedDrafter>,
        queue: Arc<InMemoryRetryQueue>,
        lifecycle: ManualLifecycle,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let index = Arc::new(InMemoryIndex::new());
        let drafter = Arc::new(ScriptedDrafter::new());
        let queue = Arc::new(InMemoryRetryQueue::new());
        let lifecycle = ManualLifecycle::new(
            repo.clone(),
            index.clone(),
            drafter.clone(),
            queue.clone(),
            Arc::new(EngineParams::default()),
        );
        Fixture {
            repo,
            index,
            drafter,
            queue,
            lifecycle,
        }
    }

    fn card_key() -> LogicalKey {
        LogicalKey::new("CARD", "E401")
    }

    fn content(topic: &str) -> ManualContent {
        ManualContent {
            keywords: vec!["CVV".into(), "결제".into()],
            topic: topic.into(),
            background: "고객이 카드 결제 중 CVV 인증 오류를 겪음".into(),
            guideline: "CVV 세 자리를 다시 확인하도록 안내".into(),
        }
    }

    fn consultation() -> Consultation {
        Consultation {
            id: "c-1".into(),
            summary: "카드 결제 중 CVV 인증 실패".into(),
            inquiry: "결제 오류가 계속 발생합니다".into(),
            action_taken: "CVV 재입력 안내".into(),
            branch: None,
            business_type: "CARD".into(),
            error_code: "E401".into(),
        }
    }

    async fn new_draft(f: &Fixture, topic: &str) -> ManualEntry {
        f.lifecycle
            .create_draft(
                DraftSource::Authored(AuthoredDraft {
                    key: card_key(),
                    content: content(topic),
                    source_consultation_id: None,
                }),
                &DraftOptions::default(),
            )
            .await
            .unwrap()
            .entry
    }

    #[tokio::test]
    async fn approving_second_draft_deprecates_first() {
        let f = fixture();
        let first = new_draft(&f, "첫 번째").await;
        let second = new_draft(&f, "두 번째").await;

        f.lifecycle.approve(&first.id, "lead").await.unwrap();
        let outcome = f.lifecycle.approve(&second.id, "lead").await.unwrap();
        assert_eq!(outcome.deprecated, vec![first.id.clone()]);

        let approved = f
            .repo
            .find_approved_by_logical_key(&card_key())
            .await
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].id, second.id);
        let first_now = f.lifecycle.get(&first.id).await.unwrap();
        assert_eq!(first_now.status, ManualStatus::Deprecated);
        assert!(!f.index.contains(&first.id));
        assert!(f.index.contains(&second.id));
    }

    #[tokio::test]
    async fn successive_approvals_bump_minor_version() {
        let f = fixture();
        let mut labels = Vec::new();
        for topic in ["v1", "v2", "v3"] {
            let d = new_draft(&f, topic).await;
            let outcome = f.lifecycle.approve(&d.id, "lead").await.unwrap();
            assert_eq!(outcome.entry.version, Some(outcome.version.label));
            labels.push(outcome.version.label.to_string());
        }
        assert_eq!(labels, vec!["1.0", "1.1", "1.2"]);
    }

    #[tokio::test]
    async fn approve_of_approved_entry_writes_nothing() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        f.lifecycle.approve(&d.id, "lead").await.unwrap();
        let versions_before = f.repo.version_count();
        let tasks_before = f.repo.task_count();
        let entry_before = f.lifecycle.get(&d.id).await.unwrap();

        let err = f.lifecycle.approve(&d.id, "lead").await.unwrap_err();
        match err {
            ManualError::State {
                current, required, ..
            } => {
                assert_eq!(current, "APPROVED");
                assert_eq!(required, "DRAFT");
            }
            other => panic!("expected state error, got {other}"),
        }
        assert_eq!(f.repo.version_count(), versions_before);
        assert_eq!(f.repo.task_count(), tasks_before);
        assert_eq!(f.lifecycle.get(&d.id).await.unwrap(), entry_before);
    }

    #[tokio::test]
    async fn index_failure_defers_with_one_retry_job() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        f.index.fail_index(true);

        let outcome = f.lifecycle.approve(&d.id, "lead").await.unwrap();
        assert_eq!(outcome.entry.status, ManualStatus::Approved);
        let jobs = f.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, RetryJobKind::IndexEntry);
        assert_eq!(jobs[0].entry_id(), Some(d.id.as_str()));
        assert_eq!(
            outcome.index,
            IndexSync::Deferred {
                job_id: jobs[0].id.clone()
            }
        );
        assert_eq!(
            f.lifecycle.get(&d.id).await.unwrap().status,
            ManualStatus::Approved
        );
    }

    #[tokio::test]
    async fn unqueueable_index_failure_is_reported() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        f.index.fail_index(true);
        f.queue.fail_enqueue(true);

        let outcome = f.lifecycle.approve(&d.id, "lead").await.unwrap();
        assert!(matches!(outcome.index, IndexSync::Unsynced { .. }));
        assert_eq!(outcome.entry.status, ManualStatus::Approved);
    }

    #[tokio::test]
    async fn failed_commit_leaves_draft_untouched() {
        let f = fixture();
        let first = new_draft(&f, "a").await;
        f.lifecycle.approve(&first.id, "lead").await.unwrap();
        let second = new_draft(&f, "b").await;

        f.repo.fail_commits(true);
        let err = f.lifecycle.approve(&second.id, "lead").await.unwrap_err();
        assert!(matches!(err, ManualError::Storage(_)));

        assert!(f.lifecycle.get(&second.id).await.unwrap().is_draft());
        assert_eq!(
            f.lifecycle.get(&first.id).await.unwrap().status,
            ManualStatus::Approved
        );
        assert_eq!(f.repo.version_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_lineage_refuses_approval() {
        let f = fixture();
        let last = new_draft(&f, "a").await;
        f.repo
            .commit_approval(&ApprovalCommit {
                entry_id: last.id.clone(),
                key: card_key(),
                version: ManualVersion {
                    id: Uuid::new_v4().to_string(),
                    entry_id: last.id.clone(),
                    key: card_key(),
                    label: VersionLabel::new(1, u32::MAX),
                    snapshot: last.content.clone(),
                    approved_by: "import".into(),
                    approved_at: Utc::now(),
                },
                previous_label: None,
                task: None,
            })
            .await
            .unwrap();
        let next = new_draft(&f, "b").await;

        let err = f.lifecycle.approve(&next.id, "lead").await.unwrap_err();
        assert!(matches!(err, ManualError::Storage(_)));
        assert!(f.lifecycle.get(&next.id).await.unwrap().is_draft());
        assert_eq!(f.repo.version_count(), 1);
    }

    #[tokio::test]
    async fn second_delete_is_not_found() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        f.lifecycle.delete(&d.id).await.unwrap();
        let err = f.lifecycle.delete(&d.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_requires_draft_and_clears_open_tasks() {
        let f = fixture();
        let approved = new_draft(&f, "a").await;
        f.lifecycle.approve(&approved.id, "lead").await.unwrap();
        let err = f.lifecycle.delete(&approved.id).await.unwrap_err();
        assert!(err.is_state());

        f.index.pin_score(&approved.id, 0.8);
        let d = new_draft(&f, "b").await;
        assert!(f.repo.find_open_task_for_entry(&d.id).await.unwrap().is_some());
        assert_eq!(f.lifecycle.delete(&d.id).await.unwrap(), 1);
        assert!(f.repo.find_open_task_for_entry(&d.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_survives_index_outage() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        f.index.set_unavailable(true);
        f.lifecycle.delete(&d.id).await.unwrap();
        assert!(f.lifecycle.get(&d.id).await.unwrap_err().is_not_found());
        assert!(f.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn update_only_while_draft() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        let patch = ManualPatch {
            topic: Some("  새 주제  ".into()),
            ..Default::default()
        };
        let updated = f.lifecycle.update(&d.id, &patch).await.unwrap();
        assert_eq!(updated.content.topic, "새 주제");
        assert_eq!(updated.content.keywords, d.content.keywords);

        f.lifecycle.approve(&d.id, "lead").await.unwrap();
        let err = f.lifecycle.update(&d.id, &patch).await.unwrap_err();
        assert!(err.is_state());
    }

    #[tokio::test]
    async fn update_validates_content() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        for patch in [
            ManualPatch::default(),
            ManualPatch {
                topic: Some("   ".into()),
                ..Default::default()
            },
            ManualPatch {
                keywords: Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]),
                ..Default::default()
            },
            ManualPatch {
                keywords: Some(vec![]),
                ..Default::default()
            },
        ] {
            let err = f.lifecycle.update(&d.id, &patch).await.unwrap_err();
            assert!(matches!(err, ManualError::Validation(_)), "{patch:?}");
        }
    }

    #[tokio::test]
    async fn deprecate_is_one_way() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        f.lifecycle.approve(&d.id, "lead").await.unwrap();

        let outcome = f.lifecycle.deprecate(&d.id, "lead").await.unwrap();
        assert_eq!(outcome.entry.status, ManualStatus::Deprecated);
        assert_eq!(outcome.index, IndexSync::Synced);
        assert!(!f.index.contains(&d.id));

        assert!(f.lifecycle.deprecate(&d.id, "lead").await.unwrap_err().is_state());
        assert!(f.lifecycle.approve(&d.id, "lead").await.unwrap_err().is_state());
        assert!(f
            .lifecycle
            .update(
                &d.id,
                &ManualPatch {
                    topic: Some("x".into()),
                    ..Default::default()
                }
            )
            .await
            .unwrap_err()
            .is_state());
    }

    #[tokio::test]
    async fn deprecate_defers_index_removal() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        f.lifecycle.approve(&d.id, "lead").await.unwrap();
        f.index.fail_delete(true);

        let outcome = f.lifecycle.deprecate(&d.id, "lead").await.unwrap();
        assert!(matches!(outcome.index, IndexSync::Deferred { .. }));
        assert_eq!(f.queue.jobs()[0].kind, RetryJobKind::RemoveFromIndex);
    }

    #[tokio::test]
    async fn grounded_consultation_draft_without_conflict_needs_no_task() {
        let f = fixture();
        f.repo.add_consultation(consultation());
        f.drafter.push_draft(GeneratedDraft {
            keywords: vec!["CVV".into(), "결제".into()],
            topic: "CVV 인증 실패".into(),
            background: "카드 결제 중 CVV 인증 실패".into(),
            guideline: "CVV 재입력 안내".into(),
        });

        let outcome = f
            .lifecycle
            .create_draft(
                DraftSource::Consultation {
                    consultation_id: "c-1".into(),
                },
                &DraftOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.entry.is_draft());
        assert_eq!(outcome.entry.source_consultation_id.as_deref(), Some("c-1"));
        assert!(outcome.grounding.unwrap().is_grounded());
        assert_eq!(outcome.conflict.kind, ConflictKind::New);
        assert_eq!(outcome.review_task_id, None);
    }

    #[tokio::test]
    async fn ungrounded_draft_forces_review_task() {
        let f = fixture();
        f.repo.add_consultation(consultation());
        f.drafter.push_draft(GeneratedDraft {
            keywords: vec!["해킹".into()],
            topic: "카드 해킹 의심".into(),
            background: "해킹 시도가 감지됨".into(),
            guideline: "CVV 재입력 안내".into(),
        });

        let outcome = f
            .lifecycle
            .create_draft(
                DraftSource::Consultation {
                    consultation_id: "c-1".into(),
                },
                &DraftOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.entry.is_draft());
        assert_eq!(outcome.conflict.kind, ConflictKind::New);

        let task_id = outcome.review_task_id.unwrap();
        let task = f.repo.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.reason, TaskReason::Ungrounded);
        assert_eq!(task.status, TaskStatus::Todo);
        let findings = task.differences.unwrap();
        assert!(findings.iter().any(|d| d.contains("해킹")));
    }

    fn push_ungrounded_draft(f: &Fixture) {
        f.repo.add_consultation(consultation());
        f.drafter.push_draft(GeneratedDraft {
            keywords: vec!["해킹".into()],
            topic: "카드 해킹 의심".into(),
            background: "해킹 시도가 감지됨".into(),
            guideline: "CVV 재입력 안내".into(),
        });
    }

    async fn consultation_draft(f: &Fixture) -> DraftOutcome {
        f.lifecycle
            .create_draft(
                DraftSource::Consultation {
                    consultation_id: "c-1".into(),
                },
                &DraftOptions::default(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn later_supplement_match_is_recorded_on_ungrounded_task() {
        let f = fixture();
        push_ungrounded_draft(&f);
        let outcome = consultation_draft(&f).await;
        let task_id = outcome.review_task_id.unwrap();

        let approved = new_draft(&f, "기존 매뉴얼").await;
        f.lifecycle.approve(&approved.id, "lead").await.unwrap();
        f.index.pin_score(&approved.id, 0.80);
        f.drafter.set_comparison(Comparison {
            differences: vec!["mentions hacking".into()],
            summary: "draft adds a hacking warning".into(),
        });

        let result = f.lifecycle.check(&outcome.entry.id).await.unwrap();
        assert_eq!(result.kind, ConflictKind::Supplement);
        assert_eq!(result.task_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(f.drafter.compare_calls(), 1);
        assert_eq!(f.repo.task_count(), 1);

        let task = f.repo.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.old_entry_id.as_deref(), Some(approved.id.as_str()));
        assert_eq!(task.similarity_score, Some(0.80));
        assert_eq!(
            task.differences.as_deref(),
            Some(&["mentions hacking".to_string()][..])
        );
        let note = task.history.last().unwrap().notes.clone().unwrap();
        assert!(note.contains("hacking warning"));
        assert!(note.contains("해킹"));

        // Already matched: a repeat check reuses it without comparing again.
        f.lifecycle.check(&outcome.entry.id).await.unwrap();
        assert_eq!(f.drafter.compare_calls(), 1);
    }

    #[tokio::test]
    async fn ungrounded_supplement_draft_notes_findings_on_conflict_task() {
        let f = fixture();
        let approved = new_draft(&f, "기존 매뉴얼").await;
        f.lifecycle.approve(&approved.id, "lead").await.unwrap();
        f.index.pin_score(&approved.id, 0.80);
        push_ungrounded_draft(&f);

        let outcome = consultation_draft(&f).await;
        assert_eq!(outcome.conflict.kind, ConflictKind::Supplement);
        let task_id = outcome.review_task_id.unwrap();
        assert_eq!(outcome.conflict.task_id.as_deref(), Some(task_id.as_str()));

        let task = f.repo.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.reason, TaskReason::Conflict);
        assert_eq!(task.old_entry_id.as_deref(), Some(approved.id.as_str()));
        assert_eq!(task.history.len(), 2);
        let note = task.history[1].notes.as_deref().unwrap();
        assert!(note.starts_with("not grounded in source"));
        assert!(note.contains("해킹"));
    }

    #[tokio::test]
    async fn grounding_can_be_waived() {
        let f = fixture();
        f.repo.add_consultation(consultation());
        f.drafter.push_draft(GeneratedDraft {
            keywords: vec!["해킹".into()],
            topic: "카드 해킹 의심".into(),
            ..Default::default()
        });

        let outcome = f
            .lifecycle
            .create_draft(
                DraftSource::Consultation {
                    consultation_id: "c-1".into(),
                },
                &DraftOptions {
                    enforce_grounding: false,
                    instructions: None,
                },
            )
            .await
            .unwrap();
        assert!(outcome.grounding.is_none());
        assert!(outcome.review_task_id.is_none());
    }

    #[tokio::test]
    async fn generation_failure_writes_nothing() {
        let f = fixture();
        f.repo.add_consultation(consultation());
        f.drafter.fail_draft(true);

        let err = f
            .lifecycle
            .create_draft(
                DraftSource::Consultation {
                    consultation_id: "c-1".into(),
                },
                &DraftOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManualError::Generation(_)));
        assert!(f.lifecycle.list(&EntryFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_generation_is_a_generation_error() {
        let f = fixture();
        f.repo.add_consultation(consultation());
        f.drafter.push_draft(GeneratedDraft {
            keywords: vec![],
            topic: "주제".into(),
            ..Default::default()
        });
        let err = f
            .lifecycle
            .create_draft(
                DraftSource::Consultation {
                    consultation_id: "c-1".into(),
                },
                &DraftOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManualError::Generation(_)));
    }

    #[tokio::test]
    async fn unknown_consultation_is_not_found() {
        let f = fixture();
        let err = f
            .lifecycle
            .create_draft(
                DraftSource::Consultation {
                    consultation_id: "missing".into(),
                },
                &DraftOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn draft_survives_index_outage() {
        let f = fixture();
        f.index.set_unavailable(true);
        let d = new_draft(&f, "t").await;
        assert!(f.lifecycle.get(&d.id).await.unwrap().is_draft());
    }

    #[tokio::test]
    async fn versions_are_listed_per_entry() {
        let f = fixture();
        let d = new_draft(&f, "t").await;
        assert!(f.lifecycle.current_version(&d.id).await.unwrap().is_none());
        f.lifecycle.approve(&d.id, "lead").await.unwrap();
        let versions = f.lifecycle.versions(&d.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].approved_by, "lead");
        assert_eq!(versions[0].snapshot, d.content);
        assert_eq!(
            f.lifecycle.current_version(&d.id).await.unwrap().unwrap().label,
            VersionLabel::INITIAL
        );
    }
}

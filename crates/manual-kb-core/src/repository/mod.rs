//! Relational source of truth for manuals, versions, and review tasks.
//!
//! The [`ManualRepository`] trait is the engine's query contract. Every
//! state-changing method is a compare-and-set against the expected current
//! status, so a stale read turns into a reported outcome instead of a lost
//! update. [`ManualRepository::commit_approval`] is the one multi-row
//! operation and must apply all of its writes or none of them.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Consultation, LogicalKey, ManualContent, ManualEntry, ManualStatus, ManualVersion,
    ReviewTask, TaskEvent, TaskStatus,
};
use crate::version::VersionLabel;

/// Optional filters for [`ManualRepository::list_entries`].
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub status: Option<ManualStatus>,
    pub business_type: Option<String>,
    pub error_code: Option<String>,
}

/// Closes a review task as part of an approval.
#[derive(Debug, Clone)]
pub struct TaskClosure {
    pub task_id: String,
    /// Must describe a TODO → DONE transition.
    pub event: TaskEvent,
}

/// Everything written by one approval.
#[derive(Debug, Clone)]
pub struct ApprovalCommit {
    pub entry_id: String,
    pub key: LogicalKey,
    /// The snapshot to record; its label becomes the entry's version.
    pub version: ManualVersion,
    /// The lineage's latest label when `version.label` was computed. If the
    /// lineage has moved on since, the commit is refused.
    pub previous_label: Option<VersionLabel>,
    pub task: Option<TaskClosure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// All writes applied. Lists the siblings flipped to DEPRECATED.
    Committed { deprecated: Vec<String> },
    /// The entry is missing or no longer DRAFT. Nothing written.
    EntryNotDraft,
    /// Another approval landed in the same lineage. Nothing written.
    LineageMoved,
    /// The task to close is missing or no longer TODO. Nothing written.
    TaskNotOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Entry and its open review tasks removed.
    Deleted { removed_tasks: u64 },
    NotFound,
    NotDraft(ManualStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskInsert {
    Inserted,
    /// An open task already exists for the draft; its id is returned.
    AlreadyOpen(String),
}

/// The approved manual a task was raised against.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMatch {
    pub old_entry_id: String,
    pub similarity_score: f64,
    pub differences: Option<Vec<String>>,
}

/// Additions to a TODO task that leave its status alone.
#[derive(Debug, Clone)]
pub struct TaskAnnotation {
    /// Recorded only if the task has no `old_entry_id` yet.
    pub matched: Option<TaskMatch>,
    /// Appended to the history. Must be a TODO → TODO event.
    pub event: TaskEvent,
}

/// Storage contract used by the lifecycle manager, conflict detector, and
/// review workflow.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_entry`](ManualRepository::insert_entry) | Persist a new draft |
/// | [`update_draft_content`](ManualRepository::update_draft_content) | Edit a draft (CAS on DRAFT) |
/// | [`commit_approval`](ManualRepository::commit_approval) | Atomic approval unit |
/// | [`deprecate_entry`](ManualRepository::deprecate_entry) | APPROVED → DEPRECATED (CAS) |
/// | [`delete_draft`](ManualRepository::delete_draft) | Remove a draft and its open tasks |
/// | [`insert_task`](ManualRepository::insert_task) | Open a review task (unique per draft) |
/// | [`transition_task`](ManualRepository::transition_task) | Move a task, appending history (CAS) |
/// | [`annotate_task`](ManualRepository::annotate_task) | Add a match or a note to a TODO task |
#[async_trait]
pub trait ManualRepository: Send + Sync {
    async fn get_consultation(&self, id: &str) -> Result<Option<Consultation>>;

    async fn insert_entry(&self, entry: &ManualEntry) -> Result<()>;

    async fn get_entry(&self, id: &str) -> Result<Option<ManualEntry>>;

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<ManualEntry>>;

    async fn find_approved_by_logical_key(&self, key: &LogicalKey) -> Result<Vec<ManualEntry>>;

    /// Replace a draft's content. Returns `false` if the entry is missing or
    /// not DRAFT.
    async fn update_draft_content(
        &self,
        id: &str,
        content: &ManualContent,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn commit_approval(&self, commit: &ApprovalCommit) -> Result<CommitOutcome>;

    /// Returns `false` if the entry is missing or not APPROVED.
    async fn deprecate_entry(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn delete_draft(&self, id: &str) -> Result<DeleteOutcome>;

    /// Latest version recorded for this entry.
    async fn find_latest_version(&self, entry_id: &str) -> Result<Option<ManualVersion>>;

    /// Latest version across every entry sharing `key`.
    async fn find_latest_version_for_key(&self, key: &LogicalKey)
        -> Result<Option<ManualVersion>>;

    /// Versions of one entry, oldest first.
    async fn list_versions(&self, entry_id: &str) -> Result<Vec<ManualVersion>>;

    async fn insert_task(&self, task: &ReviewTask) -> Result<TaskInsert>;

    async fn get_task(&self, id: &str) -> Result<Option<ReviewTask>>;

    async fn find_open_task_for_entry(&self, entry_id: &str) -> Result<Option<ReviewTask>>;

    /// Apply `event` if the task's status equals `event.from`. Returns
    /// `false` if the task is missing or its status differs.
    async fn transition_task(&self, id: &str, event: &TaskEvent) -> Result<bool>;

    /// Apply `annotation` while the task is TODO. When it carries a match,
    /// the task must not have an `old_entry_id` yet. Returns `false` if
    /// either condition fails; nothing is written then.
    async fn annotate_task(&self, id: &str, annotation: &TaskAnnotation) -> Result<bool>;

    /// Tasks, oldest first, optionally restricted to one status.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ReviewTask>>;
}

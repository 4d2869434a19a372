//! Core data models: manual entries, their approved versions, review
//! tasks, and the consultation records drafts are built from.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ManualError;
use crate::version::VersionLabel;

/// The `(business_type, error_code)` pair grouping a family of manuals.
///
/// At most one entry per key may be APPROVED at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalKey {
    pub business_type: String,
    pub error_code: String,
}

impl LogicalKey {
    pub fn new(business_type: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            business_type: business_type.into(),
            error_code: error_code.into(),
        }
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.business_type, self.error_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualStatus {
    Draft,
    Approved,
    Deprecated,
}

impl ManualStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualStatus::Draft => "DRAFT",
            ManualStatus::Approved => "APPROVED",
            ManualStatus::Deprecated => "DEPRECATED",
        }
    }
}

impl fmt::Display for ManualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManualStatus {
    type Err = ManualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(ManualStatus::Draft),
            "APPROVED" => Ok(ManualStatus::Approved),
            "DEPRECATED" => Ok(ManualStatus::Deprecated),
            other => Err(ManualError::validation(format!(
                "unknown manual status: '{}'",
                other
            ))),
        }
    }
}

/// The editable body of a manual.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManualContent {
    /// 1–3 keywords, in display order.
    pub keywords: Vec<String>,
    /// One sentence.
    pub topic: String,
    pub background: String,
    pub guideline: String,
}

/// A knowledge-base manual in one of the three lifecycle states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub id: String,
    #[serde(flatten)]
    pub key: LogicalKey,
    #[serde(flatten)]
    pub content: ManualContent,
    pub status: ManualStatus,
    /// Label of the approval that produced the current APPROVED state.
    pub version: Option<VersionLabel>,
    pub source_consultation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl ManualEntry {
    pub fn new_draft(
        key: LogicalKey,
        content: ManualContent,
        source_consultation_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            content,
            status: ManualStatus::Draft,
            version: None,
            source_consultation_id,
            created_at: now,
            updated_at: now,
            approved_at: None,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status == ManualStatus::Draft
    }
}

/// Immutable snapshot recorded on every approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualVersion {
    pub id: String,
    pub entry_id: String,
    pub key: LogicalKey,
    pub label: VersionLabel,
    pub snapshot: ManualContent,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    Done,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::Done => "DONE",
            TaskStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Todo)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ManualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TODO" => Ok(TaskStatus::Todo),
            "DONE" => Ok(TaskStatus::Done),
            "REJECTED" => Ok(TaskStatus::Rejected),
            other => Err(ManualError::validation(format!(
                "unknown task status: '{}'",
                other
            ))),
        }
    }
}

/// Why a review task was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskReason {
    /// The draft overlaps an approved manual on the same key.
    Conflict,
    /// Generated content is not grounded in its source consultation.
    Ungrounded,
}

impl TaskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskReason::Conflict => "CONFLICT",
            TaskReason::Ungrounded => "UNGROUNDED",
        }
    }
}

impl FromStr for TaskReason {
    type Err = ManualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONFLICT" => Ok(TaskReason::Conflict),
            "UNGROUNDED" => Ok(TaskReason::Ungrounded),
            other => Err(ManualError::validation(format!(
                "unknown task reason: '{}'",
                other
            ))),
        }
    }
}

/// One entry in a task's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub actor: String,
    pub at: DateTime<Utc>,
    /// `None` for the event that opened the task.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub notes: Option<String>,
}

impl TaskEvent {
    pub fn transition(
        actor: impl Into<String>,
        from: TaskStatus,
        to: TaskStatus,
        notes: Option<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            at: Utc::now(),
            from: Some(from),
            to,
            notes,
        }
    }

    /// A remark on a task that stays in `status`.
    pub fn note(actor: impl Into<String>, status: TaskStatus, notes: impl Into<String>) -> Self {
        Self::transition(actor, status, status, Some(notes.into()))
    }
}

/// A unit of human review over a draft, optionally against the approved
/// manual it collides with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewTask {
    pub id: String,
    pub old_entry_id: Option<String>,
    pub new_entry_id: String,
    pub status: TaskStatus,
    pub reason: TaskReason,
    pub similarity_score: Option<f64>,
    pub differences: Option<Vec<String>>,
    pub history: Vec<TaskEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewTask {
    /// Build a new TODO task. The opening event is recorded as `system`.
    pub fn open(
        new_entry_id: impl Into<String>,
        old_entry_id: Option<String>,
        reason: TaskReason,
        similarity_score: Option<f64>,
        differences: Option<Vec<String>>,
        notes: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            old_entry_id,
            new_entry_id: new_entry_id.into(),
            status: TaskStatus::Todo,
            reason,
            similarity_score,
            differences,
            history: vec![TaskEvent {
                actor: "system".to_string(),
                at: now,
                from: None,
                to: TaskStatus::Todo,
                notes,
            }],
            created_at: now,
            updated_at: now,
        }
    }
}

/// A support consultation. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consultation {
    pub id: String,
    pub summary: String,
    pub inquiry: String,
    pub action_taken: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub business_type: String,
    pub error_code: String,
}

impl Consultation {
    pub fn logical_key(&self) -> LogicalKey {
        LogicalKey::new(&self.business_type, &self.error_code)
    }
}

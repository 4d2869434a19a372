//! Deferred index work.
//!
//! When the similarity index rejects a write after the relational commit,
//! the engine enqueues a [`RetryJob`] instead of failing the operation.
//! [`IndexMaintenance::drain_retry_jobs`](crate::maintenance::IndexMaintenance::drain_retry_jobs)
//! replays them later.

pub mod memory;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManualError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryJobKind {
    /// (Re)index an APPROVED entry.
    IndexEntry,
    /// Drop a no-longer-approved entry from the index.
    RemoveFromIndex,
}

impl RetryJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryJobKind::IndexEntry => "index_entry",
            RetryJobKind::RemoveFromIndex => "remove_from_index",
        }
    }
}

impl fmt::Display for RetryJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryJobKind {
    type Err = ManualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index_entry" => Ok(RetryJobKind::IndexEntry),
            "remove_from_index" => Ok(RetryJobKind::RemoveFromIndex),
            other => Err(ManualError::validation(format!(
                "unknown retry job kind: '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryJobStatus {
    Pending,
    Done,
    /// Gave up after too many attempts.
    Dead,
}

impl RetryJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryJobStatus::Pending => "pending",
            RetryJobStatus::Done => "done",
            RetryJobStatus::Dead => "dead",
        }
    }
}

impl FromStr for RetryJobStatus {
    type Err = ManualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RetryJobStatus::Pending),
            "done" => Ok(RetryJobStatus::Done),
            "dead" => Ok(RetryJobStatus::Dead),
            other => Err(ManualError::validation(format!(
                "unknown retry job status: '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryJob {
    pub id: String,
    pub kind: RetryJobKind,
    /// `{"entry_id": "..."}` for both job kinds.
    pub payload: Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: RetryJobStatus,
    pub enqueued_at: DateTime<Utc>,
}

impl RetryJob {
    pub fn entry_id(&self) -> Option<&str> {
        self.payload.get("entry_id").and_then(Value::as_str)
    }
}

/// Payload for jobs that target one manual entry.
pub fn entry_payload(entry_id: &str) -> Value {
    serde_json::json!({ "entry_id": entry_id })
}

/// Fire-and-forget queue for index work that failed inline.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Returns the new job's id.
    async fn enqueue(&self, kind: RetryJobKind, payload: Value) -> Result<String>;

    /// Up to `limit` pending jobs, oldest first.
    async fn claim_due(&self, limit: usize) -> Result<Vec<RetryJob>>;

    async fn complete(&self, id: &str) -> Result<()>;

    /// Record a failed attempt. With `dead`, the job stops being claimed.
    async fn fail(&self, id: &str, error: &str, dead: bool) -> Result<()>;
}

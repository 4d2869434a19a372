//! Human review of drafts.
//!
//! A review task moves TODO → DONE (approve) or TODO → REJECTED (reject)
//! exactly once. Approving a task whose draft is still DRAFT approves the
//! draft through [`ManualLifecycle`], with the task closure folded into the
//! same repository commit. Rejection leaves the draft alone so it can be
//! edited and resubmitted.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::{Entity, ManualError, Result};
use crate::lifecycle::{ApprovalOutcome, ManualLifecycle};
use crate::models::{ReviewTask, TaskEvent, TaskStatus};
use crate::repository::{ManualRepository, TaskClosure};

#[derive(Debug, Clone, Serialize)]
pub struct TaskDecision {
    pub task: ReviewTask,
    /// Set when approving the task also approved its draft.
    pub approval: Option<ApprovalOutcome>,
}

#[derive(Clone)]
pub struct ReviewWorkflow {
    repository: Arc<dyn ManualRepository>,
    lifecycle: ManualLifecycle,
}

impl ReviewWorkflow {
    pub fn new(repository: Arc<dyn ManualRepository>, lifecycle: ManualLifecycle) -> Self {
        Self {
            repository,
            lifecycle,
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<ReviewTask> {
        self.repository
            .get_task(task_id)
            .await
            .map_err(ManualError::Storage)?
            .ok_or_else(|| ManualError::not_found(Entity::Task, task_id))
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ReviewTask>> {
        self.repository
            .list_tasks(status)
            .await
            .map_err(ManualError::Storage)
    }

    pub async fn list_open_tasks(&self) -> Result<Vec<ReviewTask>> {
        self.list_tasks(Some(TaskStatus::Todo)).await
    }

    async fn open_task(&self, task_id: &str) -> Result<ReviewTask> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Todo {
            return Err(ManualError::state(
                Entity::Task,
                task_id,
                task.status,
                TaskStatus::Todo,
            ));
        }
        Ok(task)
    }

    /// Accept the task. If its draft is still DRAFT, the draft is approved
    /// and the task closed in one commit.
    pub async fn approve_task(
        &self,
        task_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<TaskDecision> {
        if reviewer.trim().is_empty() {
            return Err(ManualError::validation("reviewer must not be empty"));
        }
        let task = self.open_task(task_id).await?;
        let event = TaskEvent::transition(reviewer.trim(), TaskStatus::Todo, TaskStatus::Done, notes);

        let draft = self
            .repository
            .get_entry(&task.new_entry_id)
            .await
            .map_err(ManualError::Storage)?
            .filter(|e| e.is_draft());

        let approval = match draft {
            Some(draft) => Some(
                self.lifecycle
                    .approve_with_task(
                        &draft.id,
                        reviewer,
                        TaskClosure {
                            task_id: task.id.clone(),
                            event,
                        },
                    )
                    .await?,
            ),
            None => {
                let moved = self
                    .repository
                    .transition_task(&task.id, &event)
                    .await
                    .map_err(ManualError::Storage)?;
                if !moved {
                    return Err(self.lifecycle.task_state_error(&task.id).await);
                }
                None
            }
        };

        info!(
            task_id = %task.id,
            entry_id = %task.new_entry_id,
            reviewer,
            approved_draft = approval.is_some(),
            "review task approved"
        );
        Ok(TaskDecision {
            task: self.get_task(task_id).await?,
            approval,
        })
    }

    /// Reject the task. The draft is not touched.
    pub async fn reject_task(
        &self,
        task_id: &str,
        reviewer: &str,
        reason: &str,
    ) -> Result<ReviewTask> {
        if reviewer.trim().is_empty() {
            return Err(ManualError::validation("reviewer must not be empty"));
        }
        if reason.trim().is_empty() {
            return Err(ManualError::validation("a rejection reason is required"));
        }
        let task = self.open_task(task_id).await?;
        let event = TaskEvent::transition(
            reviewer.trim(),
            TaskStatus::Todo,
            TaskStatus::Rejected,
            Some(reason.trim().to_string()),
        );
        let moved = self
            .repository
            .transition_task(&task.id, &event)
            .await
            .map_err(ManualError::Storage)?;
        if !moved {
            return Err(self.lifecycle.task_state_error(&task.id).await);
        }
        info!(task_id = %task.id, reviewer, "review task rejected");
        self.get_task(task_id).await
    }
}

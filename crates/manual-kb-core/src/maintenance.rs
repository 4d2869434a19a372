//! Keeping the similarity index in step with the repository.
//!
//! The index is a projection of APPROVED manuals. [`IndexMaintenance`]
//! rebuilds it wholesale and replays the retry jobs queued when an inline
//! index call failed.

use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ManualError, Result};
use crate::index::{IndexMetadata, SimilarityIndex};
use crate::models::ManualStatus;
use crate::queue::{RetryJob, RetryJobKind, RetryQueue};
use crate::repository::{EntryFilter, ManualRepository};
use crate::source_text::manual_text;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub indexed: usize,
    /// Non-approved entries cleared from the index.
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub succeeded: usize,
    /// Jobs that no longer apply (entry gone or no longer approved).
    pub skipped: usize,
    /// Failed again, left pending.
    pub retrying: usize,
    /// Failed for the last time.
    pub dead: usize,
}

#[derive(Clone)]
pub struct IndexMaintenance {
    repository: Arc<dyn ManualRepository>,
    index: Arc<dyn SimilarityIndex>,
    retry_queue: Arc<dyn RetryQueue>,
    max_attempts: u32,
}

enum JobResult {
    Done,
    Skipped,
}

impl IndexMaintenance {
    pub fn new(
        repository: Arc<dyn ManualRepository>,
        index: Arc<dyn SimilarityIndex>,
        retry_queue: Arc<dyn RetryQueue>,
        max_attempts: u32,
    ) -> Self {
        Self {
            repository,
            index,
            retry_queue,
            max_attempts,
        }
    }

    /// Re-index every APPROVED manual and remove every DEPRECATED one.
    ///
    /// Individual index failures are counted, not fatal.
    pub async fn rebuild_index(&self) -> Result<RebuildReport> {
        let mut report = RebuildReport::default();

        let approved = self
            .repository
            .list_entries(&EntryFilter {
                status: Some(ManualStatus::Approved),
                ..Default::default()
            })
            .await
            .map_err(ManualError::Storage)?;
        for entry in &approved {
            let text = manual_text(&entry.content);
            match self
                .index
                .index(&entry.id, &text, &IndexMetadata::from(&entry.key))
                .await
            {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %format!("{:#}", e), "rebuild: index failed");
                    report.failed += 1;
                }
            }
        }

        let deprecated = self
            .repository
            .list_entries(&EntryFilter {
                status: Some(ManualStatus::Deprecated),
                ..Default::default()
            })
            .await
            .map_err(ManualError::Storage)?;
        for entry in &deprecated {
            match self.index.delete(&entry.id).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %format!("{:#}", e), "rebuild: delete failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            indexed = report.indexed,
            removed = report.removed,
            failed = report.failed,
            "index rebuild finished"
        );
        Ok(report)
    }

    /// Replay up to `limit` pending retry jobs.
    pub async fn drain_retry_jobs(&self, limit: usize) -> Result<DrainReport> {
        let jobs = self
            .retry_queue
            .claim_due(limit)
            .await
            .map_err(ManualError::Storage)?;
        let mut report = DrainReport {
            claimed: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            match self.run_job(&job).await {
                Ok(result) => {
                    self.retry_queue
                        .complete(&job.id)
                        .await
                        .map_err(ManualError::Storage)?;
                    match result {
                        JobResult::Done => report.succeeded += 1,
                        JobResult::Skipped => report.skipped += 1,
                    }
                }
                Err(e) => {
                    let dead = job.attempts + 1 >= self.max_attempts;
                    let message = format!("{:#}", e);
                    self.retry_queue
                        .fail(&job.id, &message, dead)
                        .await
                        .map_err(ManualError::Storage)?;
                    if dead {
                        warn!(job_id = %job.id, kind = %job.kind, error = %message, "retry job dead");
                        report.dead += 1;
                    } else {
                        report.retrying += 1;
                    }
                }
            }
        }

        info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            skipped = report.skipped,
            retrying = report.retrying,
            dead = report.dead,
            "retry drain finished"
        );
        Ok(report)
    }

    async fn run_job(&self, job: &RetryJob) -> anyhow::Result<JobResult> {
        let entry_id = job
            .entry_id()
            .ok_or_else(|| anyhow!("retry job {} has no entry_id", job.id))?;
        match job.kind {
            RetryJobKind::IndexEntry => {
                let entry = match self.repository.get_entry(entry_id).await? {
                    Some(e) if e.status == ManualStatus::Approved => e,
                    _ => return Ok(JobResult::Skipped),
                };
                self.index
                    .index(
                        &entry.id,
                        &manual_text(&entry.content),
                        &IndexMetadata::from(&entry.key),
                    )
                    .await?;
                Ok(JobResult::Done)
            }
            RetryJobKind::RemoveFromIndex => {
                if let Some(entry) = self.repository.get_entry(entry_id).await? {
                    if entry.status == ManualStatus::Approved {
                        return Ok(JobResult::Skipped);
                    }
                }
                self.index.delete(entry_id).await?;
                Ok(JobResult::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::scripted::ScriptedDrafter;
    use crate::index::memory::InMemoryIndex;
    use crate::lifecycle::{AuthoredDraft, DraftOptions, DraftSource, ManualLifecycle};
    use crate::models::{LogicalKey, ManualContent};
    use crate::params::EngineParams;
    use crate::queue::memory::InMemoryRetryQueue;
    use crate::queue::{entry_payload, RetryJobStatus};
    use crate::repository::memory::InMemoryRepository;

    struct Fixture {
        index: Arc<InMemoryIndex>,
        queue: Arc<InMemoryRetryQueue>,
        lifecycle: ManualLifecycle,
        maintenance: IndexMaintenance,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let index = Arc::new(InMemoryIndex::new());
        let queue = Arc::new(InMemoryRetryQueue::new());
        let lifecycle = ManualLifecycle::new(
            repo.clone(),
            index.clone(),
            Arc::new(ScriptedDrafter::new()),
            queue.clone(),
            Arc::new(EngineParams::default()),
        );
        let maintenance =
            IndexMaintenance::new(repo, index.clone(), queue.clone(), max_attempts);
        Fixture {
            index,
            queue,
            lifecycle,
            maintenance,
        }
    }

    async fn approved_id(f: &Fixture, code: &str) -> String {
        let draft = f
            .lifecycle
            .create_draft(
                DraftSource::Authored(AuthoredDraft {
                    key: LogicalKey::new("CARD", code),
                    content: ManualContent {
                        keywords: vec!["CVV".into()],
                        topic: format!("{} 오류 안내", code),
                        ..Default::default()
                    },
                    source_consultation_id: None,
                }),
                &DraftOptions::default(),
            )
            .await
            .unwrap()
            .entry;
        f.lifecycle.approve(&draft.id, "lead").await.unwrap();
        draft.id
    }

    #[tokio::test]
    async fn drain_replays_deferred_index_write() {
        let f = fixture(5);
        f.index.fail_index(true);
        let id = approved_id(&f, "E1").await;
        assert!(!f.index.contains(&id));

        f.index.fail_index(false);
        let report = f.maintenance.drain_retry_jobs(10).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        assert!(f.index.contains(&id));
        assert_eq!(f.queue.jobs()[0].status, RetryJobStatus::Done);
    }

    #[tokio::test]
    async fn job_goes_dead_after_max_attempts() {
        let f = fixture(2);
        f.index.fail_index(true);
        approved_id(&f, "E1").await;

        let first = f.maintenance.drain_retry_jobs(10).await.unwrap();
        assert_eq!(first.retrying, 1);
        let second = f.maintenance.drain_retry_jobs(10).await.unwrap();
        assert_eq!(second.dead, 1);
        let third = f.maintenance.drain_retry_jobs(10).await.unwrap();
        assert_eq!(third.claimed, 0);

        let job = &f.queue.jobs()[0];
        assert_eq!(job.status, RetryJobStatus::Dead);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn obsolete_jobs_are_skipped() {
        let f = fixture(5);
        f.queue
            .enqueue(RetryJobKind::IndexEntry, entry_payload("gone"))
            .await
            .unwrap();
        let report = f.maintenance.drain_retry_jobs(10).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(f.queue.pending().is_empty());
    }

    #[tokio::test]
    async fn rebuild_restores_dropped_projection() {
        let f = fixture(5);
        let a = approved_id(&f, "E1").await;
        let b = approved_id(&f, "E2").await;
        f.lifecycle.deprecate(&b, "lead").await.unwrap();

        // Simulate a wiped index with a stale deprecated vector.
        f.index.delete(&a).await.unwrap();
        f.index
            .index(&b, "stale", &IndexMetadata::from(&LogicalKey::new("CARD", "E2")))
            .await
            .unwrap();

        let report = f.maintenance.rebuild_index().await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        assert!(f.index.contains(&a));
        assert!(!f.index.contains(&b));
    }
}

//! In-memory [`RetryQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{RetryJob, RetryJobKind, RetryJobStatus, RetryQueue};

#[derive(Default)]
pub struct InMemoryRetryQueue {
    jobs: Mutex<Vec<RetryJob>>,
    fail_enqueue: AtomicBool,
}

impl InMemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Every job ever enqueued, in enqueue order.
    pub fn jobs(&self) -> Vec<RetryJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn pending(&self) -> Vec<RetryJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == RetryJobStatus::Pending)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
    async fn enqueue(&self, kind: RetryJobKind, payload: Value) -> Result<String> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            bail!("in-memory retry queue: enqueue disabled");
        }
        let job = RetryJob {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            attempts: 0,
            last_error: None,
            status: RetryJobStatus::Pending,
            enqueued_at: Utc::now(),
        };
        let id = job.id.clone();
        self.jobs.lock().unwrap().push(job);
        Ok(id)
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<RetryJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == RetryJobStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn complete(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| anyhow!("retry job not found: {}", id))?;
        job.status = RetryJobStatus::Done;
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str, dead: bool) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| anyhow!("retry job not found: {}", id))?;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        if dead {
            job.status = RetryJobStatus::Dead;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::entry_payload;

    #[tokio::test]
    async fn dead_jobs_are_not_claimed() {
        let queue = InMemoryRetryQueue::new();
        let a = queue
            .enqueue(RetryJobKind::IndexEntry, entry_payload("a"))
            .await
            .unwrap();
        let b = queue
            .enqueue(RetryJobKind::RemoveFromIndex, entry_payload("b"))
            .await
            .unwrap();

        queue.fail(&a, "boom", false).await.unwrap();
        queue.fail(&b, "boom", true).await.unwrap();

        let due = queue.claim_due(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, a);
        assert_eq!(due[0].attempts, 1);

        queue.complete(&a).await.unwrap();
        assert!(queue.claim_due(10).await.unwrap().is_empty());
    }
}

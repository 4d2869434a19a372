//! [`RetryQueue`] stored in the `retry_jobs` table.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use manual_kb_core::queue::{RetryJob, RetryJobKind, RetryJobStatus, RetryQueue};

use crate::db::{from_millis, to_millis};

pub struct SqliteRetryQueue {
    pool: SqlitePool,
}

impl SqliteRetryQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Job counts keyed by status.
    pub async fn counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM retry_jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl RetryQueue for SqliteRetryQueue {
    async fn enqueue(&self, kind: RetryJobKind, payload: Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = to_millis(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO retry_jobs (id, kind, payload_json, attempts, status, enqueued_at, updated_at)
            VALUES (?, ?, ?, 0, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(serde_json::to_string(&payload)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("enqueueing retry job")?;
        Ok(id)
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<RetryJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, payload_json, attempts, last_error, status, enqueued_at
            FROM retry_jobs
            WHERE status = 'pending'
            ORDER BY enqueued_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RetryJob> {
                let kind: String = row.get("kind");
                let status: String = row.get("status");
                let payload: String = row.get("payload_json");
                let attempts: i64 = row.get("attempts");
                Ok(RetryJob {
                    id: row.get("id"),
                    kind: kind.parse()?,
                    payload: serde_json::from_str(&payload)?,
                    attempts: u32::try_from(attempts)?,
                    last_error: row.get("last_error"),
                    status: status.parse()?,
                    enqueued_at: from_millis(row.get("enqueued_at"))?,
                })
            })
            .collect()
    }

    async fn complete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE retry_jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(RetryJobStatus::Done.as_str())
            .bind(to_millis(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("retry job not found: {}", id);
        }
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str, dead: bool) -> Result<()> {
        let status = if dead {
            RetryJobStatus::Dead
        } else {
            RetryJobStatus::Pending
        };
        let result = sqlx::query(
            r#"
            UPDATE retry_jobs
            SET attempts = attempts + 1, last_error = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(status.as_str())
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("retry job not found: {}", id);
        }
        Ok(())
    }
}

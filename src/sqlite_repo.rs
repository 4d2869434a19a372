//! SQLite-backed [`ManualRepository`].
//!
//! Compare-and-set writes are single `UPDATE ... WHERE status = ?`
//! statements. Multi-row units (`commit_approval`, `delete_draft`) run in a
//! transaction whose first statement is a write, so SQLite takes the write
//! lock before anything is read and concurrent approvals queue behind each
//! other instead of failing on a stale snapshot. Partial unique indexes back
//! the one-APPROVED-per-key and one-open-task-per-draft rules.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use manual_kb_core::models::{
    Consultation, LogicalKey, ManualContent, ManualEntry, ManualStatus, ManualVersion,
    ReviewTask, TaskEvent, TaskStatus,
};
use manual_kb_core::repository::{
    ApprovalCommit, CommitOutcome, DeleteOutcome, EntryFilter, ManualRepository, TaskAnnotation,
    TaskInsert,
};
use manual_kb_core::version::VersionLabel;

use crate::db::{from_millis, to_millis};

const ENTRY_COLUMNS: &str = "id, business_type, error_code, keywords_json, topic, background, \
     guideline, status, version, source_consultation_id, created_at, updated_at, approved_at";

const VERSION_COLUMNS: &str = "id, entry_id, business_type, error_code, major, minor, \
     snapshot_json, approved_by, approved_at";

const TASK_COLUMNS: &str = "id, old_entry_id, new_entry_id, status, reason, similarity_score, \
     differences_json, history_json, created_at, updated_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

fn row_to_entry(row: &SqliteRow) -> Result<ManualEntry> {
    let keywords_json: String = row.get("keywords_json");
    let status: String = row.get("status");
    let version: Option<String> = row.get("version");
    let approved_at: Option<i64> = row.get("approved_at");
    Ok(ManualEntry {
        id: row.get("id"),
        key: LogicalKey::new(
            row.get::<String, _>("business_type"),
            row.get::<String, _>("error_code"),
        ),
        content: ManualContent {
            keywords: serde_json::from_str(&keywords_json).context("corrupt keywords_json")?,
            topic: row.get("topic"),
            background: row.get("background"),
            guideline: row.get("guideline"),
        },
        status: status.parse()?,
        version: version.map(|v| v.parse()).transpose()?,
        source_consultation_id: row.get("source_consultation_id"),
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
        approved_at: approved_at.map(from_millis).transpose()?,
    })
}

fn row_to_version(row: &SqliteRow) -> Result<ManualVersion> {
    let snapshot_json: String = row.get("snapshot_json");
    let major: i64 = row.get("major");
    let minor: i64 = row.get("minor");
    Ok(ManualVersion {
        id: row.get("id"),
        entry_id: row.get("entry_id"),
        key: LogicalKey::new(
            row.get::<String, _>("business_type"),
            row.get::<String, _>("error_code"),
        ),
        label: VersionLabel::new(u32::try_from(major)?, u32::try_from(minor)?),
        snapshot: serde_json::from_str(&snapshot_json).context("corrupt snapshot_json")?,
        approved_by: row.get("approved_by"),
        approved_at: from_millis(row.get("approved_at"))?,
    })
}

fn row_to_task(row: &SqliteRow) -> Result<ReviewTask> {
    let status: String = row.get("status");
    let reason: String = row.get("reason");
    let differences_json: Option<String> = row.get("differences_json");
    let history_json: String = row.get("history_json");
    Ok(ReviewTask {
        id: row.get("id"),
        old_entry_id: row.get("old_entry_id"),
        new_entry_id: row.get("new_entry_id"),
        status: status.parse()?,
        reason: reason.parse()?,
        similarity_score: row.get("similarity_score"),
        differences: differences_json
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .context("corrupt differences_json")?,
        history: serde_json::from_str(&history_json).context("corrupt history_json")?,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

fn label_from_row(row: Option<(i64, i64)>) -> Result<Option<VersionLabel>> {
    row.map(|(major, minor)| -> Result<VersionLabel> {
        Ok(VersionLabel::new(u32::try_from(major)?, u32::try_from(minor)?))
    })
    .transpose()
}

pub struct SqliteManualRepository {
    pool: SqlitePool,
}

impl SqliteManualRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a consultation, replacing any stored record with the same id.
    /// Returns `true` if the id was new.
    pub async fn upsert_consultation(&self, c: &Consultation) -> Result<bool> {
        let existed: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM consultations WHERE id = ?")
                .bind(&c.id)
                .fetch_one(&self.pool)
                .await?;
        sqlx::query(
            r#"
            INSERT INTO consultations
                (id, summary, inquiry, action_taken, branch, business_type, error_code, imported_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                summary = excluded.summary,
                inquiry = excluded.inquiry,
                action_taken = excluded.action_taken,
                branch = excluded.branch,
                business_type = excluded.business_type,
                error_code = excluded.error_code,
                imported_at = excluded.imported_at
            "#,
        )
        .bind(&c.id)
        .bind(&c.summary)
        .bind(&c.inquiry)
        .bind(&c.action_taken)
        .bind(&c.branch)
        .bind(&c.business_type)
        .bind(&c.error_code)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(!existed)
    }

    async fn latest_version_where(
        &self,
        clause: &str,
        binds: &[&str],
    ) -> Result<Option<ManualVersion>> {
        let sql = format!(
            "SELECT {} FROM manual_versions WHERE {} \
             ORDER BY major DESC, minor DESC, approved_at DESC LIMIT 1",
            VERSION_COLUMNS, clause
        );
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = query.bind(*b);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_version(&row))
            .transpose()
    }
}

#[async_trait]
impl ManualRepository for SqliteManualRepository {
    async fn get_consultation(&self, id: &str) -> Result<Option<Consultation>> {
        let row = sqlx::query(
            "SELECT id, summary, inquiry, action_taken, branch, business_type, error_code \
             FROM consultations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Consultation {
            id: row.get("id"),
            summary: row.get("summary"),
            inquiry: row.get("inquiry"),
            action_taken: row.get("action_taken"),
            branch: row.get("branch"),
            business_type: row.get("business_type"),
            error_code: row.get("error_code"),
        }))
    }

    async fn insert_entry(&self, entry: &ManualEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_entries
                (id, business_type, error_code, keywords_json, topic, background, guideline,
                 status, version, source_consultation_id, created_at, updated_at, approved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.key.business_type)
        .bind(&entry.key.error_code)
        .bind(serde_json::to_string(&entry.content.keywords)?)
        .bind(&entry.content.topic)
        .bind(&entry.content.background)
        .bind(&entry.content.guideline)
        .bind(entry.status.as_str())
        .bind(entry.version.map(|v| v.to_string()))
        .bind(&entry.source_consultation_id)
        .bind(to_millis(entry.created_at))
        .bind(to_millis(entry.updated_at))
        .bind(entry.approved_at.map(to_millis))
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting manual entry {}", entry.id))?;
        Ok(())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<ManualEntry>> {
        let sql = format!("SELECT {} FROM manual_entries WHERE id = ?", ENTRY_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_entry(&row))
            .transpose()
    }

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<ManualEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM manual_entries WHERE 1 = 1",
            ENTRY_COLUMNS
        ));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(bt) = &filter.business_type {
            qb.push(" AND business_type = ").push_bind(bt.clone());
        }
        if let Some(ec) = &filter.error_code {
            qb.push(" AND error_code = ").push_bind(ec.clone());
        }
        qb.push(" ORDER BY created_at ASC, id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn find_approved_by_logical_key(&self, key: &LogicalKey) -> Result<Vec<ManualEntry>> {
        self.list_entries(&EntryFilter {
            status: Some(ManualStatus::Approved),
            business_type: Some(key.business_type.clone()),
            error_code: Some(key.error_code.clone()),
        })
        .await
    }

    async fn update_draft_content(
        &self,
        id: &str,
        content: &ManualContent,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE manual_entries
            SET keywords_json = ?, topic = ?, background = ?, guideline = ?, updated_at = ?
            WHERE id = ? AND status = 'DRAFT'
            "#,
        )
        .bind(serde_json::to_string(&content.keywords)?)
        .bind(&content.topic)
        .bind(&content.background)
        .bind(&content.guideline)
        .bind(to_millis(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit_approval(&self, commit: &ApprovalCommit) -> Result<CommitOutcome> {
        let at = to_millis(commit.version.approved_at);
        let key = &commit.key;
        let mut tx = self.pool.begin().await?;

        // First statement writes, taking the database write lock.
        let touched = sqlx::query(
            "UPDATE manual_entries SET updated_at = ? WHERE id = ? AND status = 'DRAFT'",
        )
        .bind(at)
        .bind(&commit.entry_id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::EntryNotDraft);
        }

        let latest: Option<(i64, i64)> = sqlx::query_as(
            "SELECT major, minor FROM manual_versions \
             WHERE business_type = ? AND error_code = ? \
             ORDER BY major DESC, minor DESC LIMIT 1",
        )
        .bind(&key.business_type)
        .bind(&key.error_code)
        .fetch_optional(&mut *tx)
        .await?;
        if label_from_row(latest)? != commit.previous_label {
            tx.rollback().await?;
            return Ok(CommitOutcome::LineageMoved);
        }

        if let Some(closure) = &commit.task {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM manual_review_tasks WHERE id = ?")
                    .bind(&closure.task_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if status.as_deref() != Some(TaskStatus::Todo.as_str()) {
                tx.rollback().await?;
                return Ok(CommitOutcome::TaskNotOpen);
            }
        }

        // Siblings leave APPROVED before the entry enters it, so the partial
        // unique index never sees two.
        let mut deprecated: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM manual_entries \
             WHERE business_type = ? AND error_code = ? AND status = 'APPROVED' AND id != ?",
        )
        .bind(&key.business_type)
        .bind(&key.error_code)
        .bind(&commit.entry_id)
        .fetch_all(&mut *tx)
        .await?;
        deprecated.sort();
        sqlx::query(
            "UPDATE manual_entries SET status = 'DEPRECATED', updated_at = ? \
             WHERE business_type = ? AND error_code = ? AND status = 'APPROVED' AND id != ?",
        )
        .bind(at)
        .bind(&key.business_type)
        .bind(&key.error_code)
        .bind(&commit.entry_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE manual_entries \
             SET status = 'APPROVED', version = ?, approved_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'DRAFT'",
        )
        .bind(commit.version.label.to_string())
        .bind(at)
        .bind(at)
        .bind(&commit.entry_id)
        .execute(&mut *tx)
        .await?;

        let v = &commit.version;
        let inserted = sqlx::query(
            r#"
            INSERT INTO manual_versions
                (id, entry_id, business_type, error_code, version, major, minor,
                 snapshot_json, approved_by, approved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&v.id)
        .bind(&v.entry_id)
        .bind(&v.key.business_type)
        .bind(&v.key.error_code)
        .bind(v.label.to_string())
        .bind(i64::from(v.label.major))
        .bind(i64::from(v.label.minor))
        .bind(serde_json::to_string(&v.snapshot)?)
        .bind(&v.approved_by)
        .bind(at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(CommitOutcome::LineageMoved);
            }
            Err(e) => return Err(e).context("inserting manual version"),
        }

        if let Some(closure) = &commit.task {
            append_event(&mut *tx, &closure.task_id, &closure.event).await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed { deprecated })
    }

    async fn deprecate_entry(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE manual_entries SET status = 'DEPRECATED', updated_at = ? \
             WHERE id = ? AND status = 'APPROVED'",
        )
        .bind(to_millis(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_draft(&self, id: &str) -> Result<DeleteOutcome> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM manual_entries WHERE id = ? AND status = 'DRAFT'")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM manual_entries WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match status {
                None => DeleteOutcome::NotFound,
                Some(s) => DeleteOutcome::NotDraft(s.parse()?),
            });
        }

        let removed = sqlx::query(
            "DELETE FROM manual_review_tasks WHERE new_entry_id = ? AND status = 'TODO'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(DeleteOutcome::Deleted {
            removed_tasks: removed.rows_affected(),
        })
    }

    async fn find_latest_version(&self, entry_id: &str) -> Result<Option<ManualVersion>> {
        self.latest_version_where("entry_id = ?", &[entry_id]).await
    }

    async fn find_latest_version_for_key(
        &self,
        key: &LogicalKey,
    ) -> Result<Option<ManualVersion>> {
        self.latest_version_where(
            "business_type = ? AND error_code = ?",
            &[key.business_type.as_str(), key.error_code.as_str()],
        )
        .await
    }

    async fn list_versions(&self, entry_id: &str) -> Result<Vec<ManualVersion>> {
        let sql = format!(
            "SELECT {} FROM manual_versions WHERE entry_id = ? ORDER BY major ASC, minor ASC",
            VERSION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(entry_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_version).collect()
    }

    async fn insert_task(&self, task: &ReviewTask) -> Result<TaskInsert> {
        let differences = task
            .differences
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO manual_review_tasks
                (id, old_entry_id, new_entry_id, status, reason, similarity_score,
                 differences_json, history_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.old_entry_id)
        .bind(&task.new_entry_id)
        .bind(task.status.as_str())
        .bind(task.reason.as_str())
        .bind(task.similarity_score)
        .bind(differences)
        .bind(serde_json::to_string(&task.history)?)
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(TaskInsert::Inserted),
            Err(e) if is_unique_violation(&e) && task.status == TaskStatus::Todo => {
                let existing = self
                    .find_open_task_for_entry(&task.new_entry_id)
                    .await?
                    .ok_or_else(|| anyhow!("open task for {} vanished", task.new_entry_id))?;
                Ok(TaskInsert::AlreadyOpen(existing.id))
            }
            Err(e) => Err(e).context("inserting review task"),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<ReviewTask>> {
        let sql = format!("SELECT {} FROM manual_review_tasks WHERE id = ?", TASK_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_task(&row))
            .transpose()
    }

    async fn find_open_task_for_entry(&self, entry_id: &str) -> Result<Option<ReviewTask>> {
        let sql = format!(
            "SELECT {} FROM manual_review_tasks WHERE new_entry_id = ? AND status = 'TODO'",
            TASK_COLUMNS
        );
        sqlx::query(&sql)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_task(&row))
            .transpose()
    }

    async fn transition_task(&self, id: &str, event: &TaskEvent) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        append_event(&mut *conn, id, event).await
    }

    async fn annotate_task(&self, id: &str, annotation: &TaskAnnotation) -> Result<bool> {
        let event = serde_json::to_string(&annotation.event)?;
        let at = to_millis(annotation.event.at);
        let result = match &annotation.matched {
            Some(matched) => {
                let differences = matched
                    .differences
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                sqlx::query(
                    r#"
                    UPDATE manual_review_tasks
                    SET old_entry_id = ?, similarity_score = ?, differences_json = ?,
                        updated_at = ?, history_json = json_insert(history_json, '$[#]', json(?))
                    WHERE id = ? AND status = 'TODO' AND old_entry_id IS NULL
                    "#,
                )
                .bind(&matched.old_entry_id)
                .bind(matched.similarity_score)
                .bind(differences)
                .bind(at)
                .bind(event)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE manual_review_tasks
                    SET updated_at = ?, history_json = json_insert(history_json, '$[#]', json(?))
                    WHERE id = ? AND status = 'TODO'
                    "#,
                )
                .bind(at)
                .bind(event)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ReviewTask>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM manual_review_tasks",
            TASK_COLUMNS
        ));
        if let Some(status) = status {
            qb.push(" WHERE status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at ASC, id ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }
}

/// Move a task from `event.from` to `event.to`, appending `event` to its
/// history in the same statement. Returns `false` if the task is missing or
/// not in `event.from`.
async fn append_event(
    conn: &mut sqlx::SqliteConnection,
    task_id: &str,
    event: &TaskEvent,
) -> Result<bool> {
    let from = event
        .from
        .ok_or_else(|| anyhow!("task transition needs a source status"))?;
    let result = sqlx::query(
        r#"
        UPDATE manual_review_tasks
        SET status = ?, updated_at = ?, history_json = json_insert(history_json, '$[#]', json(?))
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(event.to.as_str())
    .bind(to_millis(event.at))
    .bind(serde_json::to_string(event)?)
    .bind(task_id)
    .bind(from.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

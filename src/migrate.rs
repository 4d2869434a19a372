//! Idempotent schema setup. Timestamps are stored as Unix milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index that does not exist yet.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consultations (
            id TEXT PRIMARY KEY,
            summary TEXT NOT NULL,
            inquiry TEXT NOT NULL,
            action_taken TEXT NOT NULL,
            branch TEXT,
            business_type TEXT NOT NULL,
            error_code TEXT NOT NULL,
            imported_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_entries (
            id TEXT PRIMARY KEY,
            business_type TEXT NOT NULL,
            error_code TEXT NOT NULL,
            keywords_json TEXT NOT NULL,
            topic TEXT NOT NULL,
            background TEXT NOT NULL DEFAULT '',
            guideline TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL CHECK (status IN ('DRAFT', 'APPROVED', 'DEPRECATED')),
            version TEXT,
            source_consultation_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            approved_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one APPROVED entry per logical key.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_manual_entries_approved_key
        ON manual_entries(business_type, error_code)
        WHERE status = 'APPROVED'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_versions (
            id TEXT PRIMARY KEY,
            entry_id TEXT NOT NULL,
            business_type TEXT NOT NULL,
            error_code TEXT NOT NULL,
            version TEXT NOT NULL,
            major INTEGER NOT NULL,
            minor INTEGER NOT NULL,
            snapshot_json TEXT NOT NULL,
            approved_by TEXT NOT NULL,
            approved_at INTEGER NOT NULL,
            UNIQUE(business_type, error_code, major, minor),
            FOREIGN KEY (entry_id) REFERENCES manual_entries(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_review_tasks (
            id TEXT PRIMARY KEY,
            old_entry_id TEXT,
            new_entry_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('TODO', 'DONE', 'REJECTED')),
            reason TEXT NOT NULL,
            similarity_score REAL,
            differences_json TEXT,
            history_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one open task per draft.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_review_tasks_open_entry
        ON manual_review_tasks(new_entry_id)
        WHERE status = 'TODO'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_vectors (
            entry_id TEXT PRIMARY KEY,
            business_type TEXT NOT NULL,
            error_code TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retry_jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            enqueued_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_manual_entries_key ON manual_entries(business_type, error_code)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_manual_versions_entry ON manual_versions(entry_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_manual_vectors_key ON manual_vectors(business_type, error_code)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_retry_jobs_pending ON retry_jobs(status, enqueued_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

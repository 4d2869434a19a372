//! `mkb stats`: counts by manual status, task status and retry job status,
//! plus vector coverage of the approved set.

use anyhow::Result;

use crate::config::Config;
use crate::db;

async fn grouped(pool: &sqlx::SqlitePool, sql: &str) -> Result<Vec<(String, i64)>> {
    Ok(sqlx::query_as(sql).fetch_all(pool).await?)
}

fn count_of(rows: &[(String, i64)], key: &str) -> i64 {
    rows.iter()
        .find(|(k, _)| k == key)
        .map(|(_, n)| *n)
        .unwrap_or(0)
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let consultations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM consultations")
        .fetch_one(&pool)
        .await?;
    let manuals = grouped(
        &pool,
        "SELECT status, COUNT(*) FROM manual_entries GROUP BY status",
    )
    .await?;
    let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manual_versions")
        .fetch_one(&pool)
        .await?;
    let tasks = grouped(
        &pool,
        "SELECT status, COUNT(*) FROM manual_review_tasks GROUP BY status",
    )
    .await?;
    let jobs = grouped(&pool, "SELECT status, COUNT(*) FROM retry_jobs GROUP BY status").await?;
    let indexed_approved: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM manual_entries e
        JOIN manual_vectors v ON v.entry_id = e.id
        WHERE e.status = 'APPROVED'
        "#,
    )
    .fetch_one(&pool)
    .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let approved = count_of(&manuals, "APPROVED");

    println!("Manual KB: Database Stats");
    println!("==========================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!("  Consultations:  {}", consultations);
    println!("  Manuals:");
    println!("    draft:        {}", count_of(&manuals, "DRAFT"));
    println!("    approved:     {}", approved);
    println!("    deprecated:   {}", count_of(&manuals, "DEPRECATED"));
    println!("  Versions:       {}", versions);
    println!(
        "  Indexed:        {} / {} approved",
        indexed_approved, approved
    );
    println!("  Review tasks:");
    println!("    open:         {}", count_of(&tasks, "TODO"));
    println!("    done:         {}", count_of(&tasks, "DONE"));
    println!("    rejected:     {}", count_of(&tasks, "REJECTED"));
    println!("  Retry jobs:");
    println!("    pending:      {}", count_of(&jobs, "pending"));
    println!("    dead:         {}", count_of(&jobs, "dead"));
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn missing_group_counts_zero() {
        let rows = vec![("DRAFT".to_string(), 2)];
        assert_eq!(count_of(&rows, "DRAFT"), 2);
        assert_eq!(count_of(&rows, "APPROVED"), 0);
    }
}

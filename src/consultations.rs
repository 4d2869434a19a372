//! `mkb consultation import <file>`.
//!
//! The file holds one consultation object or an array of them:
//!
//! ```json
//! [{ "id": "c-1", "summary": "...", "inquiry": "...", "action_taken": "...",
//!    "branch": "Seoul", "business_type": "CARD", "error_code": "E401" }]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use manual_kb_core::models::Consultation;

use crate::config::Config;
use crate::db;
use crate::sqlite_repo::SqliteManualRepository;

#[derive(Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Many(Vec<Consultation>),
    One(Consultation),
}

pub fn parse_import(raw: &str) -> Result<Vec<Consultation>> {
    let parsed: ImportFile =
        serde_json::from_str(raw).context("expected a consultation object or an array of them")?;
    let items = match parsed {
        ImportFile::Many(items) => items,
        ImportFile::One(item) => vec![item],
    };
    for c in &items {
        if c.id.trim().is_empty() {
            bail!("consultation with empty id");
        }
        if c.business_type.trim().is_empty() || c.error_code.trim().is_empty() {
            bail!("consultation {} is missing business_type or error_code", c.id);
        }
    }
    Ok(items)
}

pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let items = parse_import(&raw)?;

    let pool = db::connect(config).await?;
    let repo = SqliteManualRepository::new(pool.clone());
    let mut added = 0usize;
    for c in &items {
        if repo.upsert_consultation(c).await? {
            added += 1;
        }
    }
    pool.close().await;

    info!(total = items.len(), added, "consultations imported");
    println!("consultation import");
    println!("  read: {}", items.len());
    println!("  new: {}", added);
    println!("  updated: {}", items.len() - added);
    Ok(())
}

//! `mkb draft|show|list|update|approve|delete|deprecate|check`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use manual_kb_core::conflict::ConflictResult;
use manual_kb_core::lifecycle::{
    AuthoredDraft, DraftOptions, DraftOutcome, DraftSource, IndexSync, ManualPatch,
};
use manual_kb_core::models::{LogicalKey, ManualContent, ManualEntry, ManualStatus};
use manual_kb_core::repository::EntryFilter;

use crate::app::App;
use crate::config::Config;

/// Body of `mkb draft new --file`.
#[derive(Debug, Deserialize)]
pub struct DraftFile {
    pub business_type: String,
    pub error_code: String,
    pub keywords: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub guideline: String,
    #[serde(default)]
    pub source_consultation_id: Option<String>,
}

impl From<DraftFile> for AuthoredDraft {
    fn from(file: DraftFile) -> Self {
        AuthoredDraft {
            key: LogicalKey::new(file.business_type, file.error_code),
            content: ManualContent {
                keywords: file.keywords,
                topic: file.topic,
                background: file.background,
                guideline: file.guideline,
            },
            source_consultation_id: file.source_consultation_id,
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn draft_options(config: &Config, no_enforce: bool) -> DraftOptions {
    DraftOptions {
        enforce_grounding: config.drafting.enforce_grounding && !no_enforce,
        instructions: None,
    }
}

pub async fn run_draft_from_consultation(
    config: &Config,
    consultation_id: &str,
    no_enforce: bool,
) -> Result<()> {
    let app = App::open(config).await?;
    let outcome = app
        .engine
        .lifecycle
        .create_draft(
            DraftSource::Consultation {
                consultation_id: consultation_id.to_string(),
            },
            &draft_options(config, no_enforce),
        )
        .await;
    app.close().await;
    print_draft_outcome(&outcome?);
    Ok(())
}

pub async fn run_draft_new(config: &Config, file: &Path, no_enforce: bool) -> Result<()> {
    let draft: DraftFile = read_json(file)?;
    let app = App::open(config).await?;
    let outcome = app
        .engine
        .lifecycle
        .create_draft(
            DraftSource::Authored(draft.into()),
            &draft_options(config, no_enforce),
        )
        .await;
    app.close().await;
    print_draft_outcome(&outcome?);
    Ok(())
}

pub async fn run_show(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let entry = app.engine.lifecycle.get(id).await;
    let versions = app.engine.lifecycle.versions(id).await;
    app.close().await;

    let entry = entry?;
    print_entry(&entry);
    let versions = versions?;
    if !versions.is_empty() {
        println!();
        println!("--- Versions ({}) ---", versions.len());
        for v in &versions {
            println!(
                "  {}  by {}  at {}",
                v.label,
                v.approved_by,
                v.approved_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

pub async fn run_list(
    config: &Config,
    status: Option<String>,
    business_type: Option<String>,
    error_code: Option<String>,
) -> Result<()> {
    let filter = EntryFilter {
        status: status.map(|s| s.parse::<ManualStatus>()).transpose()?,
        business_type,
        error_code,
    };
    let app = App::open(config).await?;
    let entries = app.engine.lifecycle.list(&filter).await;
    app.close().await;

    let entries = entries?;
    if entries.is_empty() {
        println!("No manuals.");
        return Ok(());
    }
    for e in &entries {
        println!(
            "{}  {:<10} {:<5} {:<20} {}",
            e.id,
            e.status.as_str(),
            e.version.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            e.key.to_string(),
            e.content.topic
        );
    }
    println!();
    println!("{} manual(s)", entries.len());
    Ok(())
}

pub async fn run_update(config: &Config, id: &str, file: &Path) -> Result<()> {
    let patch: ManualPatch = read_json(file)?;
    let app = App::open(config).await?;
    let entry = app.engine.lifecycle.update(id, &patch).await;
    app.close().await;
    let entry = entry?;
    println!("Updated draft {}.", entry.id);
    print_entry(&entry);
    Ok(())
}

pub async fn run_approve(config: &Config, id: &str, by: &str) -> Result<()> {
    let app = App::open(config).await?;
    let outcome = app.engine.lifecycle.approve(id, by).await;
    app.close().await;
    let outcome = outcome?;

    println!(
        "Approved {} as version {} ({}).",
        outcome.entry.id, outcome.version.label, outcome.entry.key
    );
    for dep in &outcome.deprecated {
        println!("  deprecated: {}", dep);
    }
    print_index_sync(&outcome.index);
    Ok(())
}

pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let removed = app.engine.lifecycle.delete(id).await;
    app.close().await;
    let removed = removed?;
    println!("Deleted draft {} ({} open task(s) removed).", id, removed);
    Ok(())
}

pub async fn run_deprecate(config: &Config, id: &str, by: &str) -> Result<()> {
    let app = App::open(config).await?;
    let outcome = app.engine.lifecycle.deprecate(id, by).await;
    app.close().await;
    let outcome = outcome?;
    println!("Deprecated {} ({}).", outcome.entry.id, outcome.entry.key);
    print_index_sync(&outcome.index);
    Ok(())
}

pub async fn run_check(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let result = app.engine.lifecycle.check(id).await;
    app.close().await;
    print_conflict(&result?);
    Ok(())
}

fn print_entry(e: &ManualEntry) {
    println!("--- Manual ---");
    println!("id:           {}", e.id);
    println!("key:          {}", e.key);
    println!("status:       {}", e.status);
    if let Some(v) = e.version {
        println!("version:      {}", v);
    }
    if let Some(src) = &e.source_consultation_id {
        println!("consultation: {}", src);
    }
    println!("created_at:   {}", e.created_at.to_rfc3339());
    println!("updated_at:   {}", e.updated_at.to_rfc3339());
    if let Some(at) = e.approved_at {
        println!("approved_at:  {}", at.to_rfc3339());
    }
    println!();
    println!("keywords:     {}", e.content.keywords.join(", "));
    println!("topic:        {}", e.content.topic);
    println!();
    println!("--- Background ---");
    println!("{}", e.content.background);
    println!();
    println!("--- Guideline ---");
    println!("{}", e.content.guideline);
}

fn print_conflict(c: &ConflictResult) {
    println!("conflict:     {}", c.kind);
    if let Some(score) = c.similarity_score {
        println!("similarity:   {:.3}", score);
    }
    if let Some(m) = &c.matched_entry {
        println!("matched:      {} ({})", m.id, m.content.topic);
    }
    if let Some(task) = &c.task_id {
        println!("review task:  {}", task);
    }
}

fn print_draft_outcome(outcome: &DraftOutcome) {
    println!("Created draft {}.", outcome.entry.id);
    print_entry(&outcome.entry);
    println!();
    print_conflict(&outcome.conflict);
    if let Some(report) = &outcome.grounding {
        if report.is_grounded() {
            println!("grounding:    ok");
        } else {
            println!("grounding:    NOT GROUNDED");
            for finding in report.findings() {
                println!("  - {}", finding);
            }
        }
    }
    if let Some(task) = &outcome.review_task_id {
        if outcome.conflict.task_id.as_deref() != Some(task.as_str()) {
            println!("review task:  {}", task);
        }
    }
}

fn print_index_sync(sync: &IndexSync) {
    match sync {
        IndexSync::Synced => println!("index: synced"),
        IndexSync::Deferred { job_id } => {
            println!("index: deferred (retry job {})", job_id)
        }
        IndexSync::Unsynced { reason } => {
            println!("index: NOT synced ({}); run `mkb index rebuild`", reason)
        }
    }
}

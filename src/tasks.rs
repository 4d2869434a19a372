//! `mkb tasks list|show|approve|reject`.

use anyhow::Result;

use manual_kb_core::models::{ReviewTask, TaskStatus};

use crate::app::App;
use crate::config::Config;

pub async fn run_list(config: &Config, status: Option<String>, all: bool) -> Result<()> {
    let status = match (status, all) {
        (Some(s), _) => Some(s.parse::<TaskStatus>()?),
        (None, true) => None,
        (None, false) => Some(TaskStatus::Todo),
    };
    let app = App::open(config).await?;
    let tasks = app.engine.review.list_tasks(status).await;
    app.close().await;

    let tasks = tasks?;
    if tasks.is_empty() {
        println!("No review tasks.");
        return Ok(());
    }
    for t in &tasks {
        println!(
            "{}  {:<8} {:<10} draft={} old={} score={}",
            t.id,
            t.status.as_str(),
            t.reason.as_str(),
            t.new_entry_id,
            t.old_entry_id.as_deref().unwrap_or("-"),
            t.similarity_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "-".into())
        );
    }
    println!();
    println!("{} task(s)", tasks.len());
    Ok(())
}

pub async fn run_show(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let task = app.engine.review.get_task(id).await;
    app.close().await;
    print_task(&task?);
    Ok(())
}

pub async fn run_approve(config: &Config, id: &str, by: &str, notes: Option<String>) -> Result<()> {
    let app = App::open(config).await?;
    let decision = app.engine.review.approve_task(id, by, notes).await;
    app.close().await;
    let decision = decision?;

    println!("Task {} approved by {}.", decision.task.id, by);
    match &decision.approval {
        Some(approval) => println!(
            "  draft {} approved as version {}",
            approval.entry.id, approval.version.label
        ),
        None => println!("  draft {} was no longer a draft; nothing approved", decision.task.new_entry_id),
    }
    Ok(())
}

pub async fn run_reject(config: &Config, id: &str, by: &str, reason: &str) -> Result<()> {
    let app = App::open(config).await?;
    let task = app.engine.review.reject_task(id, by, reason).await;
    app.close().await;
    let task = task?;
    println!("Task {} rejected by {}.", task.id, by);
    Ok(())
}

fn print_task(t: &ReviewTask) {
    println!("--- Review task ---");
    println!("id:         {}", t.id);
    println!("status:     {}", t.status);
    println!("reason:     {}", t.reason.as_str());
    println!("draft:      {}", t.new_entry_id);
    if let Some(old) = &t.old_entry_id {
        println!("approved:   {}", old);
    }
    if let Some(score) = t.similarity_score {
        println!("similarity: {:.3}", score);
    }
    if let Some(diffs) = &t.differences {
        println!();
        println!("--- Differences ({}) ---", diffs.len());
        for d in diffs {
            println!("  - {}", d);
        }
    }
    println!();
    println!("--- History ---");
    for ev in &t.history {
        let change = match ev.from {
            Some(from) if from == ev.to => "note".to_string(),
            from => format!("{} -> {}", from.map(|s| s.as_str()).unwrap_or("-"), ev.to),
        };
        print!(
            "  {}  {}  by {}",
            ev.at.format("%Y-%m-%d %H:%M:%S"),
            change,
            ev.actor
        );
        match &ev.notes {
            Some(notes) => println!("  ({})", notes),
            None => println!(),
        }
    }
}

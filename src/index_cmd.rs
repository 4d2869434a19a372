//! `mkb index rebuild|retry`: maintenance of the vector index.

use anyhow::{bail, Result};

use crate::app::App;
use crate::config::Config;

fn require_embeddings(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Index maintenance requires embeddings. Set [embedding] provider in config.");
    }
    Ok(())
}

/// Re-index every APPROVED manual and drop vectors of DEPRECATED ones.
pub async fn run_rebuild(config: &Config) -> Result<()> {
    require_embeddings(config)?;
    let app = App::open(config).await?;
    let report = app.engine.maintenance.rebuild_index().await;
    let remaining = app.vectors.len().await;
    app.close().await;

    let report = report?;
    println!("index rebuild");
    println!("  indexed: {}", report.indexed);
    println!("  removed: {}", report.removed);
    println!("  failed: {}", report.failed);
    println!("  vectors stored: {}", remaining?);
    if report.failed > 0 {
        bail!("{} manual(s) could not be indexed", report.failed);
    }
    Ok(())
}

/// Replay queued index writes and deletes.
pub async fn run_retry(config: &Config, limit: Option<usize>) -> Result<()> {
    require_embeddings(config)?;
    let app = App::open(config).await?;
    let limit = limit.unwrap_or(config.retry.batch_size);
    let report = app.engine.maintenance.drain_retry_jobs(limit).await;
    let counts = app.retry_queue.counts().await;
    app.close().await;

    let report = report?;
    println!("index retry");
    println!("  claimed: {}", report.claimed);
    println!("  succeeded: {}", report.succeeded);
    println!("  skipped: {}", report.skipped);
    println!("  retrying: {}", report.retrying);
    println!("  dead: {}", report.dead);
    for (status, n) in counts? {
        println!("  queue {}: {}", status, n);
    }
    Ok(())
}

//! `mkb search "<query>"`: semantic search over APPROVED manuals.

use anyhow::{bail, Result};

use manual_kb_core::index::MetadataFilter;

use crate::app::App;
use crate::config::Config;

pub async fn run_search(
    config: &Config,
    query: &str,
    business_type: Option<String>,
    error_code: Option<String>,
    limit: usize,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let filter = MetadataFilter {
        business_type,
        error_code,
    };
    let app = App::open(config).await?;
    let hits = app
        .engine
        .search
        .search_manuals(query, &filter, limit)
        .await;
    app.close().await;

    let hits = hits?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let e = &hit.entry;
        println!(
            "{}. [{:.3}] {} ({})",
            i + 1,
            hit.score,
            e.content.topic,
            e.key
        );
        println!(
            "    version: {}",
            e.version.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
        );
        println!("    keywords: {}", e.content.keywords.join(", "));
        println!("    id: {}", e.id);
        println!();
    }
    Ok(())
}

//! Builds the engine from configuration: SQLite repository, retry queue and
//! vector index over one pool, plus the configured embedding and generation
//! providers.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use manual_kb_core::{Collaborators, Engine};

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::generation::create_drafter;
use crate::retry_queue::SqliteRetryQueue;
use crate::sqlite_repo::SqliteManualRepository;
use crate::vector_index::SqliteVectorIndex;

pub struct App {
    pub engine: Engine,
    pub repository: Arc<SqliteManualRepository>,
    pub retry_queue: Arc<SqliteRetryQueue>,
    pub vectors: Arc<SqliteVectorIndex>,
    pool: SqlitePool,
}

impl App {
    /// Connect to the configured database. Run `mkb init` first.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        Self::with_pool(config, pool)
    }

    pub fn with_pool(config: &Config, pool: SqlitePool) -> Result<Self> {
        let repository = Arc::new(SqliteManualRepository::new(pool.clone()));
        let retry_queue = Arc::new(SqliteRetryQueue::new(pool.clone()));
        let embedder = create_provider(&config.embedding)?;
        let vectors = Arc::new(SqliteVectorIndex::new(pool.clone(), embedder));
        let drafter = create_drafter(&config.generation)?;

        let engine = Engine::new(
            Collaborators {
                repository: repository.clone(),
                index: vectors.clone(),
                drafter,
                retry_queue: retry_queue.clone(),
            },
            config.engine_params(),
        )
        .context("invalid engine parameters")?;

        Ok(Self {
            engine,
            repository,
            retry_queue,
            vectors,
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

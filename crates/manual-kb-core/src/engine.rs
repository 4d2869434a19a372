//! Wiring: one place that turns the four collaborators plus
//! [`EngineParams`] into the engine's services.

use std::sync::Arc;

use crate::conflict::ConflictDetector;
use crate::error::Result;
use crate::generation::Drafter;
use crate::index::SimilarityIndex;
use crate::lifecycle::ManualLifecycle;
use crate::maintenance::IndexMaintenance;
use crate::params::EngineParams;
use crate::queue::RetryQueue;
use crate::repository::ManualRepository;
use crate::review::ReviewWorkflow;
use crate::search::ManualSearch;

/// External collaborators the engine is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn ManualRepository>,
    pub index: Arc<dyn SimilarityIndex>,
    pub drafter: Arc<dyn Drafter>,
    pub retry_queue: Arc<dyn RetryQueue>,
}

#[derive(Clone)]
pub struct Engine {
    pub lifecycle: ManualLifecycle,
    pub review: ReviewWorkflow,
    pub search: ManualSearch,
    pub maintenance: IndexMaintenance,
    params: Arc<EngineParams>,
}

impl Engine {
    /// Fails if `params` is inconsistent.
    pub fn new(collaborators: Collaborators, params: EngineParams) -> Result<Self> {
        params.validate()?;
        let params = Arc::new(params);
        let Collaborators {
            repository,
            index,
            drafter,
            retry_queue,
        } = collaborators;

        let lifecycle = ManualLifecycle::new(
            repository.clone(),
            index.clone(),
            drafter,
            retry_queue.clone(),
            params.clone(),
        );
        let review = ReviewWorkflow::new(repository.clone(), lifecycle.clone());
        let search = ManualSearch::new(repository.clone(), index.clone());
        let maintenance =
            IndexMaintenance::new(repository, index, retry_queue, params.retry_max_attempts);

        Ok(Self {
            lifecycle,
            review,
            search,
            maintenance,
            params,
        })
    }

    pub fn conflicts(&self) -> &ConflictDetector {
        self.lifecycle.detector()
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }
}

//! Error taxonomy for the manual engine.
//!
//! Gateway and repository traits speak `anyhow::Result` so adapters can
//! bubble up whatever their transport produces. The engine converts those
//! failures into [`ManualError`] at the boundary, so callers can match on
//! the category instead of string-sniffing messages.

use std::fmt;

use thiserror::Error;

/// The kind of record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Manual,
    Task,
    Consultation,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Manual => f.write_str("manual entry"),
            Entity::Task => f.write_str("review task"),
            Entity::Consultation => f.write_str("consultation"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManualError {
    /// Malformed input to a state transition. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal transition for the record's current state. Nothing was written.
    #[error("{entity} {id} is {current}; operation requires {required}")]
    State {
        entity: Entity,
        id: String,
        current: String,
        required: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    /// Only surfaced by read paths (search). Lifecycle operations convert
    /// index failures into retry jobs instead.
    #[error("similarity index unavailable: {0:#}")]
    IndexUnavailable(anyhow::Error),

    /// The drafting backend failed or returned output that could not be used.
    #[error("generation failed: {0:#}")]
    Generation(anyhow::Error),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl ManualError {
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        ManualError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn state(
        entity: Entity,
        id: impl Into<String>,
        current: impl fmt::Display,
        required: impl fmt::Display,
    ) -> Self {
        ManualError::State {
            entity,
            id: id.into(),
            current: current.to_string(),
            required: required.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ManualError::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ManualError::NotFound { .. })
    }

    pub fn is_state(&self) -> bool {
        matches!(self, ManualError::State { .. })
    }
}

pub type Result<T, E = ManualError> = std::result::Result<T, E>;

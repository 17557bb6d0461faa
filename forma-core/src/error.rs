use thiserror::Error;
use uuid::Uuid;

use crate::generation::GenerationError;

/// Failure taxonomy for the debrief pipeline.
///
/// `RateLimited` is the only variant a caller should retry; `Storage` is
/// retried internally (transaction fallback, version-collision retry) and is
/// fatal once it escapes.
#[derive(Error, Debug)]
pub enum DebriefError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Generation service rate limited: {0}")]
    RateLimited(String),

    #[error("Model returned non-JSON output: {snippet}")]
    MalformedOutput { snippet: String },

    #[error("Generated content failed schema validation: {0}")]
    SchemaValidation(String),

    #[error("Workout session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Generation request failed: {0}")]
    Generation(#[from] GenerationError),
}

impl DebriefError {
    /// True for failures worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DebriefError::RateLimited(_))
    }
}

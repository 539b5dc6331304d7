//! Error types for task-worker

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Core(#[from] relay_core::Error),

    #[error(transparent)]
    InvalidTransition(#[from] relay_core::task::InvalidTransition),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Delivery target could not be derived from the task
    #[error("Cannot deliver to {platform}: {reason}")]
    Undeliverable {
        platform: &'static str,
        reason: String,
    },
}

impl WorkerError {
    pub fn undeliverable(platform: &'static str, reason: impl Into<String>) -> Self {
        Self::Undeliverable {
            platform,
            reason: reason.into(),
        }
    }
}

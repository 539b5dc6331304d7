//! Error types for task-logger

use thiserror::Error;

/// Result type alias for log assembly
pub type Result<T> = std::result::Result<T, LoggerError>;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error(transparent)]
    Core(#[from] relay_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task ids name directories, so they must be plain path segments
    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),
}

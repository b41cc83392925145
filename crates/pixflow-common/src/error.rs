//! Error types for pixflow

use thiserror::Error;

/// Result type alias for pixflow operations
pub type Result<T> = std::result::Result<T, PixflowError>;

/// Main error type shared by the pipeline crates
#[derive(Error, Debug)]
pub enum PixflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown error kind: {0}")]
    UnknownErrorKind(String),
}

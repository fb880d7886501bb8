//! Engine error types.

use thiserror::Error;

/// Errors raised by engine storage.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The recovery file could not be read or written.
    #[error("recovery store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The recovery file is not a valid record.
    #[error("recovery record is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

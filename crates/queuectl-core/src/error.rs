//! Error types for queuectl.

use thiserror::Error;

/// Result type alias using queuectl's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for queuectl operations.
///
/// Command execution failures are deliberately absent: a job whose command
/// exits non-zero is routed through the retry policy, not surfaced as an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Store operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job or dead-letter entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input (e.g. enqueue without a command)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

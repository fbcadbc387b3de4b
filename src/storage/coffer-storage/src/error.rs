//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entry not found.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Entry already exists.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// The backend could not be opened or reached.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A query or statement failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Caller supplied an invalid argument (tenant name, key).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

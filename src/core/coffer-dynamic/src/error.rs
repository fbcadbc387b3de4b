//! Dynamic secret error types.

use thiserror::Error;

use coffer_crypto::CryptoError;
use coffer_projects::ProjectError;
use coffer_storage::StorageError;

/// Errors returned by the dynamic secrets engine and its providers.
#[derive(Debug, Error)]
pub enum DynamicError {
    /// Dynamic secret or lease not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A dynamic secret with the same name exists in the folder.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Invalid inputs, TTL or lease limit.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The provider rejected the operation or could not be reached.
    #[error("provider error: {0}")]
    Provider(String),

    /// Error from the projects engine.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// Sealing or opening provider inputs failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for DynamicError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => DynamicError::NotFound(what),
            StorageError::AlreadyExists(what) => DynamicError::AlreadyExists(what),
            other => DynamicError::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for DynamicError {
    fn from(err: sqlx::Error) -> Self {
        DynamicError::Provider(err.to_string())
    }
}

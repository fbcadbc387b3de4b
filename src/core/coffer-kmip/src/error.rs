//! KMIP engine error types.

use thiserror::Error;

use coffer_crypto::CryptoError;
use coffer_storage::StorageError;

/// Errors that can occur in the KMIP engine.
#[derive(Debug, Error)]
pub enum KmipError {
    /// Client or managed object not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A client with the same name already exists in the project.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Malformed request.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The object's state does not allow the operation.
    #[error("operation not allowed: {operation} on object in state {state}")]
    WrongState {
        /// Operation name.
        operation: String,
        /// Current object state.
        state: String,
    },

    /// The client lacks the permission for the operation.
    #[error("client is not allowed to {0}")]
    Forbidden(String),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for KmipError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => KmipError::NotFound(what),
            StorageError::AlreadyExists(what) => KmipError::AlreadyExists(what),
            other => KmipError::Storage(other.to_string()),
        }
    }
}

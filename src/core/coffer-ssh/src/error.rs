//! SSH engine error types.

use thiserror::Error;

use coffer_crypto::CryptoError;
use coffer_storage::StorageError;

/// Errors that can occur in the SSH engine.
#[derive(Debug, Error)]
pub enum SshError {
    /// CA or template not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A template with the same name already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Malformed request or template violation.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The CA or template is disabled.
    #[error("{0} is disabled")]
    Disabled(String),

    /// Key or certificate encoding error.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for SshError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => SshError::NotFound(what),
            StorageError::AlreadyExists(what) => SshError::AlreadyExists(what),
            other => SshError::Storage(other.to_string()),
        }
    }
}

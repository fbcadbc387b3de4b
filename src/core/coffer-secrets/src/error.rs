//! Secrets engine error types.

use thiserror::Error;

/// Errors that can occur in the secrets engine.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Secret not found.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// A secret with this key already exists in the folder.
    #[error("secret already exists: {0}")]
    AlreadyExists(String),

    /// Secret version not found.
    #[error("secret version not found: {key} v{version}")]
    VersionNotFound {
        /// Secret key.
        key: String,
        /// Version number.
        version: u32,
    },

    /// Optimistic concurrency check failed.
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version the caller based its change on.
        expected: u32,
        /// Current version.
        found: u32,
    },

    /// Invalid secret key.
    #[error("invalid secret key: {0}")]
    InvalidKey(String),

    /// Invalid folder path.
    #[error("invalid secret path: {0}")]
    InvalidPath(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<coffer_crypto::CryptoError> for SecretsError {
    fn from(e: coffer_crypto::CryptoError) -> Self {
        SecretsError::Crypto(e.to_string())
    }
}

impl From<coffer_storage::StorageError> for SecretsError {
    fn from(e: coffer_storage::StorageError) -> Self {
        SecretsError::Storage(e.to_string())
    }
}

impl From<sqlx::Error> for SecretsError {
    fn from(e: sqlx::Error) -> Self {
        SecretsError::Storage(e.to_string())
    }
}

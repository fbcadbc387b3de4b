//! Approval workflow error types.

use thiserror::Error;

use coffer_crypto::CryptoError;
use coffer_projects::ProjectError;
use coffer_secrets::SecretsError;
use coffer_storage::StorageError;

/// Errors returned by the approvals engine.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// Policy or request not found, or no policy matches.
    #[error("{0} not found")]
    NotFound(String),

    /// A policy with the same name, or an equivalent request, already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The request is malformed or not allowed in the current state.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The actor may not review, merge or close the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Error from the projects engine.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// Error while applying a change request.
    #[error(transparent)]
    Secrets(#[from] SecretsError),

    /// Sealing or opening a pending value failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for ApprovalError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ApprovalError::NotFound(what),
            StorageError::AlreadyExists(what) => ApprovalError::AlreadyExists(what),
            other => ApprovalError::Storage(other.to_string()),
        }
    }
}

//! Project error types.

use thiserror::Error;

use coffer_storage::StorageError;

/// Errors returned by the projects engine and permission checks.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// The referenced organization, project, folder or member does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A record with the same unique name or slug already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The actor is not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for ProjectError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ProjectError::NotFound(what),
            StorageError::AlreadyExists(what) => ProjectError::AlreadyExists(what),
            other => ProjectError::Storage(other.to_string()),
        }
    }
}

//! Audit error types.

use thiserror::Error;

/// Errors raised while recording or querying audit events.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Unknown event type name in a filter.
    #[error("unknown audit event type: {0}")]
    UnknownEventType(String),

    /// Storage error.
    #[error("audit storage error: {0}")]
    Storage(String),
}

impl From<coffer_storage::StorageError> for AuditError {
    fn from(e: coffer_storage::StorageError) -> Self {
        AuditError::Storage(e.to_string())
    }
}

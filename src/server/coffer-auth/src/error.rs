//! Authentication error types.

use thiserror::Error;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Invalid credentials (bad token, wrong client secret, etc.).
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Token or client secret has expired.
    #[error("token expired")]
    TokenExpired,

    /// Missing authentication token.
    #[error("missing authentication token")]
    MissingToken,

    /// The token is valid but its mode is not accepted by the route.
    #[error("auth mode not allowed: {0}")]
    MethodNotEnabled(String),

    /// Referenced identity, client secret or token does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed request.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Backend configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cryptographic failure while hashing or signing.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<coffer_storage::StorageError> for AuthError {
    fn from(e: coffer_storage::StorageError) -> Self {
        AuthError::Storage(e.to_string())
    }
}

impl From<coffer_crypto::CryptoError> for AuthError {
    fn from(e: coffer_crypto::CryptoError) -> Self {
        AuthError::Crypto(e.to_string())
    }
}

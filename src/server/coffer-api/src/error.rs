//! API error type and its HTTP mapping.
//!
//! Engine errors are converted with `?`. Storage and crypto failures are
//! logged here and surface to clients as an opaque 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use coffer_approvals::ApprovalError;
use coffer_audit::AuditError;
use coffer_auth::AuthError;
use coffer_dynamic::DynamicError;
use coffer_kmip::KmipError;
use coffer_projects::ProjectError;
use coffer_secrets::SecretsError;
use coffer_ssh::SshError;

const INTERNAL_MESSAGE: &str = "Something went wrong";

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request, failed validation or duplicate resource.
    #[error("{0}")]
    BadRequest(String),

    /// Missing, invalid or expired credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("{0}")]
    Forbidden(String),

    /// Referenced resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Internal failure. The detail is logged, never returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code put in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unauthorized(_) => "UnauthorizedError",
            ApiError::Forbidden(_) => "PermissionDenied",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Internal(_) => "InternalServerError",
        }
    }

    /// Message safe to return to clients.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Internal(_) => INTERNAL_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn internal(source: impl std::fmt::Display) -> Self {
        error!(error = %source, "Internal error while handling request");
        ApiError::Internal(source.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.code(), "message": self.public_message() }));
        (status, body).into_response()
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<ProjectError> for ApiError {
    fn from(e: ProjectError) -> Self {
        match e {
            ProjectError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ProjectError::AlreadyExists(_) | ProjectError::Invalid(_) => {
                ApiError::BadRequest(e.to_string())
            },
            ProjectError::Forbidden(_) => ApiError::Forbidden(e.to_string()),
            ProjectError::Storage(_) => ApiError::internal(e),
        }
    }
}

impl From<SecretsError> for ApiError {
    fn from(e: SecretsError) -> Self {
        match e {
            SecretsError::NotFound(_) | SecretsError::VersionNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            },
            SecretsError::AlreadyExists(_)
            | SecretsError::VersionMismatch { .. }
            | SecretsError::InvalidKey(_)
            | SecretsError::InvalidPath(_) => ApiError::BadRequest(e.to_string()),
            SecretsError::Storage(_) | SecretsError::Crypto(_) => ApiError::internal(e),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ApprovalError::AlreadyExists(_) | ApprovalError::Invalid(_) => {
                ApiError::BadRequest(e.to_string())
            },
            ApprovalError::Forbidden(_) => ApiError::Forbidden(e.to_string()),
            ApprovalError::Project(inner) => inner.into(),
            ApprovalError::Secrets(inner) => inner.into(),
            ApprovalError::Crypto(_) | ApprovalError::Storage(_) => ApiError::internal(e),
        }
    }
}

impl From<DynamicError> for ApiError {
    fn from(e: DynamicError) -> Self {
        match e {
            DynamicError::NotFound(_) => ApiError::NotFound(e.to_string()),
            DynamicError::AlreadyExists(_)
            | DynamicError::Invalid(_)
            | DynamicError::Provider(_) => ApiError::BadRequest(e.to_string()),
            DynamicError::Project(inner) => inner.into(),
            DynamicError::Crypto(_) | DynamicError::Storage(_) => ApiError::internal(e),
        }
    }
}

impl From<KmipError> for ApiError {
    fn from(e: KmipError) -> Self {
        match e {
            KmipError::NotFound(_) => ApiError::NotFound(e.to_string()),
            KmipError::AlreadyExists(_) | KmipError::Invalid(_) | KmipError::WrongState { .. } => {
                ApiError::BadRequest(e.to_string())
            },
            KmipError::Forbidden(_) => ApiError::Forbidden(e.to_string()),
            KmipError::Crypto(_) | KmipError::Storage(_) => ApiError::internal(e),
        }
    }
}

impl From<SshError> for ApiError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::NotFound(_) => ApiError::NotFound(e.to_string()),
            SshError::AlreadyExists(_)
            | SshError::Invalid(_)
            | SshError::Disabled(_)
            | SshError::InvalidKey(_) => ApiError::BadRequest(e.to_string()),
            SshError::Crypto(_) | SshError::Storage(_) => ApiError::internal(e),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::UnknownEventType(_) => ApiError::BadRequest(e.to_string()),
            AuditError::Storage(_) => ApiError::internal(e),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials | AuthError::TokenExpired | AuthError::MissingToken => {
                ApiError::Unauthorized(e.to_string())
            },
            AuthError::MethodNotEnabled(_) => ApiError::Forbidden(e.to_string()),
            AuthError::NotFound(_) => ApiError::NotFound(e.to_string()),
            AuthError::Invalid(_) => ApiError::BadRequest(e.to_string()),
            AuthError::Configuration(_) | AuthError::Storage(_) | AuthError::Crypto(_) => {
                ApiError::internal(e)
            },
        }
    }
}

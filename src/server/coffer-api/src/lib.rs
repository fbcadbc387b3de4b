//! # Coffer API
//!
//! REST API layer for Coffer.
//!
//! ## Endpoints
//!
//! - `/api/status` - Health
//! - `/api/v1/auth/*`, `/api/v1/identities/*` - Universal auth and identities
//! - `/api/v1/projects/*`, `/api/v1/folders/*` - Projects, environments, folders
//! - `/api/v4/secrets/*` - Secrets
//! - `/api/v1/access-approvals/*`, `/api/v1/secret-approvals/*`,
//!   `/api/v1/secret-approval-requests/*` - Approval workflows
//! - `/api/v1/dynamic-secrets/*` - Dynamic secrets and leases
//! - `/api/v1/kmip/*` - KMIP clients and operations
//! - `/api/v1/ssh/*` - SSH CAs, templates and certificates
//! - `/api/v1/projects/{id}/audit-logs` - Audit log queries
//! - `/api/v1/scim/*` - SCIM provisioning
//!
//! Every router declares the auth modes it accepts and its rate-limit
//! class. Mutations are audited.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod state;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use audit::RequestMeta;
pub use auth::Auth;
pub use error::ApiError;
pub use rate_limit::{RateLimitConfig, RateLimitSettings, RateLimiters};
pub use state::{ApiSettings, AppState};

/// Builds the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::status::router(&state))
        .merge(routes::auth::router(&state))
        .merge(routes::identities::router(&state))
        .merge(routes::projects::router(&state))
        .merge(routes::folders::router(&state))
        .merge(routes::secrets::router(&state))
        .merge(routes::access_approvals::router(&state))
        .merge(routes::secret_approvals::router(&state))
        .merge(routes::dynamic::router(&state))
        .merge(routes::kmip::router(&state))
        .merge(routes::ssh::router(&state))
        .merge(routes::audit_logs::router(&state))
        .merge(routes::scim::router(&state))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

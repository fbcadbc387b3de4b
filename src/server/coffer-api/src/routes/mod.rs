//! Route modules and the layering shared by all of them.

pub mod access_approvals;
pub mod audit_logs;
pub mod auth;
pub mod dynamic;
pub mod folders;
pub mod identities;
pub mod kmip;
mod policies;
pub mod projects;
pub mod scim;
pub mod secret_approvals;
pub mod secrets;
pub mod ssh;
pub mod status;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use serde::Deserialize;

use coffer_auth::AuthMode;

use crate::auth::{authenticate, AuthGate};
use crate::rate_limit::{rate_limit, RateLimitGate, RateLimitPolicy};
use crate::{ApiError, AppState};

/// Wraps `router` with authentication for `modes`, then rate limiting.
pub(crate) fn guarded(
    router: Router<AppState>,
    state: &AppState,
    modes: &'static [AuthMode],
    policy: RateLimitPolicy,
) -> Router<AppState> {
    public(
        router.route_layer(from_fn_with_state(
            AuthGate {
                authenticator: Arc::clone(&state.authenticator),
                projects: Arc::clone(&state.projects),
                modes,
            },
            authenticate,
        )),
        state,
        policy,
    )
}

/// Wraps `router` with rate limiting only.
pub(crate) fn public(
    router: Router<AppState>,
    state: &AppState,
    policy: RateLimitPolicy,
) -> Router<AppState> {
    router.route_layer(from_fn_with_state(
        RateLimitGate {
            limiters: Arc::clone(&state.rate_limits),
            policy,
        },
        rate_limit,
    ))
}

/// `?projectId=` on routes addressed by another id.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProjectQuery {
    pub project_id: String,
}

fn default_path() -> String {
    "/".to_string()
}

/// Fails unless every approver is a member of `project_id`.
pub(crate) async fn require_members(
    state: &AppState,
    project_id: &str,
    approvers: &[String],
) -> Result<(), ApiError> {
    for approver in approvers {
        if state
            .projects
            .get_membership(project_id, approver)
            .await?
            .is_none()
        {
            return Err(ApiError::BadRequest(format!(
                "approver '{}' is not a member of the project",
                approver
            )));
        }
    }
    Ok(())
}

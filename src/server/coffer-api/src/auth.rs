//! Bearer token authentication and permission lookups.
//!
//! Each router is wrapped in an [`AuthGate`] listing the modes it accepts.
//! The gate validates the `Authorization: Bearer` token and stores the
//! [`AuthContext`] in the request extensions, where handlers pick it up
//! with the [`Auth`] extractor.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use coffer_audit::{ActorType, AuditActor};
use coffer_auth::{Actor, AuthContext, AuthError, AuthMode, Authenticator};
use coffer_projects::{ActorKind, OrgRole, ProjectError, ProjectPermission, ProjectsEngine};

use crate::{ApiError, AppState};

/// User JWTs only.
pub const JWT: &[AuthMode] = &[AuthMode::Jwt];

/// User JWTs and identity access tokens.
pub const JWT_OR_IDENTITY: &[AuthMode] = &[AuthMode::Jwt, AuthMode::IdentityAccessToken];

/// Identity access tokens only.
pub const IDENTITY: &[AuthMode] = &[AuthMode::IdentityAccessToken];

/// SCIM tokens only.
pub const SCIM: &[AuthMode] = &[AuthMode::ScimToken];

/// State of the authentication middleware on one router.
#[derive(Clone)]
pub struct AuthGate {
    pub(crate) authenticator: Arc<Authenticator>,
    pub(crate) projects: Arc<ProjectsEngine>,
    pub(crate) modes: &'static [AuthMode],
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
}

/// Middleware authenticating the request against the gate's modes.
pub async fn authenticate(
    State(gate): State<AuthGate>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(AuthError::MissingToken)?;
    let ctx = gate.authenticator.authenticate(token, gate.modes).await?;
    if let Actor::User { id, .. } = &ctx.actor {
        require_active_user(&gate.projects, id, &ctx.org_id).await?;
    }
    debug!(actor_id = %ctx.actor_id(), mode = %ctx.auth_mode, "Request authenticated");

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

/// Rejects tokens of users that were removed or deactivated after the
/// token was issued.
async fn require_active_user(
    projects: &ProjectsEngine,
    user_id: &str,
    org_id: &str,
) -> Result<(), ApiError> {
    let user = match projects.get_user(user_id).await {
        Ok(user) => user,
        Err(ProjectError::NotFound(_)) => {
            return Err(ApiError::Unauthorized("user no longer exists".into()))
        },
        Err(e) => return Err(e.into()),
    };
    if user.org_id != org_id {
        return Err(ApiError::Unauthorized("user belongs to another organization".into()));
    }
    if !user.active {
        return Err(ApiError::Forbidden("user is deactivated".into()));
    }
    Ok(())
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Auth(pub AuthContext);

impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(Auth)
            .ok_or_else(|| ApiError::Unauthorized(AuthError::MissingToken.to_string()))
    }
}

impl Auth {
    /// The caller as a project member kind.
    pub fn actor_kind(&self) -> Result<ActorKind, ApiError> {
        match self.0.actor {
            Actor::User { .. } => Ok(ActorKind::User),
            Actor::Identity { .. } => Ok(ActorKind::Identity),
            Actor::ScimClient { .. } => Err(ApiError::Forbidden(
                "SCIM clients cannot access projects".into(),
            )),
        }
    }

    /// The caller as recorded in audit events.
    pub fn audit_actor(&self) -> AuditActor {
        let actor_type = match self.0.actor {
            Actor::User { .. } => ActorType::User,
            Actor::Identity { .. } => ActorType::Identity,
            Actor::ScimClient { .. } => ActorType::ScimClient,
        };
        AuditActor {
            actor_type,
            id: Some(self.0.actor_id().to_string()),
            name: self.0.actor_name().map(str::to_string),
        }
    }

    /// Key id embedded in SSH certificates by default, e.g. `user-<id>`.
    pub fn default_key_id(&self) -> String {
        let kind = match self.0.actor {
            Actor::User { .. } => "user",
            Actor::Identity { .. } => "identity",
            Actor::ScimClient { .. } => "scim",
        };
        format!("{}-{}", kind, self.0.actor_id())
    }
}

impl AppState {
    /// Effective permission of the caller in `project_id`.
    pub async fn permission(
        &self,
        auth: &Auth,
        project_id: &str,
    ) -> Result<ProjectPermission, ApiError> {
        auth.actor_kind()?;
        Ok(self
            .projects
            .project_permission(project_id, auth.0.actor_id(), &auth.0.org_id)
            .await?)
    }

    /// Fails unless the caller administers its organization.
    pub async fn require_org_admin(&self, auth: &Auth) -> Result<(), ApiError> {
        let is_admin = match &auth.0.actor {
            Actor::User { id, .. } => {
                let user = self.projects.get_user(id).await?;
                user.org_id == auth.0.org_id && user.active && user.org_role == OrgRole::Admin
            },
            Actor::Identity { id, .. } => {
                let identity = self.universal_auth.get_identity(id).await?;
                identity.org_id == auth.0.org_id && identity.org_role == "admin"
            },
            Actor::ScimClient { .. } => false,
        };
        if is_admin {
            Ok(())
        } else {
            Err(ApiError::Forbidden("organization admin required".into()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ctx(actor: Actor) -> Auth {
        Auth(AuthContext {
            actor,
            org_id: "org-1".into(),
            auth_mode: AuthMode::Jwt,
            expires_at: None,
        })
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer a.b.c"));
        assert_eq!(bearer_token(&headers), Some("a.b.c"));
    }

    #[test]
    fn test_actor_mapping() {
        let user = ctx(Actor::User {
            id: "u1".into(),
            email: Some("a@example.com".into()),
        });
        assert_eq!(user.actor_kind().unwrap(), ActorKind::User);
        assert_eq!(user.audit_actor().actor_type, ActorType::User);
        assert_eq!(user.audit_actor().name.as_deref(), Some("a@example.com"));
        assert_eq!(user.default_key_id(), "user-u1");

        let scim = ctx(Actor::ScimClient {
            token_id: "t1".into(),
        });
        assert!(matches!(scim.actor_kind(), Err(ApiError::Forbidden(_))));
        assert_eq!(scim.audit_actor().actor_type, ActorType::ScimClient);
    }
}

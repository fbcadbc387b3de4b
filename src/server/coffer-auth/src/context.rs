//! Authentication context types.

use serde::{Deserialize, Serialize};

/// How a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// User JWT.
    Jwt,
    /// Machine identity access token.
    IdentityAccessToken,
    /// SCIM provisioning token.
    ScimToken,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AuthMode::Jwt => "jwt",
            AuthMode::IdentityAccessToken => "identity-access-token",
            AuthMode::ScimToken => "scim-token",
        })
    }
}

/// The authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Actor {
    /// A human user.
    User {
        /// User id.
        id: String,
        /// Email address.
        email: Option<String>,
    },
    /// A machine identity.
    Identity {
        /// Identity id.
        id: String,
        /// Identity name.
        name: String,
    },
    /// A SCIM provisioning client.
    ScimClient {
        /// SCIM token id.
        token_id: String,
    },
}

/// Authenticated request context handed to every handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Who is calling.
    pub actor: Actor,
    /// Organization the credential belongs to.
    pub org_id: String,
    /// How the caller authenticated.
    pub auth_mode: AuthMode,
    /// Credential expiry (Unix seconds).
    pub expires_at: Option<u64>,
}

impl AuthContext {
    /// Id of the user, identity or SCIM token.
    pub fn actor_id(&self) -> &str {
        match &self.actor {
            Actor::User { id, .. } | Actor::Identity { id, .. } => id,
            Actor::ScimClient { token_id } => token_id,
        }
    }

    /// Human-readable name of the actor, for audit records.
    pub fn actor_name(&self) -> Option<&str> {
        match &self.actor {
            Actor::User { email, .. } => email.as_deref(),
            Actor::Identity { name, .. } => Some(name),
            Actor::ScimClient { .. } => None,
        }
    }

    /// Whether the caller is a human user.
    pub fn is_user(&self) -> bool {
        matches!(self.actor, Actor::User { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_accessors() {
        let ctx = AuthContext {
            actor: Actor::Identity {
                id: "id-1".into(),
                name: "ci-runner".into(),
            },
            org_id: "org-1".into(),
            auth_mode: AuthMode::IdentityAccessToken,
            expires_at: None,
        };
        assert_eq!(ctx.actor_id(), "id-1");
        assert_eq!(ctx.actor_name(), Some("ci-runner"));
        assert!(!ctx.is_user());
        assert_eq!(ctx.auth_mode.to_string(), "identity-access-token");
    }
}

//! SCIM token authentication.
//!
//! An organization admin creates SCIM tokens for its identity provider. The
//! plaintext `scim.<id>.<secret>` is shown once; only an Argon2 hash of the
//! secret part is stored.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use coffer_crypto::{hash, random};
use coffer_storage::{Collection, StorageBackend};

use crate::{Actor, AuthBackend, AuthContext, AuthError, AuthMode};

/// Prefix of every SCIM token.
pub const TOKEN_PREFIX: &str = "scim.";

/// A stored SCIM token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScimToken {
    /// Token id.
    pub id: String,
    /// Organization the token provisions into.
    pub org_id: String,
    /// Free-form description.
    pub description: String,
    /// Lifetime in days; 0 never expires.
    pub ttl_days: u64,
    /// Creation time.
    pub created_at: u64,
}

impl ScimToken {
    fn expires_at(&self) -> Option<u64> {
        (self.ttl_days > 0).then(|| self.created_at + self.ttl_days * 86_400)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: ScimToken,
    secret_hash: String,
}

/// Stores SCIM tokens and validates them.
pub struct ScimTokenBackend {
    tokens: Collection<StoredToken>,
}

impl ScimTokenBackend {
    /// Creates the backend on top of `storage`.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            tokens: Collection::new(storage, "scim-tokens"),
        }
    }

    /// Creates a token and returns it with its one-time plaintext.
    pub async fn create_token(
        &self,
        org_id: &str,
        description: &str,
        ttl_days: u64,
    ) -> Result<(ScimToken, String), AuthError> {
        let id = Uuid::new_v4().simple().to_string();
        let secret = random::generate_token(32);

        let token = ScimToken {
            id: id.clone(),
            org_id: org_id.to_string(),
            description: description.to_string(),
            ttl_days,
            created_at: crate::now(),
        };
        let stored = StoredToken {
            token: token.clone(),
            secret_hash: hash::hash_secret(&secret)?,
        };
        self.tokens.insert(&id, &stored).await?;

        info!(org_id = %org_id, token_id = %id, "SCIM token created");
        Ok((token, format!("{}{}.{}", TOKEN_PREFIX, id, secret)))
    }

    /// Lists the SCIM tokens of an organization.
    pub async fn list_tokens(&self, org_id: &str) -> Result<Vec<ScimToken>, AuthError> {
        Ok(self
            .tokens
            .find(|t| t.token.org_id == org_id)
            .await?
            .into_iter()
            .map(|t| t.token)
            .collect())
    }

    /// Deletes a token of `org_id`.
    pub async fn delete_token(&self, org_id: &str, token_id: &str) -> Result<(), AuthError> {
        match self.tokens.get(token_id).await? {
            Some(t) if t.token.org_id == org_id => {
                self.tokens.remove(token_id).await?;
                Ok(())
            },
            _ => Err(AuthError::NotFound(format!("SCIM token '{}'", token_id))),
        }
    }
}

#[async_trait]
impl AuthBackend for ScimTokenBackend {
    fn handles(&self, token: &str) -> bool {
        token.starts_with(TOKEN_PREFIX)
    }

    async fn validate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let (id, secret) = token
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|rest| rest.split_once('.'))
            .ok_or(AuthError::InvalidCredentials)?;

        let stored = self
            .tokens
            .get(id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !hash::verify_secret(secret, &stored.secret_hash)? {
            return Err(AuthError::InvalidCredentials);
        }

        let expires_at = stored.token.expires_at();
        if expires_at.is_some_and(|exp| crate::now() >= exp) {
            return Err(AuthError::TokenExpired);
        }

        Ok(AuthContext {
            actor: Actor::ScimClient {
                token_id: stored.token.id,
            },
            org_id: stored.token.org_id,
            auth_mode: AuthMode::ScimToken,
            expires_at,
        })
    }

    fn name(&self) -> &'static str {
        "scim-token"
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use coffer_storage::MemoryBackend;

    fn backend() -> ScimTokenBackend {
        ScimTokenBackend::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_token_roundtrip() {
        let backend = backend();
        let (token, plaintext) = backend
            .create_token("org-1", "okta", 0)
            .await
            .expect("create");

        assert!(backend.handles(&plaintext));
        let ctx = backend.validate(&plaintext).await.expect("validate");
        assert_eq!(ctx.auth_mode, AuthMode::ScimToken);
        assert_eq!(ctx.org_id, "org-1");
        assert_eq!(ctx.actor_id(), token.id);
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let backend = backend();
        let (token, _) = backend
            .create_token("org-1", "okta", 0)
            .await
            .expect("create");

        let forged = format!("scim.{}.{}", token.id, "0".repeat(64));
        assert!(matches!(
            backend.validate(&forged).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            backend.validate("scim.garbage").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_deleted_token_rejected() {
        let backend = backend();
        let (token, plaintext) = backend
            .create_token("org-1", "okta", 30)
            .await
            .expect("create");

        assert!(backend.delete_token("org-2", &token.id).await.is_err());
        backend
            .delete_token("org-1", &token.id)
            .await
            .expect("delete");
        assert!(backend.validate(&plaintext).await.is_err());
        assert!(backend.list_tokens("org-1").await.expect("list").is_empty());
    }
}

//! Dispatches bearer tokens to the backend that understands them.

use std::sync::Arc;

use tracing::debug;

use crate::{AuthBackend, AuthContext, AuthError, AuthMode};

/// Ordered set of authentication backends.
#[derive(Clone, Default)]
pub struct Authenticator {
    backends: Vec<Arc<dyn AuthBackend>>,
}

impl Authenticator {
    /// Creates an authenticator with no backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backend. Earlier backends are tried first.
    pub fn with_backend(mut self, backend: Arc<dyn AuthBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Validates `token` and checks that its mode is in `allowed`.
    pub async fn authenticate(
        &self,
        token: &str,
        allowed: &[AuthMode],
    ) -> Result<AuthContext, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let backend = self
            .backends
            .iter()
            .find(|b| b.handles(token))
            .ok_or(AuthError::InvalidCredentials)?;

        let ctx = backend.validate(token).await?;
        if !allowed.contains(&ctx.auth_mode) {
            debug!(backend = backend.name(), mode = %ctx.auth_mode, "Auth mode rejected by route");
            return Err(AuthError::MethodNotEnabled(ctx.auth_mode.to_string()));
        }
        Ok(ctx)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{JwtBackend, JwtConfig, ScimTokenBackend};
    use coffer_storage::MemoryBackend;

    async fn setup() -> (Authenticator, String, String) {
        let jwt = Arc::new(
            JwtBackend::new(JwtConfig {
                secret: "test-secret-key-minimum-32-chars!".into(),
                issuer: "https://coffer.local".into(),
                audience: "coffer".into(),
            })
            .unwrap(),
        );
        let scim = Arc::new(ScimTokenBackend::new(Arc::new(MemoryBackend::new())));

        let user_token = jwt
            .issue_user_token("user-1", "a@acme.io", "org-1", 60)
            .unwrap();
        let (_, scim_token) = scim.create_token("org-1", "okta", 0).await.unwrap();

        let auth = Authenticator::new()
            .with_backend(scim)
            .with_backend(jwt);
        (auth, user_token, scim_token)
    }

    #[tokio::test]
    async fn test_dispatch_by_shape() {
        let (auth, user_token, scim_token) = setup().await;

        let ctx = auth
            .authenticate(&user_token, &[AuthMode::Jwt])
            .await
            .unwrap();
        assert!(ctx.is_user());

        let ctx = auth
            .authenticate(&scim_token, &[AuthMode::ScimToken])
            .await
            .unwrap();
        assert_eq!(ctx.auth_mode, AuthMode::ScimToken);
    }

    #[tokio::test]
    async fn test_mode_not_allowed() {
        let (auth, user_token, scim_token) = setup().await;

        assert!(matches!(
            auth.authenticate(&scim_token, &[AuthMode::Jwt, AuthMode::IdentityAccessToken])
                .await,
            Err(AuthError::MethodNotEnabled(_))
        ));
        assert!(matches!(
            auth.authenticate(&user_token, &[AuthMode::ScimToken]).await,
            Err(AuthError::MethodNotEnabled(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_and_garbage() {
        let (auth, _, _) = setup().await;
        assert!(matches!(
            auth.authenticate("  ", &[AuthMode::Jwt]).await,
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            auth.authenticate("not-a-token", &[AuthMode::Jwt]).await,
            Err(AuthError::InvalidCredentials)
        ));
    }
}

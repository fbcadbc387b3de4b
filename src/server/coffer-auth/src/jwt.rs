//! JWT authentication backend.
//!
//! Issues and validates HS256 tokens for users and for machine identities.
//! The two kinds share the signing key and are told apart by the `kind` claim.

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Actor, AuthBackend, AuthContext, AuthError, AuthMode};

/// Configuration for [`JwtBackend`].
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HS256 signing secret. At least 32 bytes.
    pub secret: String,
    /// `iss` claim.
    pub issuer: String,
    /// `aud` claim.
    pub audience: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TokenKind {
    User,
    Identity,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User or identity id.
    sub: String,
    kind: TokenKind,
    /// Organization id.
    org: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    iat: u64,
    exp: u64,
    iss: String,
    aud: String,
    jti: String,
}

/// Signs and validates Coffer JWTs.
pub struct JwtBackend {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
}

impl JwtBackend {
    /// Creates a backend. Rejects secrets shorter than 32 bytes.
    pub fn new(config: JwtConfig) -> Result<Self, AuthError> {
        if config.secret.len() < 32 {
            return Err(AuthError::Configuration(
                "JWT secret must be at least 32 bytes".into(),
            ));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.audience]);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer,
            audience: config.audience,
        })
    }

    fn sign(
        &self,
        sub: &str,
        kind: TokenKind,
        org_id: &str,
        email: Option<&str>,
        name: Option<&str>,
        ttl_secs: u64,
    ) -> Result<String, AuthError> {
        let now = crate::now();
        let claims = Claims {
            sub: sub.to_string(),
            kind,
            org: org_id.to_string(),
            email: email.map(str::to_string),
            name: name.map(str::to_string),
            iat: now,
            exp: now + ttl_secs,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4().to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Crypto(e.to_string()))
    }

    /// Issues a user token valid for `ttl_secs`.
    pub fn issue_user_token(
        &self,
        user_id: &str,
        email: &str,
        org_id: &str,
        ttl_secs: u64,
    ) -> Result<String, AuthError> {
        self.sign(user_id, TokenKind::User, org_id, Some(email), None, ttl_secs)
    }

    /// Issues an identity access token valid for `ttl_secs`.
    pub fn issue_identity_token(
        &self,
        identity_id: &str,
        name: &str,
        org_id: &str,
        ttl_secs: u64,
    ) -> Result<String, AuthError> {
        self.sign(
            identity_id,
            TokenKind::Identity,
            org_id,
            None,
            Some(name),
            ttl_secs,
        )
    }
}

#[async_trait]
impl AuthBackend for JwtBackend {
    fn handles(&self, token: &str) -> bool {
        token.split('.').count() == 3 && !token.starts_with(crate::scim::TOKEN_PREFIX)
    }

    async fn validate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidCredentials,
            },
        )?;
        let claims = data.claims;

        let (actor, auth_mode) = match claims.kind {
            TokenKind::User => (
                Actor::User {
                    id: claims.sub,
                    email: claims.email,
                },
                AuthMode::Jwt,
            ),
            TokenKind::Identity => (
                Actor::Identity {
                    id: claims.sub,
                    name: claims.name.unwrap_or_default(),
                },
                AuthMode::IdentityAccessToken,
            ),
        };

        Ok(AuthContext {
            actor,
            org_id: claims.org,
            auth_mode,
            expires_at: Some(claims.exp),
        })
    }

    fn name(&self) -> &'static str {
        "jwt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret-key-minimum-32-chars!".to_string(),
            issuer: "https://coffer.local".to_string(),
            audience: "coffer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_user_token() {
        let backend = JwtBackend::new(config()).expect("backend");
        let token = backend
            .issue_user_token("user-1", "alice@acme.io", "org-1", 3600)
            .expect("token");

        let ctx = backend.validate(&token).await.expect("validation failed");
        assert_eq!(ctx.auth_mode, AuthMode::Jwt);
        assert_eq!(ctx.org_id, "org-1");
        assert_eq!(
            ctx.actor,
            Actor::User {
                id: "user-1".into(),
                email: Some("alice@acme.io".into())
            }
        );
    }

    #[tokio::test]
    async fn test_identity_token() {
        let backend = JwtBackend::new(config()).expect("backend");
        let token = backend
            .issue_identity_token("id-1", "ci", "org-1", 60)
            .expect("token");

        let ctx = backend.validate(&token).await.expect("validation failed");
        assert_eq!(ctx.auth_mode, AuthMode::IdentityAccessToken);
        assert_eq!(ctx.actor_id(), "id-1");
    }

    #[tokio::test]
    async fn test_expired_token() {
        let backend = JwtBackend::new(config()).expect("backend");
        let now = crate::now();
        let claims = Claims {
            sub: "user-1".into(),
            kind: TokenKind::User,
            org: "org-1".into(),
            email: None,
            name: None,
            iat: now - 7200,
            exp: now - 3600,
            iss: "https://coffer.local".into(),
            aud: "coffer".into(),
            jti: "j".into(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config().secret.as_bytes()),
        )
        .expect("failed to encode JWT");

        let result = backend.validate(&token).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_wrong_secret_or_issuer() {
        let backend = JwtBackend::new(config()).expect("backend");

        let mut other = config();
        other.secret = "different-secret-key-minimum-32!!".into();
        let forged = JwtBackend::new(other)
            .expect("backend")
            .issue_user_token("user-1", "a@b.c", "org-1", 60)
            .expect("token");
        assert!(matches!(
            backend.validate(&forged).await,
            Err(AuthError::InvalidCredentials)
        ));

        let mut other = config();
        other.issuer = "https://evil.example".into();
        let foreign = JwtBackend::new(other)
            .expect("backend")
            .issue_user_token("user-1", "a@b.c", "org-1", 60)
            .expect("token");
        assert!(matches!(
            backend.validate(&foreign).await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut cfg = config();
        cfg.secret = "short".into();
        assert!(matches!(
            JwtBackend::new(cfg),
            Err(AuthError::Configuration(_))
        ));
    }
}

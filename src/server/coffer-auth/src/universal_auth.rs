//! Universal auth: machine identities logging in with a client id and secret.
//!
//! The client id is the identity id. Client secrets are stored as Argon2 hashes
//! next to a short plaintext prefix used to skip hopeless comparisons. A
//! successful login returns an identity access token signed by the
//! [`JwtBackend`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use coffer_crypto::{hash, random};
use coffer_storage::{Collection, StorageBackend};

use crate::{AuthError, JwtBackend};

const PREFIX_LEN: usize = 4;

/// Default lifetime of an identity access token (2 hours).
pub const DEFAULT_ACCESS_TOKEN_TTL: u64 = 7200;

/// A machine identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Identity id, also the universal auth client id.
    pub id: String,
    /// Owning organization.
    pub org_id: String,
    /// Display name.
    pub name: String,
    /// Organization role (`admin` or `member`).
    pub org_role: String,
    /// Lifetime of access tokens issued at login, in seconds.
    pub access_token_ttl: u64,
    /// Creation time.
    pub created_at: u64,
}

/// A universal auth client secret, without its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSecret {
    /// Client secret id.
    pub id: String,
    /// Identity the secret belongs to.
    pub identity_id: String,
    /// Free-form description.
    pub description: String,
    /// First characters of the plaintext.
    pub prefix: String,
    /// Lifetime in seconds; 0 never expires.
    pub ttl: u64,
    /// Successful logins so far.
    pub num_uses: u64,
    /// Maximum logins; 0 is unlimited.
    pub num_uses_limit: u64,
    /// Whether the secret was revoked.
    pub revoked: bool,
    /// Creation time.
    pub created_at: u64,
}

impl ClientSecret {
    fn is_expired(&self, now: u64) -> bool {
        self.ttl > 0 && now >= self.created_at + self.ttl
    }

    fn is_exhausted(&self) -> bool {
        self.num_uses_limit > 0 && self.num_uses >= self.num_uses_limit
    }
}

#[derive(Serialize, Deserialize)]
struct StoredSecret {
    secret: ClientSecret,
    hash: String,
}

/// Response of a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    /// Identity access token.
    pub access_token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
    /// Always `Bearer`.
    pub token_type: String,
}

/// Identity and client secret store with the login flow.
pub struct UniversalAuth {
    identities: Collection<Identity>,
    secrets: Collection<StoredSecret>,
    jwt: Arc<JwtBackend>,
    // serializes use-count updates
    login_lock: Mutex<()>,
}

impl UniversalAuth {
    /// Creates the store on top of `storage`, issuing tokens with `jwt`.
    pub fn new(storage: Arc<dyn StorageBackend>, jwt: Arc<JwtBackend>) -> Self {
        Self {
            identities: Collection::new(Arc::clone(&storage), "identities"),
            secrets: Collection::new(storage, "client-secrets"),
            jwt,
            login_lock: Mutex::new(()),
        }
    }

    /// Creates an identity in `org_id`.
    pub async fn create_identity(
        &self,
        org_id: &str,
        name: &str,
        org_role: &str,
        access_token_ttl: Option<u64>,
    ) -> Result<Identity, AuthError> {
        if name.trim().is_empty() {
            return Err(AuthError::Invalid("identity name must not be empty".into()));
        }
        if !matches!(org_role, "admin" | "member") {
            return Err(AuthError::Invalid(format!("unknown org role '{}'", org_role)));
        }

        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            name: name.trim().to_string(),
            org_role: org_role.to_string(),
            access_token_ttl: access_token_ttl.unwrap_or(DEFAULT_ACCESS_TOKEN_TTL),
            created_at: crate::now(),
        };
        self.identities.insert(&identity.id, &identity).await?;

        info!(org_id = %org_id, identity_id = %identity.id, "Identity created");
        Ok(identity)
    }

    /// Loads an identity.
    pub async fn get_identity(&self, identity_id: &str) -> Result<Identity, AuthError> {
        self.identities
            .get(identity_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("identity '{}'", identity_id)))
    }

    /// Lists the identities of an organization.
    pub async fn list_identities(&self, org_id: &str) -> Result<Vec<Identity>, AuthError> {
        Ok(self.identities.find(|i| i.org_id == org_id).await?)
    }

    /// Creates a client secret and returns it with its one-time plaintext.
    pub async fn create_client_secret(
        &self,
        identity_id: &str,
        description: &str,
        ttl: u64,
        num_uses_limit: u64,
    ) -> Result<(ClientSecret, String), AuthError> {
        self.get_identity(identity_id).await?;

        let plaintext = random::generate_token(32);
        let secret = ClientSecret {
            id: Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            description: description.to_string(),
            prefix: plaintext[..PREFIX_LEN].to_string(),
            ttl,
            num_uses: 0,
            num_uses_limit,
            revoked: false,
            created_at: crate::now(),
        };
        let stored = StoredSecret {
            secret: secret.clone(),
            hash: hash::hash_secret(&plaintext)?,
        };
        self.secrets
            .insert(&format!("{}/{}", identity_id, secret.id), &stored)
            .await?;

        info!(identity_id = %identity_id, client_secret_id = %secret.id, "Client secret created");
        Ok((secret, plaintext))
    }

    /// Lists the client secrets of an identity.
    pub async fn list_client_secrets(
        &self,
        identity_id: &str,
    ) -> Result<Vec<ClientSecret>, AuthError> {
        Ok(self
            .secrets
            .under(&format!("{}/", identity_id))
            .await?
            .into_iter()
            .map(|s| s.secret)
            .collect())
    }

    /// Revokes a client secret.
    pub async fn revoke_client_secret(
        &self,
        identity_id: &str,
        secret_id: &str,
    ) -> Result<ClientSecret, AuthError> {
        let key = format!("{}/{}", identity_id, secret_id);
        let mut stored = self
            .secrets
            .get(&key)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("client secret '{}'", secret_id)))?;

        stored.secret.revoked = true;
        self.secrets.put(&key, &stored).await?;

        info!(identity_id = %identity_id, client_secret_id = %secret_id, "Client secret revoked");
        Ok(stored.secret)
    }

    /// Exchanges a client id and secret for an identity access token.
    pub async fn login(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(Identity, LoginResult), AuthError> {
        let identity = self
            .identities
            .get(client_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let _guard = self.login_lock.lock().await;

        let candidates = self.secrets.under(&format!("{}/", identity.id)).await?;
        let mut matched = None;
        for stored in candidates {
            if stored.secret.revoked || !client_secret.starts_with(&stored.secret.prefix) {
                continue;
            }
            if hash::verify_secret(client_secret, &stored.hash)? {
                matched = Some(stored);
                break;
            }
        }
        let Some(mut stored) = matched else {
            debug!(client_id = %client_id, "No client secret matched");
            return Err(AuthError::InvalidCredentials);
        };

        if stored.secret.is_expired(crate::now()) {
            return Err(AuthError::TokenExpired);
        }
        if stored.secret.is_exhausted() {
            return Err(AuthError::InvalidCredentials);
        }

        stored.secret.num_uses += 1;
        self.secrets
            .put(&format!("{}/{}", identity.id, stored.secret.id), &stored)
            .await?;

        let access_token = self.jwt.issue_identity_token(
            &identity.id,
            &identity.name,
            &identity.org_id,
            identity.access_token_ttl,
        )?;

        info!(identity_id = %identity.id, "Identity logged in with universal auth");
        let result = LoginResult {
            access_token,
            expires_in: identity.access_token_ttl,
            token_type: "Bearer".to_string(),
        };
        Ok((identity, result))
    }
}

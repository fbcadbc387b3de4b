//! Credential providers.
//!
//! A provider turns stored inputs into live credentials and takes them back.
//! Providers are stateless; the inputs are decrypted for each call.

pub mod sql;
pub mod totp;

use async_trait::async_trait;
use serde_json::Value;

use crate::DynamicError;

pub use sql::SqlDatabaseProvider;
pub use totp::TotpProvider;

/// What a provider needs to issue credentials.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    /// Username rendered from the configuration's template.
    pub username: String,
    /// Expiry of the lease (Unix seconds).
    pub expire_at: u64,
}

/// Credentials issued by a provider.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    /// Provider-side id used to renew and revoke.
    pub entity_id: String,
    /// Data returned to the caller once.
    pub data: Value,
}

/// A source of short-lived credentials.
#[async_trait]
pub trait DynamicProvider: Send + Sync {
    /// Checks and normalizes the inputs of a configuration.
    fn validate_inputs(&self, inputs: Value) -> Result<Value, DynamicError>;

    /// Checks that the target system is reachable with `inputs`.
    async fn validate_connection(&self, inputs: &Value) -> Result<(), DynamicError>;

    /// Issues credentials.
    async fn create(
        &self,
        inputs: &Value,
        request: &LeaseRequest,
    ) -> Result<IssuedCredentials, DynamicError>;

    /// Extends credentials to `expire_at`. Returns the entity id.
    async fn renew(
        &self,
        inputs: &Value,
        entity_id: &str,
        expire_at: u64,
    ) -> Result<String, DynamicError>;

    /// Revokes credentials. Returns the entity id.
    async fn revoke(&self, inputs: &Value, entity_id: &str) -> Result<String, DynamicError>;
}

/// Parses provider inputs into their typed form.
pub(crate) fn parse_inputs<T: serde::de::DeserializeOwned>(inputs: &Value) -> Result<T, DynamicError> {
    serde_json::from_value(inputs.clone())
        .map_err(|e| DynamicError::Invalid(format!("invalid provider inputs: {}", e)))
}

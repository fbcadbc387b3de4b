//! Dynamic secret configurations and leases.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use coffer_crypto::Sealed;

/// A dynamic secret configuration. Provider inputs are kept sealed apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecret {
    /// Id.
    pub id: String,
    /// Project.
    pub project_id: String,
    /// Environment slug.
    pub environment: String,
    /// Folder path.
    pub secret_path: String,
    /// Name, unique in the folder.
    pub name: String,
    /// Provider type, e.g. `sql-database`.
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Default lease TTL in seconds.
    pub default_ttl: u64,
    /// Maximum lease lifetime in seconds.
    pub max_ttl: Option<u64>,
    /// Template for generated usernames.
    pub username_template: Option<String>,
    /// Free-form labels.
    pub metadata: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: u64,
    /// Last update time.
    pub updated_at: u64,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct StoredDynamicSecret {
    pub(crate) config: DynamicSecret,
    pub(crate) inputs: Sealed,
}

/// Fields for a new dynamic secret.
#[derive(Debug, Clone)]
pub struct NewDynamicSecret {
    /// Environment slug.
    pub environment: String,
    /// Folder path.
    pub secret_path: String,
    /// Name.
    pub name: String,
    /// Provider type.
    pub provider_type: String,
    /// Provider inputs.
    pub inputs: serde_json::Value,
    /// Default TTL, e.g. `"1h"`.
    pub default_ttl: String,
    /// Maximum TTL.
    pub max_ttl: Option<String>,
    /// Username template.
    pub username_template: Option<String>,
    /// Labels.
    pub metadata: BTreeMap<String, String>,
}

/// Partial update of a dynamic secret.
#[derive(Debug, Clone, Default)]
pub struct DynamicSecretUpdate {
    /// Rename.
    pub new_name: Option<String>,
    /// Inputs merged over the stored ones.
    pub inputs: Option<serde_json::Value>,
    /// New default TTL.
    pub default_ttl: Option<String>,
    /// New maximum TTL.
    pub max_ttl: Option<String>,
    /// New username template.
    pub username_template: Option<String>,
    /// Replacement labels.
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseStatus {
    /// Credentials are live.
    Active,
    /// The provider failed to revoke the credentials.
    FailedDeletion,
}

/// An issued set of credentials with an expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Lease id.
    pub id: String,
    /// Dynamic secret the lease was issued from.
    pub dynamic_secret_id: String,
    /// Project.
    pub project_id: String,
    /// Provider-side id of the credentials, e.g. the database username.
    pub external_entity_id: String,
    /// Expiry (Unix seconds).
    pub expire_at: u64,
    /// Incremented on every renewal.
    pub version: u32,
    /// Status.
    pub status: LeaseStatus,
    /// Last provider error.
    pub status_details: Option<String>,
    /// Creation time.
    pub created_at: u64,
}

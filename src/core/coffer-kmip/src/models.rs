//! KMIP clients and managed objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use coffer_crypto::Sealed;

use crate::KmipError;

/// Operations a KMIP client may be allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KmipPermission {
    /// Create a new symmetric key.
    Create,
    /// Read key material.
    Get,
    /// Read object attributes.
    GetAttributes,
    /// Move an object to the active state.
    Activate,
    /// Deactivate an object.
    Revoke,
    /// Destroy key material.
    Destroy,
    /// List objects.
    Locate,
    /// Import existing key material.
    Register,
}

impl KmipPermission {
    /// Every permission, in declaration order.
    pub const ALL: [KmipPermission; 8] = [
        KmipPermission::Create,
        KmipPermission::Get,
        KmipPermission::GetAttributes,
        KmipPermission::Activate,
        KmipPermission::Revoke,
        KmipPermission::Destroy,
        KmipPermission::Locate,
        KmipPermission::Register,
    ];

    /// Kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            KmipPermission::Create => "create",
            KmipPermission::Get => "get",
            KmipPermission::GetAttributes => "get-attributes",
            KmipPermission::Activate => "activate",
            KmipPermission::Revoke => "revoke",
            KmipPermission::Destroy => "destroy",
            KmipPermission::Locate => "locate",
            KmipPermission::Register => "register",
        }
    }
}

impl fmt::Display for KmipPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KmipPermission {
    type Err = KmipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| KmipError::Invalid(format!("unknown KMIP operation '{}'", s)))
    }
}

/// A KMIP client registered in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmipClient {
    /// Id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Name, unique in the project.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Allowed operations.
    pub permissions: Vec<KmipPermission>,
    /// Creation time.
    pub created_at: u64,
    /// Last update time.
    pub updated_at: u64,
}

impl KmipClient {
    /// Whether the client may perform `permission`.
    pub fn can(&self, permission: KmipPermission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Fields for a new client.
#[derive(Debug, Clone, Default)]
pub struct NewKmipClient {
    /// Name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Allowed operations.
    pub permissions: Vec<KmipPermission>,
}

/// Partial update of a client.
#[derive(Debug, Clone, Default)]
pub struct KmipClientUpdate {
    /// New name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// Replacement permissions.
    pub permissions: Option<Vec<KmipPermission>>,
}

/// Sort direction for listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    /// A to Z.
    #[default]
    Asc,
    /// Z to A.
    Desc,
}

/// Paging and search for [`crate::KmipEngine::list_clients`].
#[derive(Debug, Clone)]
pub struct ClientListOptions {
    /// Case-insensitive substring of the name.
    pub search: Option<String>,
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows.
    pub limit: usize,
    /// Order by name.
    pub order: OrderDirection,
}

impl Default for ClientListOptions {
    fn default() -> Self {
        Self {
            search: None,
            offset: 0,
            limit: 100,
            order: OrderDirection::Asc,
        }
    }
}

/// Lifecycle state of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectState {
    /// Created, not yet usable.
    PreActive,
    /// Usable.
    Active,
    /// Revoked; material still readable.
    Deactivated,
    /// Material erased.
    Destroyed,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectState::PreActive => "pre-active",
            ObjectState::Active => "active",
            ObjectState::Deactivated => "deactivated",
            ObjectState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Symmetric algorithms for managed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymmetricAlgorithm {
    /// AES-128 in GCM mode.
    Aes128Gcm,
    /// AES-256 in GCM mode.
    Aes256Gcm,
}

impl SymmetricAlgorithm {
    /// Key length in bits.
    pub fn key_bits(&self) -> u32 {
        match self {
            SymmetricAlgorithm::Aes128Gcm => 128,
            SymmetricAlgorithm::Aes256Gcm => 256,
        }
    }
}

/// Attributes of a managed object. Key material is never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedObject {
    /// Unique identifier.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Optional name.
    pub name: Option<String>,
    /// Algorithm.
    pub algorithm: SymmetricAlgorithm,
    /// Key length in bits.
    pub length: u32,
    /// Lifecycle state.
    pub state: ObjectState,
    /// Client that created or registered the object.
    pub created_by: String,
    /// Creation time.
    pub created_at: u64,
    /// Activation time.
    pub activated_at: Option<u64>,
    /// Deactivation time.
    pub deactivated_at: Option<u64>,
    /// Reason given on revocation.
    pub revocation_reason: Option<String>,
    /// Destruction time.
    pub destroyed_at: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct StoredObject {
    pub(crate) object: ManagedObject,
    pub(crate) material: Option<Sealed>,
}

/// Key material returned by a `get` operation, base64 encoded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMaterial {
    /// Object attributes.
    #[serde(flatten)]
    pub object: ManagedObject,
    /// Base64 key bytes.
    pub value: String,
}

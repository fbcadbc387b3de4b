//! SSH CAs, certificate templates and signing requests.

use serde::{Deserialize, Serialize};

use coffer_crypto::Sealed;

/// Status shared by CAs and templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshStatus {
    /// Usable for signing.
    #[default]
    Active,
    /// Signing is refused.
    Disabled,
}

/// An SSH certificate authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCa {
    /// Id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Display name.
    pub friendly_name: String,
    /// Key algorithm, always `ed25519`.
    pub key_algorithm: String,
    /// CA public key as an `authorized_keys` line.
    pub public_key: String,
    /// Status.
    pub status: SshStatus,
    /// Creation time.
    pub created_at: u64,
    /// Last update time.
    pub updated_at: u64,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct StoredCa {
    pub(crate) ca: SshCa,
    pub(crate) private_key: Sealed,
}

/// Fields for a new CA.
#[derive(Debug, Clone, Default)]
pub struct NewSshCa {
    /// Display name.
    pub friendly_name: String,
    /// Existing OpenSSH private key; a key is generated when absent.
    pub private_key: Option<String>,
}

/// Partial update of a CA.
#[derive(Debug, Clone, Default)]
pub struct SshCaUpdate {
    /// New display name.
    pub friendly_name: Option<String>,
    /// New status.
    pub status: Option<SshStatus>,
}

/// Rules for certificates signed by a CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCertTemplate {
    /// Id.
    pub id: String,
    /// Signing CA.
    pub ca_id: String,
    /// Owning project.
    pub project_id: String,
    /// Name, unique in the project.
    pub name: String,
    /// Default certificate lifetime in seconds.
    pub ttl: u64,
    /// Maximum certificate lifetime in seconds.
    pub max_ttl: u64,
    /// Allowed user principals; `*` allows any.
    pub allowed_users: Vec<String>,
    /// Allowed host principals; `*` allows any, `*.example.com` any subdomain.
    pub allowed_hosts: Vec<String>,
    /// Whether user certificates may be issued.
    pub allow_user_certificates: bool,
    /// Whether host certificates may be issued.
    pub allow_host_certificates: bool,
    /// Whether the caller may choose the key id.
    pub allow_custom_key_ids: bool,
    /// Status.
    pub status: SshStatus,
    /// Creation time.
    pub created_at: u64,
    /// Last update time.
    pub updated_at: u64,
}

/// Fields for a new template.
#[derive(Debug, Clone, Default)]
pub struct NewSshCertTemplate {
    /// Signing CA.
    pub ca_id: String,
    /// Name.
    pub name: String,
    /// Default TTL, e.g. `"1h"`.
    pub ttl: String,
    /// Maximum TTL.
    pub max_ttl: String,
    /// Allowed user principals.
    pub allowed_users: Vec<String>,
    /// Allowed host principals.
    pub allowed_hosts: Vec<String>,
    /// Allow user certificates.
    pub allow_user_certificates: bool,
    /// Allow host certificates.
    pub allow_host_certificates: bool,
    /// Allow custom key ids.
    pub allow_custom_key_ids: bool,
}

/// Partial update of a template.
#[derive(Debug, Clone, Default)]
pub struct SshCertTemplateUpdate {
    /// New name.
    pub name: Option<String>,
    /// New default TTL.
    pub ttl: Option<String>,
    /// New maximum TTL.
    pub max_ttl: Option<String>,
    /// Replacement user principals.
    pub allowed_users: Option<Vec<String>>,
    /// Replacement host principals.
    pub allowed_hosts: Option<Vec<String>>,
    /// Allow user certificates.
    pub allow_user_certificates: Option<bool>,
    /// Allow host certificates.
    pub allow_host_certificates: Option<bool>,
    /// Allow custom key ids.
    pub allow_custom_key_ids: Option<bool>,
    /// New status.
    pub status: Option<SshStatus>,
}

/// Certificate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshCertType {
    /// Authenticates a user to hosts.
    User,
    /// Authenticates a host to users.
    Host,
}

/// A request to sign an existing public key.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// Template to sign under.
    pub template_id: String,
    /// `ssh-ed25519 AAAA...` public key.
    pub public_key: String,
    /// Certificate type.
    pub cert_type: SshCertType,
    /// Requested principals.
    pub principals: Vec<String>,
    /// Requested TTL; the template default when absent.
    pub ttl: Option<String>,
    /// Requested key id; only honoured when the template allows it.
    pub key_id: Option<String>,
}

/// A request for a fresh key pair signed under a template.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Template to sign under.
    pub template_id: String,
    /// Certificate type.
    pub cert_type: SshCertType,
    /// Requested principals.
    pub principals: Vec<String>,
    /// Requested TTL.
    pub ttl: Option<String>,
    /// Requested key id.
    pub key_id: Option<String>,
}

/// A signed certificate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedCertificate {
    /// Serial number, decimal.
    pub serial_number: String,
    /// Certificate line for `*-cert.pub`.
    pub signed_key: String,
    /// Key id embedded in the certificate.
    pub key_id: String,
    /// Principals embedded in the certificate.
    pub principals: Vec<String>,
    /// Certificate type.
    pub cert_type: SshCertType,
    /// Lifetime in seconds.
    pub ttl: u64,
    /// Start of validity.
    pub valid_after: u64,
    /// End of validity.
    pub valid_before: u64,
}

/// A generated key pair and its certificate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredentials {
    /// OpenSSH private key.
    pub private_key: String,
    /// Public key line.
    pub public_key: String,
    /// Certificate.
    #[serde(flatten)]
    pub certificate: SignedCertificate,
}

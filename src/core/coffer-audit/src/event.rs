//! Audit event model.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::AuditError;

macro_rules! event_types {
    ($($variant:ident => $name:literal,)+) => {
        /// Kind of audited operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EventType {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl EventType {
            /// Every event type.
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            /// Wire name of the event type.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventType::$variant => $name,)+
                }
            }
        }
    };
}

event_types! {
    // identities and auth
    LoginIdentityUniversalAuth => "login-identity-universal-auth",
    CreateIdentity => "create-identity",
    CreateIdentityUniversalAuthClientSecret => "create-identity-universal-auth-client-secret",
    RevokeIdentityUniversalAuthClientSecret => "revoke-identity-universal-auth-client-secret",
    CreateScimToken => "create-scim-token",
    DeleteScimToken => "delete-scim-token",
    ScimProvisionUser => "scim-provision-user",
    ScimUpdateUser => "scim-update-user",
    ScimDeprovisionUser => "scim-deprovision-user",
    // projects
    GetProject => "get-project",
    CreateProject => "create-project",
    AddProjectMember => "add-project-member",
    RemoveProjectMember => "remove-project-member",
    CreateEnvironment => "create-environment",
    CreateFolder => "create-folder",
    DeleteFolder => "delete-folder",
    // secrets
    GetSecrets => "get-secrets",
    GetSecret => "get-secret",
    CreateSecret => "create-secret",
    UpdateSecret => "update-secret",
    DeleteSecret => "delete-secret",
    // approvals
    CreateAccessApprovalPolicy => "create-access-approval-policy",
    UpdateAccessApprovalPolicy => "update-access-approval-policy",
    DeleteAccessApprovalPolicy => "delete-access-approval-policy",
    CreateAccessRequest => "create-access-request",
    ReviewAccessRequest => "review-access-request",
    CreateSecretApprovalPolicy => "create-secret-approval-policy",
    UpdateSecretApprovalPolicy => "update-secret-approval-policy",
    DeleteSecretApprovalPolicy => "delete-secret-approval-policy",
    SecretApprovalRequest => "secret-approval-request",
    SecretApprovalReviewed => "secret-approval-reviewed",
    SecretApprovalClosed => "secret-approval-closed",
    SecretApprovalReopened => "secret-approval-reopened",
    SecretApprovalMerged => "secret-approval-merged",
    // dynamic secrets
    CreateDynamicSecret => "create-dynamic-secret",
    UpdateDynamicSecret => "update-dynamic-secret",
    DeleteDynamicSecret => "delete-dynamic-secret",
    GetDynamicSecret => "get-dynamic-secret",
    ListDynamicSecrets => "list-dynamic-secrets",
    CreateDynamicSecretLease => "create-dynamic-secret-lease",
    RenewDynamicSecretLease => "renew-dynamic-secret-lease",
    DeleteDynamicSecretLease => "delete-dynamic-secret-lease",
    // kmip
    CreateKmipClient => "create-kmip-client",
    UpdateKmipClient => "update-kmip-client",
    DeleteKmipClient => "delete-kmip-client",
    GetKmipClient => "get-kmip-client",
    GetKmipClients => "get-kmip-clients",
    KmipOperationCreate => "kmip-operation-create",
    KmipOperationRegister => "kmip-operation-register",
    KmipOperationGet => "kmip-operation-get",
    KmipOperationGetAttributes => "kmip-operation-get-attributes",
    KmipOperationActivate => "kmip-operation-activate",
    KmipOperationRevoke => "kmip-operation-revoke",
    KmipOperationDestroy => "kmip-operation-destroy",
    KmipOperationLocate => "kmip-operation-locate",
    // ssh
    CreateSshCa => "create-ssh-ca",
    GetSshCa => "get-ssh-ca",
    UpdateSshCa => "update-ssh-ca",
    DeleteSshCa => "delete-ssh-ca",
    CreateSshCertificateTemplate => "create-ssh-certificate-template",
    GetSshCertificateTemplate => "get-ssh-certificate-template",
    UpdateSshCertificateTemplate => "update-ssh-certificate-template",
    DeleteSshCertificateTemplate => "delete-ssh-certificate-template",
    SignSshKey => "sign-ssh-key",
    IssueSshCreds => "issue-ssh-creds",
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| AuditError::UnknownEventType(s.to_string()))
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of actor behind an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActorType {
    /// Human user with a JWT.
    User,
    /// Machine identity.
    Identity,
    /// SCIM provisioning client.
    ScimClient,
    /// KMIP client acting through an identity.
    KmipClient,
    /// The platform itself (background jobs).
    Platform,
    /// Unauthenticated caller, e.g. a failed login.
    UnknownUser,
}

/// Who performed an audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditActor {
    /// Actor kind.
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    /// Actor id, when known.
    pub id: Option<String>,
    /// Email, identity name or client name.
    pub name: Option<String>,
}

impl AuditActor {
    /// The platform actor used by background jobs.
    pub fn platform() -> Self {
        Self {
            actor_type: ActorType::Platform,
            id: None,
            name: None,
        }
    }
}

/// Client software classification derived from the User-Agent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserAgentType {
    /// Browser.
    Web,
    /// The `coffer` CLI.
    Cli,
    /// Terraform provider.
    Terraform,
    /// Kubernetes operator.
    K8sOperator,
    /// Anything else.
    Other,
}

impl UserAgentType {
    /// Classifies a User-Agent header value.
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent.map(str::to_ascii_lowercase) else {
            return UserAgentType::Other;
        };
        if ua.starts_with("coffer-cli") {
            UserAgentType::Cli
        } else if ua.contains("terraform") {
            UserAgentType::Terraform
        } else if ua.contains("k8-operator") || ua.contains("k8s-operator") {
            UserAgentType::K8sOperator
        } else if ua.starts_with("mozilla/") {
            UserAgentType::Web
        } else {
            UserAgentType::Other
        }
    }
}

/// Request information captured with each event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    /// Client IP address.
    pub ip_address: Option<String>,
    /// Raw User-Agent header.
    pub user_agent: Option<String>,
}

/// A recorded audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Event id.
    pub id: String,
    /// Organization scope.
    pub org_id: String,
    /// Project scope, when the operation is project-bound.
    pub project_id: Option<String>,
    /// Actor.
    pub actor: AuditActor,
    /// Operation.
    pub event_type: EventType,
    /// Operation-specific details. Never contains secret values.
    pub metadata: serde_json::Value,
    /// Client IP.
    pub ip_address: Option<String>,
    /// Raw User-Agent.
    pub user_agent: Option<String>,
    /// Classified User-Agent.
    pub user_agent_type: UserAgentType,
    /// Time of the event (Unix seconds).
    pub created_at: u64,
}

/// Filter for [`crate::AuditLog::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only events of this project.
    pub project_id: Option<String>,
    /// Only these event types; empty means all.
    pub event_types: Vec<EventType>,
    /// Only events by this actor id.
    pub actor_id: Option<String>,
    /// Only events at or after this time.
    pub start: Option<u64>,
    /// Only events before this time.
    pub end: Option<u64>,
    /// Events to skip.
    pub offset: usize,
    /// Maximum events to return.
    pub limit: usize,
}

impl AuditFilter {
    pub(crate) fn matches(&self, event: &AuditEvent) -> bool {
        self.project_id
            .as_ref()
            .map_or(true, |p| event.project_id.as_ref() == Some(p))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self
                .actor_id
                .as_ref()
                .map_or(true, |a| event.actor.id.as_ref() == Some(a))
            && self.start.map_or(true, |s| event.created_at >= s)
            && self.end.map_or(true, |e| event.created_at < e)
    }
}

//! Policies, requests and reviews.

use serde::{Deserialize, Serialize};

use coffer_crypto::Sealed;
use coffer_projects::Action;

/// What a policy gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Granting extra access to secrets.
    Access,
    /// Writing secrets.
    Change,
}

/// How strictly a change policy is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Enforcement {
    /// Approvals are always required.
    #[default]
    Hard,
    /// A project admin may merge without approvals by giving a reason.
    Soft,
}

/// An approval policy: N of the listed approvers must approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPolicy {
    /// Policy id.
    pub id: String,
    /// Project.
    pub project_id: String,
    /// Access or change.
    pub kind: PolicyKind,
    /// Name, unique per project and kind.
    pub name: String,
    /// Environment slug.
    pub environment: String,
    /// Folder glob the policy applies to.
    pub secret_path: String,
    /// Required approvals.
    pub approvals: u32,
    /// User ids allowed to approve.
    pub approvers: Vec<String>,
    /// Enforcement level.
    pub enforcement: Enforcement,
    /// Creation time.
    pub created_at: u64,
    /// Last update time.
    pub updated_at: u64,
}

/// Fields for a new policy.
#[derive(Debug, Clone)]
pub struct NewPolicy {
    /// Access or change.
    pub kind: PolicyKind,
    /// Name.
    pub name: String,
    /// Environment slug.
    pub environment: String,
    /// Folder glob.
    pub secret_path: String,
    /// Required approvals.
    pub approvals: u32,
    /// Approver user ids.
    pub approvers: Vec<String>,
    /// Enforcement level.
    pub enforcement: Enforcement,
}

/// Partial update of a policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    /// New name.
    pub name: Option<String>,
    /// New folder glob.
    pub secret_path: Option<String>,
    /// New approval count.
    pub approvals: Option<u32>,
    /// New approvers.
    pub approvers: Option<Vec<String>>,
    /// New enforcement level.
    pub enforcement: Option<Enforcement>,
}

/// A reviewer's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewStatus {
    /// Approve.
    Approved,
    /// Reject.
    Rejected,
}

/// One review of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    /// Reviewer user id.
    pub reviewer_id: String,
    /// Verdict.
    pub status: ReviewStatus,
    /// Review time.
    pub created_at: u64,
}

/// Lifecycle of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessRequestStatus {
    /// Waiting for reviews.
    Pending,
    /// Enough approvals; the privilege exists.
    Approved,
    /// Rejected by a reviewer.
    Rejected,
}

/// A member asking for extra access to secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    /// Request id.
    pub id: String,
    /// Project.
    pub project_id: String,
    /// Access policy that gates the request.
    pub policy_id: String,
    /// Requesting member.
    pub requested_by: String,
    /// Environment slug.
    pub environment: String,
    /// Folder glob.
    pub secret_path: String,
    /// Requested actions.
    pub actions: Vec<Action>,
    /// Whether the grant is temporary.
    pub is_temporary: bool,
    /// Lifetime of a temporary grant, e.g. `"1h"`.
    pub temporary_range: Option<String>,
    /// Privilege created on approval.
    pub privilege_id: Option<String>,
    /// Status.
    pub status: AccessRequestStatus,
    /// Reviews so far.
    pub reviews: Vec<Review>,
    /// Creation time.
    pub created_at: u64,
}

/// Fields for a new access request.
#[derive(Debug, Clone)]
pub struct NewAccessRequest {
    /// Environment slug.
    pub environment: String,
    /// Folder glob.
    pub secret_path: String,
    /// Requested actions.
    pub actions: Vec<Action>,
    /// Lifetime of a temporary grant; `None` asks for permanent access.
    pub temporary_range: Option<String>,
}

/// Pending and finalized access request counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestCount {
    /// Requests waiting for reviews.
    pub pending_count: usize,
    /// Approved or rejected requests.
    pub finalized_count: usize,
}

/// Whether a change request can still be acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeStatus {
    /// Open.
    Open,
    /// Closed, merged or abandoned.
    Closed,
}

/// Kind of secret write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitOp {
    /// Create a secret.
    Create,
    /// Update a secret.
    Update,
    /// Delete a secret.
    Delete,
}

/// A secret write waiting for approval. The value is stored sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretCommit {
    /// Operation.
    pub op: CommitOp,
    /// Secret key.
    pub key: String,
    /// Rename target for updates.
    pub new_key: Option<String>,
    /// Comment to set.
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) value: Option<Sealed>,
}

impl SecretCommit {
    /// Whether the commit carries a new value.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

/// Plaintext form of a commit when a change request is opened.
#[derive(Debug, Clone)]
pub struct NewCommit {
    /// Operation.
    pub op: CommitOp,
    /// Secret key.
    pub key: String,
    /// Rename target for updates.
    pub new_key: Option<String>,
    /// New value for creates and updates.
    pub value: Option<String>,
    /// Comment to set.
    pub comment: Option<String>,
}

/// A set of secret writes held back by a change policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    /// Request id.
    pub id: String,
    /// Project.
    pub project_id: String,
    /// Change policy that gates the request.
    pub policy_id: String,
    /// Environment slug.
    pub environment: String,
    /// Folder path.
    pub secret_path: String,
    /// Actor that proposed the writes.
    pub committer_id: String,
    /// Open or closed.
    pub status: ChangeStatus,
    /// Proposed writes.
    pub commits: Vec<SecretCommit>,
    /// Reviews so far, one per reviewer.
    pub reviews: Vec<Review>,
    /// Whether the writes were applied.
    pub has_merged: bool,
    /// Actor that merged.
    pub merged_by: Option<String>,
    /// Merge time.
    pub merged_at: Option<u64>,
    /// Reason given when merging without enough approvals.
    pub bypass_reason: Option<String>,
    /// Actor that last opened or closed the request.
    pub status_changed_by: Option<String>,
    /// Creation time.
    pub created_at: u64,
    /// Last update time.
    pub updated_at: u64,
}

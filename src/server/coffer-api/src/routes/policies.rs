//! Approval policy handlers shared by access and change policies.

use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use coffer_approvals::{ApprovalPolicy, Enforcement, NewPolicy, PolicyKind, PolicyUpdate};
use coffer_audit::EventType;
use coffer_projects::{Action, Subject};

use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreatePolicyBody {
    pub project_id: String,
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    pub environment: String,
    #[serde(default = "super::default_path")]
    pub secret_path: String,
    #[validate(range(min = 1))]
    pub approvals: u32,
    #[validate(length(min = 1))]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub enforcement_level: Enforcement,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdatePolicyBody {
    #[validate(length(min = 1, max = 64))]
    pub name: Option<String>,
    pub secret_path: Option<String>,
    #[validate(range(min = 1))]
    pub approvals: Option<u32>,
    pub approvers: Option<Vec<String>>,
    pub enforcement_level: Option<Enforcement>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PolicyResponse {
    pub approval: ApprovalPolicy,
}

#[derive(Debug, Serialize)]
pub(crate) struct PoliciesResponse {
    pub approvals: Vec<ApprovalPolicy>,
}

fn events(kind: PolicyKind) -> [EventType; 3] {
    match kind {
        PolicyKind::Access => [
            EventType::CreateAccessApprovalPolicy,
            EventType::UpdateAccessApprovalPolicy,
            EventType::DeleteAccessApprovalPolicy,
        ],
        PolicyKind::Change => [
            EventType::CreateSecretApprovalPolicy,
            EventType::UpdateSecretApprovalPolicy,
            EventType::DeleteSecretApprovalPolicy,
        ],
    }
}

fn policy_metadata(policy: &ApprovalPolicy) -> serde_json::Value {
    json!({
        "policyId": policy.id,
        "name": policy.name,
        "environment": policy.environment,
        "secretPath": policy.secret_path,
        "approvals": policy.approvals,
        "enforcementLevel": policy.enforcement,
    })
}

/// Loads a policy of `kind` and checks `action` on its project.
pub(crate) async fn load(
    state: &AppState,
    auth: &Auth,
    kind: PolicyKind,
    policy_id: &str,
    action: Action,
) -> Result<ApprovalPolicy, ApiError> {
    let policy = state.approvals.get_policy(policy_id).await?;
    if policy.kind != kind {
        return Err(ApiError::NotFound(format!("policy '{}' not found", policy_id)));
    }
    state
        .permission(auth, &policy.project_id)
        .await?
        .require(Subject::SecretApproval, action)?;
    Ok(policy)
}

pub(crate) async fn create(
    state: &AppState,
    auth: &Auth,
    meta: &RequestMeta,
    kind: PolicyKind,
    body: CreatePolicyBody,
) -> Result<PolicyResponse, ApiError> {
    body.validate()?;
    state
        .permission(auth, &body.project_id)
        .await?
        .require(Subject::SecretApproval, Action::Create)?;
    super::require_members(state, &body.project_id, &body.approvers).await?;

    let policy = state
        .approvals
        .create_policy(
            &body.project_id,
            NewPolicy {
                kind,
                name: body.name,
                environment: body.environment,
                secret_path: body.secret_path,
                approvals: body.approvals,
                approvers: body.approvers,
                enforcement: body.enforcement_level,
            },
        )
        .await?;

    state
        .emit(
            auth,
            Some(&policy.project_id),
            events(kind)[0],
            policy_metadata(&policy),
            meta,
        )
        .await;
    Ok(PolicyResponse { approval: policy })
}

pub(crate) async fn list(
    state: &AppState,
    auth: &Auth,
    kind: PolicyKind,
    project_id: &str,
) -> Result<PoliciesResponse, ApiError> {
    state
        .permission(auth, project_id)
        .await?
        .require(Subject::SecretApproval, Action::Read)?;
    let approvals = state.approvals.list_policies(project_id, Some(kind)).await?;
    Ok(PoliciesResponse { approvals })
}

pub(crate) async fn update(
    state: &AppState,
    auth: &Auth,
    meta: &RequestMeta,
    kind: PolicyKind,
    policy_id: &str,
    body: UpdatePolicyBody,
) -> Result<PolicyResponse, ApiError> {
    body.validate()?;
    let policy = load(state, auth, kind, policy_id, Action::Edit).await?;
    if let Some(approvers) = &body.approvers {
        super::require_members(state, &policy.project_id, approvers).await?;
    }

    let policy = state
        .approvals
        .update_policy(
            policy_id,
            PolicyUpdate {
                name: body.name,
                secret_path: body.secret_path,
                approvals: body.approvals,
                approvers: body.approvers,
                enforcement: body.enforcement_level,
            },
        )
        .await?;

    state
        .emit(
            auth,
            Some(&policy.project_id),
            events(kind)[1],
            policy_metadata(&policy),
            meta,
        )
        .await;
    Ok(PolicyResponse { approval: policy })
}

pub(crate) async fn delete(
    state: &AppState,
    auth: &Auth,
    meta: &RequestMeta,
    kind: PolicyKind,
    policy_id: &str,
) -> Result<PolicyResponse, ApiError> {
    load(state, auth, kind, policy_id, Action::Delete).await?;
    let policy = state.approvals.delete_policy(policy_id).await?;

    state
        .emit(
            auth,
            Some(&policy.project_id),
            events(kind)[2],
            policy_metadata(&policy),
            meta,
        )
        .await;
    Ok(PolicyResponse { approval: policy })
}

//! Change approval policies and the change requests they hold.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use coffer_approvals::{ChangeRequest, ChangeStatus, PolicyKind, ReviewStatus};
use coffer_audit::EventType;
use coffer_projects::{Action, Subject};

use super::policies::{self, CreatePolicyBody, PoliciesResponse, PolicyResponse, UpdatePolicyBody};
use super::ProjectQuery;
use crate::auth::{JWT, JWT_OR_IDENTITY};
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRequestsQuery {
    project_id: String,
    status: Option<ChangeStatus>,
    committer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    status: ReviewStatus,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: ChangeStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MergeBody {
    bypass_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct RequestResponse {
    approval: ChangeRequest,
}

#[derive(Debug, Serialize)]
struct RequestsResponse {
    approvals: Vec<ChangeRequest>,
}

async fn create_policy(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreatePolicyBody>,
) -> Result<Json<PolicyResponse>, ApiError> {
    policies::create(&state, &auth, &meta, PolicyKind::Change, body)
        .await
        .map(Json)
}

async fn list_policies(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<PoliciesResponse>, ApiError> {
    policies::list(&state, &auth, PolicyKind::Change, &query.project_id)
        .await
        .map(Json)
}

async fn get_policy(
    State(state): State<AppState>,
    auth: Auth,
    Path(policy_id): Path<String>,
) -> Result<Json<PolicyResponse>, ApiError> {
    let approval = policies::load(&state, &auth, PolicyKind::Change, &policy_id, Action::Read).await?;
    Ok(Json(PolicyResponse { approval }))
}

async fn update_policy(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(policy_id): Path<String>,
    Json(body): Json<UpdatePolicyBody>,
) -> Result<Json<PolicyResponse>, ApiError> {
    policies::update(&state, &auth, &meta, PolicyKind::Change, &policy_id, body)
        .await
        .map(Json)
}

async fn delete_policy(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(policy_id): Path<String>,
) -> Result<Json<PolicyResponse>, ApiError> {
    policies::delete(&state, &auth, &meta, PolicyKind::Change, &policy_id)
        .await
        .map(Json)
}

/// Loads a change request and the caller's project admin flag.
async fn load_request(
    state: &AppState,
    auth: &Auth,
    request_id: &str,
) -> Result<(ChangeRequest, bool), ApiError> {
    let request = state.approvals.get_change_request(request_id).await?;
    let permission = state.permission(auth, &request.project_id).await?;
    permission.require(Subject::SecretApproval, Action::Read)?;
    Ok((request, permission.is_admin()))
}

async fn list_requests(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<ListRequestsQuery>,
) -> Result<Json<RequestsResponse>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SecretApproval, Action::Read)?;

    let approvals = state
        .approvals
        .list_change_requests(&query.project_id, query.status, query.committer.as_deref())
        .await?;
    Ok(Json(RequestsResponse { approvals }))
}

async fn get_request(
    State(state): State<AppState>,
    auth: Auth,
    Path(request_id): Path<String>,
) -> Result<Json<RequestResponse>, ApiError> {
    let (approval, _) = load_request(&state, &auth, &request_id).await?;
    Ok(Json(RequestResponse { approval }))
}

async fn review_request(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(request_id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<Json<RequestResponse>, ApiError> {
    let (_, is_admin) = load_request(&state, &auth, &request_id).await?;
    let approval = state
        .approvals
        .review_change_request(&request_id, auth.0.actor_id(), is_admin, body.status)
        .await?;

    state
        .emit(
            &auth,
            Some(&approval.project_id),
            EventType::SecretApprovalReviewed,
            json!({
                "secretApprovalRequestId": approval.id,
                "reviewer": auth.0.actor_id(),
                "status": body.status,
            }),
            &meta,
        )
        .await;
    Ok(Json(RequestResponse { approval }))
}

async fn set_status(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(request_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<RequestResponse>, ApiError> {
    let (_, is_admin) = load_request(&state, &auth, &request_id).await?;
    let approval = state
        .approvals
        .set_change_request_status(&request_id, auth.0.actor_id(), is_admin, body.status)
        .await?;

    let event_type = match body.status {
        ChangeStatus::Closed => EventType::SecretApprovalClosed,
        ChangeStatus::Open => EventType::SecretApprovalReopened,
    };
    state
        .emit(
            &auth,
            Some(&approval.project_id),
            event_type,
            json!({ "secretApprovalRequestId": approval.id, "status": body.status }),
            &meta,
        )
        .await;
    Ok(Json(RequestResponse { approval }))
}

async fn merge_request(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(request_id): Path<String>,
    body: Bytes,
) -> Result<Json<RequestResponse>, ApiError> {
    // The body is optional; an empty one merges without a bypass reason.
    let body: MergeBody = if body.is_empty() {
        MergeBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let (_, is_admin) = load_request(&state, &auth, &request_id).await?;
    let approval = state
        .approvals
        .merge_change_request(
            &request_id,
            auth.0.actor_id(),
            is_admin,
            body.bypass_reason.as_deref(),
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&approval.project_id),
            EventType::SecretApprovalMerged,
            json!({
                "secretApprovalRequestId": approval.id,
                "mergedBy": approval.merged_by,
                "bypassReason": approval.bypass_reason,
            }),
            &meta,
        )
        .await;
    Ok(Json(RequestResponse { approval }))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    let policies = super::guarded(
        Router::new()
            .route("/api/v1/secret-approvals", post(create_policy).get(list_policies))
            .route(
                "/api/v1/secret-approvals/{policy_id}",
                get(get_policy).patch(update_policy).delete(delete_policy),
            ),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    );
    let requests = super::guarded(
        Router::new()
            .route("/api/v1/secret-approval-requests", get(list_requests))
            .route("/api/v1/secret-approval-requests/{request_id}", get(get_request))
            .route(
                "/api/v1/secret-approval-requests/{request_id}/review",
                post(review_request),
            )
            .route(
                "/api/v1/secret-approval-requests/{request_id}/status",
                post(set_status),
            )
            .route(
                "/api/v1/secret-approval-requests/{request_id}/merge",
                post(merge_request),
            ),
        state,
        JWT,
        RateLimitPolicy::ByMethod,
    );
    policies.merge(requests)
}

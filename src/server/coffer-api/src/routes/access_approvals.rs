//! Access approval policies and access requests.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use coffer_approvals::{AccessRequest, AccessRequestCount, NewAccessRequest, PolicyKind, ReviewStatus};
use coffer_audit::EventType;
use coffer_projects::{Action, Subject};

use super::policies::{self, CreatePolicyBody, PoliciesResponse, PolicyResponse, UpdatePolicyBody};
use super::ProjectQuery;
use crate::auth::{JWT, JWT_OR_IDENTITY};
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateRequestBody {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    secret_path: String,
    #[validate(length(min = 1))]
    permissions: Vec<Action>,
    #[serde(default)]
    is_temporary: bool,
    temporary_range: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRequestsQuery {
    project_id: String,
    env_slug: Option<String>,
    author_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    status: ReviewStatus,
}

#[derive(Debug, Serialize)]
struct RequestResponse {
    approval: AccessRequest,
}

#[derive(Debug, Serialize)]
struct RequestsResponse {
    requests: Vec<AccessRequest>,
}

async fn create_policy(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreatePolicyBody>,
) -> Result<Json<PolicyResponse>, ApiError> {
    policies::create(&state, &auth, &meta, PolicyKind::Access, body)
        .await
        .map(Json)
}

async fn list_policies(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<PoliciesResponse>, ApiError> {
    policies::list(&state, &auth, PolicyKind::Access, &query.project_id)
        .await
        .map(Json)
}

async fn get_policy(
    State(state): State<AppState>,
    auth: Auth,
    Path(policy_id): Path<String>,
) -> Result<Json<PolicyResponse>, ApiError> {
    let approval = policies::load(&state, &auth, PolicyKind::Access, &policy_id, Action::Read).await?;
    Ok(Json(PolicyResponse { approval }))
}

async fn update_policy(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(policy_id): Path<String>,
    Json(body): Json<UpdatePolicyBody>,
) -> Result<Json<PolicyResponse>, ApiError> {
    policies::update(&state, &auth, &meta, PolicyKind::Access, &policy_id, body)
        .await
        .map(Json)
}

async fn delete_policy(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(policy_id): Path<String>,
) -> Result<Json<PolicyResponse>, ApiError> {
    policies::delete(&state, &auth, &meta, PolicyKind::Access, &policy_id)
        .await
        .map(Json)
}

async fn create_request(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateRequestBody>,
) -> Result<Json<RequestResponse>, ApiError> {
    body.validate()?;
    state.permission(&auth, &body.project_id).await?;
    if body.is_temporary != body.temporary_range.is_some() {
        return Err(ApiError::BadRequest(
            "temporaryRange is required exactly when isTemporary is set".into(),
        ));
    }

    let request = state
        .approvals
        .create_access_request(
            &body.project_id,
            auth.0.actor_id(),
            NewAccessRequest {
                environment: body.environment,
                secret_path: body.secret_path,
                actions: body.permissions,
                temporary_range: body.temporary_range,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&request.project_id),
            EventType::CreateAccessRequest,
            json!({
                "requestId": request.id,
                "environment": request.environment,
                "secretPath": request.secret_path,
                "permissions": request.actions,
                "isTemporary": request.is_temporary,
            }),
            &meta,
        )
        .await;
    Ok(Json(RequestResponse { approval: request }))
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

    let requests = state
        .approvals
        .list_access_requests(
            &query.project_id,
            query.env_slug.as_deref(),
            query.author_user_id.as_deref(),
        )
        .await?;
    Ok(Json(RequestsResponse { requests }))
}

async fn count_requests(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<AccessRequestCount>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SecretApproval, Action::Read)?;
    let count = state.approvals.count_access_requests(&query.project_id).await?;
    Ok(Json(count))
}

async fn review_request(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(request_id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = state.approvals.get_access_request(&request_id).await?;
    let permission = state.permission(&auth, &request.project_id).await?;

    let request = state
        .approvals
        .review_access_request(
            &request_id,
            auth.0.actor_id(),
            permission.is_admin(),
            body.status,
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&request.project_id),
            EventType::ReviewAccessRequest,
            json!({
                "requestId": request.id,
                "reviewer": auth.0.actor_id(),
                "status": body.status,
                "privilegeId": request.privilege_id,
            }),
            &meta,
        )
        .await;
    Ok(Json(json!({ "review": request })))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    let policies = super::guarded(
        Router::new()
            .route(
                "/api/v1/access-approvals/policies",
                post(create_policy).get(list_policies),
            )
            .route(
                "/api/v1/access-approvals/policies/{policy_id}",
                get(get_policy).patch(update_policy).delete(delete_policy),
            ),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    );
    let requests = super::guarded(
        Router::new()
            .route(
                "/api/v1/access-approvals/requests",
                post(create_request).get(list_requests),
            )
            .route("/api/v1/access-approvals/requests/count", get(count_requests))
            .route(
                "/api/v1/access-approvals/requests/{request_id}/review",
                post(review_request),
            ),
        state,
        JWT,
        RateLimitPolicy::ByMethod,
    );
    policies.merge(requests)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use coffer_projects::ProjectRole;

    use crate::routes::testing::Harness;

    #[tokio::test]
    async fn test_access_request_grants_privilege() {
        let h = Harness::new().await;
        let pid = h.project.id.clone();
        let (dev_id, dev_token) = h.member("dev@acme.test", ProjectRole::NoAccess).await;

        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v1/access-approvals/policies",
                Some(json!({
                    "projectId": pid,
                    "name": "prod-access",
                    "environment": "prod",
                    "secretPath": "/**",
                    "approvals": 1,
                    "approvers": [h.admin_id],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approval"]["kind"], "access");

        let (status, _) = h
            .call(
                Method::GET,
                &format!("/api/v4/secrets?projectId={}&environment=prod", pid),
                Some(&dev_token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = h
            .call(
                Method::POST,
                "/api/v1/access-approvals/requests",
                Some(&dev_token),
                Some(json!({
                    "projectId": pid,
                    "environment": "prod",
                    "secretPath": "/",
                    "permissions": ["read"],
                    "isTemporary": true,
                    "temporaryRange": "1h",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approval"]["requestedBy"], dev_id);
        let request_id = body["approval"]["id"].as_str().unwrap().to_string();

        let (_, body) = h
            .admin(
                Method::GET,
                &format!("/api/v1/access-approvals/requests/count?projectId={}", pid),
                None,
            )
            .await;
        assert_eq!(body["pendingCount"], 1);

        let (status, body) = h
            .admin(
                Method::POST,
                &format!("/api/v1/access-approvals/requests/{}/review", request_id),
                Some(json!({ "status": "approved" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["review"]["status"], "approved");

        let (status, _) = h
            .call(
                Method::GET,
                &format!("/api/v4/secrets?projectId={}&environment=prod", pid),
                Some(&dev_token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_policy_approvers_must_be_members() {
        let h = Harness::new().await;
        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v1/access-approvals/policies",
                Some(json!({
                    "projectId": h.project.id,
                    "name": "p",
                    "environment": "prod",
                    "approvals": 1,
                    "approvers": ["stranger"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "BadRequest");
    }

    #[tokio::test]
    async fn test_change_policy_is_not_visible_here() {
        let h = Harness::new().await;
        let (_, body) = h
            .admin(
                Method::POST,
                "/api/v1/secret-approvals",
                Some(json!({
                    "projectId": h.project.id,
                    "name": "changes",
                    "environment": "prod",
                    "approvals": 1,
                    "approvers": [h.admin_id],
                })),
            )
            .await;
        let id = body["approval"]["id"].as_str().unwrap().to_string();

        let (status, _) = h
            .admin(
                Method::GET,
                &format!("/api/v1/access-approvals/policies/{}", id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

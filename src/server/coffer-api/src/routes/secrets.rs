//! Secrets.
//!
//! Writes into a folder covered by a change policy are not applied. They
//! open a change request, returned under `approval` instead of `secret`.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use coffer_approvals::{ChangeRequest, CommitOp, NewCommit, PolicyKind};
use coffer_audit::EventType;
use coffer_projects::{Action, ProjectPermission};
use coffer_secrets::{Secret, SecretLocation, SecretUpdate, SecretVersionInfo};

use crate::auth::JWT_OR_IDENTITY;
use crate::rate_limit::{RateLimitClass, RateLimitPolicy};
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    secret_path: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretQuery {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    secret_path: String,
    version: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    secret_path: String,
    secret_value: String,
    #[validate(length(max = 1024))]
    secret_comment: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    secret_path: String,
    secret_value: Option<String>,
    #[validate(length(min = 1, max = 256))]
    new_secret_name: Option<String>,
    #[validate(length(max = 1024))]
    secret_comment: Option<String>,
    /// Optimistic concurrency: fail unless this is the current version.
    version: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    secret_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackBody {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    secret_path: String,
    version: u32,
}

#[derive(Debug, Serialize)]
struct SecretsResponse {
    secrets: Vec<Secret>,
}

#[derive(Debug, Serialize)]
struct VersionsResponse {
    versions: Vec<SecretVersionInfo>,
}

/// Result of a write: applied, or held for approval.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum WriteOutcome {
    Secret(Secret),
    Approval(ChangeRequest),
}

/// Checks `action` on the folder and that the folder exists.
async fn locate(
    state: &AppState,
    auth: &Auth,
    action: Action,
    project_id: &str,
    environment: &str,
    secret_path: &str,
) -> Result<(ProjectPermission, SecretLocation), ApiError> {
    let permission = state.permission(auth, project_id).await?;
    let loc = SecretLocation::new(project_id, environment, secret_path)?;
    permission.require_secret(action, &loc.environment, &loc.folder)?;
    state.projects.get_environment(project_id, environment).await?;
    state
        .projects
        .require_folder(project_id, environment, &loc.folder)
        .await?;
    Ok((permission, loc))
}

/// Opens a change request when a change policy covers `loc`.
async fn hold_for_approval(
    state: &AppState,
    auth: &Auth,
    loc: &SecretLocation,
    commit: NewCommit,
) -> Result<Option<ChangeRequest>, ApiError> {
    let policy = state
        .approvals
        .find_policy(&loc.project_id, PolicyKind::Change, &loc.environment, &loc.folder)
        .await?;
    let Some(policy) = policy else {
        return Ok(None);
    };
    let request = state
        .approvals
        .create_change_request(&policy, auth.0.actor_id(), &loc.folder, vec![commit])
        .await?;
    Ok(Some(request))
}

async fn list_secrets(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Query(query): Query<ListQuery>,
) -> Result<Json<SecretsResponse>, ApiError> {
    let (permission, loc) = locate(
        &state,
        &auth,
        Action::Read,
        &query.project_id,
        &query.environment,
        &query.secret_path,
    )
    .await?;

    // A recursive listing only returns what the caller may read below the folder.
    let secrets: Vec<Secret> = state
        .secrets
        .list(&loc.project_id, &loc.environment, &loc.folder, query.recursive)
        .await?
        .into_iter()
        .filter(|s| permission.can_secret(Action::Read, &s.environment, &s.secret_path))
        .collect();

    state
        .emit(
            &auth,
            Some(&loc.project_id),
            EventType::GetSecrets,
            json!({
                "environment": loc.environment,
                "secretPath": loc.folder,
                "numberOfSecrets": secrets.len(),
            }),
            &meta,
        )
        .await;
    Ok(Json(SecretsResponse { secrets }))
}

async fn get_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(secret_name): Path<String>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_, loc) = locate(
        &state,
        &auth,
        Action::Read,
        &query.project_id,
        &query.environment,
        &query.secret_path,
    )
    .await?;

    let secret = state.secrets.get(&loc, &secret_name, query.version).await?;

    state
        .emit(
            &auth,
            Some(&loc.project_id),
            EventType::GetSecret,
            json!({
                "environment": loc.environment,
                "secretPath": loc.folder,
                "secretKey": secret.key,
                "secretVersion": secret.version,
            }),
            &meta,
        )
        .await;
    Ok(Json(json!({ "secret": secret })))
}

async fn create_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(secret_name): Path<String>,
    Json(body): Json<CreateBody>,
) -> Result<Json<WriteOutcome>, ApiError> {
    body.validate()?;
    let (_, loc) = locate(
        &state,
        &auth,
        Action::Create,
        &body.project_id,
        &body.environment,
        &body.secret_path,
    )
    .await?;

    let commit = NewCommit {
        op: CommitOp::Create,
        key: secret_name.clone(),
        new_key: None,
        value: Some(body.secret_value.clone()),
        comment: body.secret_comment.clone(),
    };
    if let Some(request) = hold_for_approval(&state, &auth, &loc, commit).await? {
        state
            .emit(
                &auth,
                Some(&loc.project_id),
                EventType::SecretApprovalRequest,
                json!({ "secretApprovalRequestId": request.id, "committedBy": request.committer_id }),
                &meta,
            )
            .await;
        return Ok(Json(WriteOutcome::Approval(request)));
    }

    let secret = state
        .secrets
        .create(
            &loc,
            &secret_name,
            &body.secret_value,
            body.secret_comment.as_deref(),
            auth.0.actor_id(),
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&loc.project_id),
            EventType::CreateSecret,
            json!({
                "environment": loc.environment,
                "secretPath": loc.folder,
                "secretId": secret.id,
                "secretKey": secret.key,
                "secretVersion": secret.version,
            }),
            &meta,
        )
        .await;
    Ok(Json(WriteOutcome::Secret(secret)))
}

async fn update_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(secret_name): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<WriteOutcome>, ApiError> {
    body.validate()?;
    let (_, loc) = locate(
        &state,
        &auth,
        Action::Edit,
        &body.project_id,
        &body.environment,
        &body.secret_path,
    )
    .await?;

    // The secret must exist before a change request can reference it.
    state.secrets.get(&loc, &secret_name, None).await?;

    let commit = NewCommit {
        op: CommitOp::Update,
        key: secret_name.clone(),
        new_key: body.new_secret_name.clone(),
        value: body.secret_value.clone(),
        comment: body.secret_comment.clone(),
    };
    if let Some(request) = hold_for_approval(&state, &auth, &loc, commit).await? {
        state
            .emit(
                &auth,
                Some(&loc.project_id),
                EventType::SecretApprovalRequest,
                json!({ "secretApprovalRequestId": request.id, "committedBy": request.committer_id }),
                &meta,
            )
            .await;
        return Ok(Json(WriteOutcome::Approval(request)));
    }

    let secret = state
        .secrets
        .update(
            &loc,
            &secret_name,
            SecretUpdate {
                value: body.secret_value,
                new_key: body.new_secret_name,
                comment: body.secret_comment,
                expected_version: body.version,
            },
            auth.0.actor_id(),
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&loc.project_id),
            EventType::UpdateSecret,
            json!({
                "environment": loc.environment,
                "secretPath": loc.folder,
                "secretId": secret.id,
                "secretKey": secret.key,
                "secretVersion": secret.version,
            }),
            &meta,
        )
        .await;
    Ok(Json(WriteOutcome::Secret(secret)))
}

async fn delete_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(secret_name): Path<String>,
    Json(body): Json<DeleteBody>,
) -> Result<Json<WriteOutcome>, ApiError> {
    let (_, loc) = locate(
        &state,
        &auth,
        Action::Delete,
        &body.project_id,
        &body.environment,
        &body.secret_path,
    )
    .await?;

    state.secrets.get(&loc, &secret_name, None).await?;

    let commit = NewCommit {
        op: CommitOp::Delete,
        key: secret_name.clone(),
        new_key: None,
        value: None,
        comment: None,
    };
    if let Some(request) = hold_for_approval(&state, &auth, &loc, commit).await? {
        state
            .emit(
                &auth,
                Some(&loc.project_id),
                EventType::SecretApprovalRequest,
                json!({ "secretApprovalRequestId": request.id, "committedBy": request.committer_id }),
                &meta,
            )
            .await;
        return Ok(Json(WriteOutcome::Approval(request)));
    }

    let secret = state.secrets.delete(&loc, &secret_name).await?;

    state
        .emit(
            &auth,
            Some(&loc.project_id),
            EventType::DeleteSecret,
            json!({
                "environment": loc.environment,
                "secretPath": loc.folder,
                "secretId": secret.id,
                "secretKey": secret.key,
                "secretVersion": secret.version,
            }),
            &meta,
        )
        .await;
    Ok(Json(WriteOutcome::Secret(secret)))
}

async fn secret_versions(
    State(state): State<AppState>,
    auth: Auth,
    Path(secret_name): Path<String>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<VersionsResponse>, ApiError> {
    let (_, loc) = locate(
        &state,
        &auth,
        Action::Read,
        &query.project_id,
        &query.environment,
        &query.secret_path,
    )
    .await?;

    let versions = state.secrets.versions(&loc, &secret_name).await?;
    Ok(Json(VersionsResponse { versions }))
}

/// Writes the value of an older version as a new version.
async fn rollback_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(secret_name): Path<String>,
    Json(body): Json<RollbackBody>,
) -> Result<Json<WriteOutcome>, ApiError> {
    let (_, loc) = locate(
        &state,
        &auth,
        Action::Edit,
        &body.project_id,
        &body.environment,
        &body.secret_path,
    )
    .await?;

    if state
        .approvals
        .find_policy(&loc.project_id, PolicyKind::Change, &loc.environment, &loc.folder)
        .await?
        .is_some()
    {
        return Err(ApiError::BadRequest(
            "folder is covered by a change policy; submit an update instead".into(),
        ));
    }

    let secret = state
        .secrets
        .rollback(&loc, &secret_name, body.version, auth.0.actor_id())
        .await?;

    state
        .emit(
            &auth,
            Some(&loc.project_id),
            EventType::UpdateSecret,
            json!({
                "environment": loc.environment,
                "secretPath": loc.folder,
                "secretId": secret.id,
                "secretKey": secret.key,
                "secretVersion": secret.version,
                "rolledBackTo": body.version,
            }),
            &meta,
        )
        .await;
    Ok(Json(WriteOutcome::Secret(secret)))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::guarded(
        Router::new()
            .route("/api/v4/secrets", get(list_secrets))
            .route(
                "/api/v4/secrets/{secret_name}",
                get(get_secret)
                    .post(create_secret)
                    .patch(update_secret)
                    .delete(delete_secret),
            )
            .route("/api/v4/secrets/{secret_name}/versions", get(secret_versions))
            .route("/api/v4/secrets/{secret_name}/rollback", post(rollback_secret)),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::Fixed(RateLimitClass::Secrets),
    )
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use coffer_approvals::{Enforcement, NewPolicy, PolicyKind};
    use coffer_projects::ProjectRole;

    use crate::routes::testing::Harness;

    #[tokio::test]
    async fn test_secret_crud_and_versions() {
        let h = Harness::new().await;
        let pid = h.project.id.clone();

        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v4/secrets/API_KEY",
                Some(json!({ "projectId": pid, "environment": "dev", "secretValue": "one" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["secret"]["version"], 1);

        let (status, body) = h
            .admin(
                Method::PATCH,
                "/api/v4/secrets/API_KEY",
                Some(json!({ "projectId": pid, "environment": "dev", "secretValue": "two" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["secret"]["version"], 2);

        let query = format!("projectId={}&environment=dev", pid);
        let (_, body) = h
            .admin(Method::GET, &format!("/api/v4/secrets/API_KEY?{}&version=1", query), None)
            .await;
        assert_eq!(body["secret"]["value"], "one");

        let (_, body) = h
            .admin(Method::GET, &format!("/api/v4/secrets/API_KEY/versions?{}", query), None)
            .await;
        assert_eq!(body["versions"].as_array().unwrap().len(), 2);

        let (_, body) = h
            .admin(Method::GET, &format!("/api/v4/secrets?{}", query), None)
            .await;
        assert_eq!(body["secrets"][0]["value"], "two");

        let (status, _) = h
            .admin(
                Method::DELETE,
                "/api/v4/secrets/API_KEY",
                Some(json!({ "projectId": pid, "environment": "dev" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = h
            .admin(Method::GET, &format!("/api/v4/secrets/API_KEY?{}", query), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_viewer_reads_but_cannot_write() {
        let h = Harness::new().await;
        let (_, token) = h.member("viewer@acme.test", ProjectRole::Viewer).await;
        let pid = h.project.id.clone();

        let (status, _) = h
            .call(
                Method::POST,
                "/api/v4/secrets/TOKEN",
                Some(&token),
                Some(json!({ "projectId": pid, "environment": "dev", "secretValue": "x" })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = h
            .call(
                Method::GET,
                &format!("/api/v4/secrets?projectId={}&environment=dev", pid),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["secrets"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_under_change_policy_opens_request() {
        let h = Harness::new().await;
        let pid = h.project.id.clone();
        h.state
            .approvals
            .create_policy(
                &pid,
                NewPolicy {
                    kind: PolicyKind::Change,
                    name: "prod-changes".into(),
                    environment: "prod".into(),
                    secret_path: "/**".into(),
                    approvals: 1,
                    approvers: vec![h.admin_id.clone()],
                    enforcement: Enforcement::Hard,
                },
            )
            .await
            .unwrap();

        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v4/secrets/DB_PASSWORD",
                Some(json!({ "projectId": pid, "environment": "prod", "secretValue": "s3cret" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approval"]["status"], "open");
        assert!(body.get("secret").is_none());

        let (status, _) = h
            .admin(
                Method::GET,
                &format!("/api/v4/secrets/DB_PASSWORD?projectId={}&environment=prod", pid),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_folder_is_not_found() {
        let h = Harness::new().await;
        let (status, _) = h
            .admin(
                Method::POST,
                "/api/v4/secrets/KEY",
                Some(json!({
                    "projectId": h.project.id,
                    "environment": "dev",
                    "secretPath": "/nope",
                    "secretValue": "v",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

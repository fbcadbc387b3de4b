//! Secret folders.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use validator::Validate;

use coffer_audit::EventType;
use coffer_projects::{Action, Folder, Subject};

use crate::auth::JWT_OR_IDENTITY;
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateFolderBody {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    path: String,
    #[validate(length(min = 1, max = 128))]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFoldersQuery {
    project_id: String,
    environment: String,
    #[serde(default = "super::default_path")]
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFolderBody {
    project_id: String,
}

#[derive(Debug, Serialize)]
struct FolderResponse {
    folder: Folder,
}

#[derive(Debug, Serialize)]
struct FoldersResponse {
    folders: Vec<Folder>,
}

async fn create_folder(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateFolderBody>,
) -> Result<Json<FolderResponse>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SecretFolders, Action::Create)?;

    let folder = state
        .projects
        .create_folder(&body.project_id, &body.environment, &body.path, &body.name)
        .await?;

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::CreateFolder,
            json!({
                "environment": folder.environment,
                "folderId": folder.id,
                "folderPath": folder.path,
            }),
            &meta,
        )
        .await;
    Ok(Json(FolderResponse { folder }))
}

async fn list_folders(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<ListFoldersQuery>,
) -> Result<Json<FoldersResponse>, ApiError> {
    state
        .permission(&auth, &query.project_id)
        .await?
        .require(Subject::SecretFolders, Action::Read)?;

    let folders = state
        .projects
        .list_folders(&query.project_id, &query.environment, &query.path)
        .await?;
    Ok(Json(FoldersResponse { folders }))
}

/// Deletes the folder, its subfolders and every secret below it.
async fn delete_folder(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(folder_id): Path<String>,
    Json(body): Json<DeleteFolderBody>,
) -> Result<Json<FolderResponse>, ApiError> {
    state
        .permission(&auth, &body.project_id)
        .await?
        .require(Subject::SecretFolders, Action::Delete)?;

    let folder = state
        .projects
        .delete_folder(&body.project_id, &folder_id)
        .await?;
    let removed = state
        .secrets
        .delete_folder(&body.project_id, &folder.environment, &folder.path)
        .await?;
    info!(folder_id = %folder.id, secrets = removed, "Folder contents removed");

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::DeleteFolder,
            json!({
                "environment": folder.environment,
                "folderId": folder.id,
                "folderPath": folder.path,
            }),
            &meta,
        )
        .await;
    Ok(Json(FolderResponse { folder }))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::guarded(
        Router::new()
            .route("/api/v1/folders", post(create_folder).get(list_folders))
            .route("/api/v1/folders/{folder_id}", delete(delete_folder)),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    )
}

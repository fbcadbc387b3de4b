//! Projects, memberships and environments.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use coffer_audit::EventType;
use coffer_projects::{
    Action, ActorKind, Environment, Membership, NewProject, Project, ProjectRole, Subject,
};

use crate::auth::JWT_OR_IDENTITY;
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateProjectBody {
    #[validate(length(min = 1, max = 64))]
    project_name: String,
    #[validate(length(min = 1, max = 64))]
    slug: Option<String>,
    #[validate(length(max = 256))]
    project_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProjectResponse {
    project: Project,
}

#[derive(Debug, Serialize)]
struct ProjectsResponse {
    projects: Vec<Project>,
}

#[derive(Debug, Serialize)]
struct ProjectDetails {
    project: Project,
    environments: Vec<Environment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMembershipBody {
    actor_id: String,
    #[serde(default = "default_actor_kind")]
    actor_kind: ActorKind,
    role: ProjectRole,
}

fn default_actor_kind() -> ActorKind {
    ActorKind::User
}

#[derive(Debug, Serialize)]
struct MembershipResponse {
    membership: Membership,
}

#[derive(Debug, Serialize)]
struct MembershipsResponse {
    memberships: Vec<Membership>,
}

#[derive(Debug, Deserialize, Validate)]
struct CreateEnvironmentBody {
    #[validate(length(min = 1, max = 64))]
    name: String,
    #[validate(length(min = 1, max = 64))]
    slug: String,
}

#[derive(Debug, Serialize)]
struct EnvironmentResponse {
    environment: Environment,
}

#[derive(Debug, Serialize)]
struct EnvironmentsResponse {
    environments: Vec<Environment>,
}

async fn create_project(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateProjectBody>,
) -> Result<Json<ProjectResponse>, ApiError> {
    body.validate()?;
    let project = state
        .projects
        .create_project(
            &auth.0.org_id,
            auth.0.actor_id(),
            auth.actor_kind()?,
            NewProject {
                name: body.project_name,
                slug: body.slug,
                description: body.project_description,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&project.id),
            EventType::CreateProject,
            json!({ "name": project.name, "slug": project.slug }),
            &meta,
        )
        .await;
    Ok(Json(ProjectResponse { project }))
}

async fn list_projects(
    State(state): State<AppState>,
    auth: Auth,
) -> Result<Json<ProjectsResponse>, ApiError> {
    let projects = state
        .projects
        .list_projects_for_actor(auth.0.actor_id())
        .await?
        .into_iter()
        .filter(|p| p.org_id == auth.0.org_id)
        .collect();
    Ok(Json(ProjectsResponse { projects }))
}

async fn get_project(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectDetails>, ApiError> {
    state
        .permission(&auth, &project_id)
        .await?
        .require(Subject::Project, Action::Read)?;

    let project = state.projects.get_project(&project_id).await?;
    let environments = state.projects.list_environments(&project_id).await?;

    state
        .emit(
            &auth,
            Some(&project_id),
            EventType::GetProject,
            json!({ "projectId": project_id }),
            &meta,
        )
        .await;
    Ok(Json(ProjectDetails {
        project,
        environments,
    }))
}

async fn add_membership(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(project_id): Path<String>,
    Json(body): Json<AddMembershipBody>,
) -> Result<Json<MembershipResponse>, ApiError> {
    state
        .permission(&auth, &project_id)
        .await?
        .require(Subject::Members, Action::Create)?;

    let org_id = match body.actor_kind {
        ActorKind::User => state.projects.get_user(&body.actor_id).await?.org_id,
        ActorKind::Identity => {
            state
                .universal_auth
                .get_identity(&body.actor_id)
                .await?
                .org_id
        },
    };
    if org_id != auth.0.org_id {
        return Err(ApiError::BadRequest(
            "actor does not belong to the project organization".into(),
        ));
    }

    let membership = state
        .projects
        .add_membership(&project_id, &body.actor_id, body.actor_kind, body.role)
        .await?;

    state
        .emit(
            &auth,
            Some(&project_id),
            EventType::AddProjectMember,
            json!({ "actorId": membership.actor_id, "role": membership.role }),
            &meta,
        )
        .await;
    Ok(Json(MembershipResponse { membership }))
}

async fn list_memberships(
    State(state): State<AppState>,
    auth: Auth,
    Path(project_id): Path<String>,
) -> Result<Json<MembershipsResponse>, ApiError> {
    state
        .permission(&auth, &project_id)
        .await?
        .require(Subject::Members, Action::Read)?;
    let memberships = state.projects.list_memberships(&project_id).await?;
    Ok(Json(MembershipsResponse { memberships }))
}

async fn remove_membership(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path((project_id, actor_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .permission(&auth, &project_id)
        .await?
        .require(Subject::Members, Action::Delete)?;

    state
        .projects
        .remove_membership(&project_id, &actor_id)
        .await?;

    state
        .emit(
            &auth,
            Some(&project_id),
            EventType::RemoveProjectMember,
            json!({ "actorId": actor_id }),
            &meta,
        )
        .await;
    Ok(Json(json!({ "actorId": actor_id })))
}

async fn create_environment(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(project_id): Path<String>,
    Json(body): Json<CreateEnvironmentBody>,
) -> Result<Json<EnvironmentResponse>, ApiError> {
    body.validate()?;
    state
        .permission(&auth, &project_id)
        .await?
        .require(Subject::Environments, Action::Create)?;

    let environment = state
        .projects
        .create_environment(&project_id, &body.name, &body.slug)
        .await?;

    state
        .emit(
            &auth,
            Some(&project_id),
            EventType::CreateEnvironment,
            json!({ "name": environment.name, "slug": environment.slug }),
            &meta,
        )
        .await;
    Ok(Json(EnvironmentResponse { environment }))
}

async fn list_environments(
    State(state): State<AppState>,
    auth: Auth,
    Path(project_id): Path<String>,
) -> Result<Json<EnvironmentsResponse>, ApiError> {
    state
        .permission(&auth, &project_id)
        .await?
        .require(Subject::Environments, Action::Read)?;
    let environments = state.projects.list_environments(&project_id).await?;
    Ok(Json(EnvironmentsResponse { environments }))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::guarded(
        Router::new()
            .route("/api/v1/projects", post(create_project).get(list_projects))
            .route("/api/v1/projects/{project_id}", get(get_project))
            .route(
                "/api/v1/projects/{project_id}/memberships",
                post(add_membership).get(list_memberships),
            )
            .route(
                "/api/v1/projects/{project_id}/memberships/{actor_id}",
                delete(remove_membership),
            )
            .route(
                "/api/v1/projects/{project_id}/environments",
                post(create_environment).get(list_environments),
            ),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    )
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use coffer_projects::ProjectRole;

    use crate::routes::testing::Harness;

    #[tokio::test]
    async fn test_create_and_get_project() {
        let h = Harness::new().await;

        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v1/projects",
                Some(json!({ "projectName": "Payments" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["project"]["slug"], "payments");
        let id = body["project"]["id"].as_str().unwrap().to_string();

        let (status, body) = h
            .admin(Method::GET, &format!("/api/v1/projects/{}", id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["environments"].as_array().unwrap().len(), 3);

        let (_, body) = h.admin(Method::GET, "/api/v1/projects", None).await;
        assert_eq!(body["projects"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_members_and_environments() {
        let h = Harness::new().await;
        let (viewer_id, viewer_token) = h.member("viewer@acme.test", ProjectRole::Viewer).await;
        let base = format!("/api/v1/projects/{}", h.project.id);

        let (status, _) = h
            .call(
                Method::POST,
                &format!("{}/environments", base),
                Some(&viewer_token),
                Some(json!({ "name": "QA", "slug": "qa" })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = h
            .admin(
                Method::POST,
                &format!("{}/environments", base),
                Some(json!({ "name": "QA", "slug": "qa" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["environment"]["slug"], "qa");

        let (status, body) = h
            .call(
                Method::GET,
                &format!("{}/environments", base),
                Some(&viewer_token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["environments"].as_array().unwrap().len(), 4);

        let (status, _) = h
            .admin(
                Method::DELETE,
                &format!("{}/memberships/{}", base, viewer_id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = h
            .call(Method::GET, &base, Some(&viewer_token), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}

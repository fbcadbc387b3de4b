//! KMIP clients and operations on managed objects.
//!
//! Operations are proxied over HTTP as JSON. The caller authenticates as a
//! machine identity that is a member of the project and names the KMIP
//! client it acts as in the `x-kmip-client-id` header; the client's
//! permissions gate each operation.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use coffer_audit::{ActorType, AuditActor, EventType};
use coffer_kmip::{
    ClientListOptions, KmipClient, KmipClientUpdate, KmipPermission, NewKmipClient, ObjectState,
    OrderDirection, SymmetricAlgorithm,
};
use coffer_projects::{Action, Subject};

use super::ProjectQuery;
use crate::auth::{IDENTITY, JWT_OR_IDENTITY};
use crate::rate_limit::{RateLimitClass, RateLimitPolicy};
use crate::{ApiError, AppState, Auth, RequestMeta};

/// Header naming the KMIP client an operation runs as.
pub const CLIENT_ID_HEADER: &str = "x-kmip-client-id";

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateClientBody {
    project_id: String,
    #[validate(length(min = 1, max = 64))]
    name: String,
    #[validate(length(max = 256))]
    description: Option<String>,
    #[serde(default)]
    permissions: Vec<KmipPermission>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateClientBody {
    project_id: String,
    #[validate(length(min = 1, max = 64))]
    name: Option<String>,
    #[validate(length(max = 256))]
    description: Option<String>,
    permissions: Option<Vec<KmipPermission>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListClientsQuery {
    project_id: String,
    search: Option<String>,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    order_direction: OrderDirection,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientResponse {
    kmip_client: KmipClient,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientsResponse {
    kmip_clients: Vec<KmipClient>,
    total_count: usize,
}

/// Arguments of every operation; each uses the fields it needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationBody {
    project_id: String,
    id: Option<String>,
    name: Option<String>,
    algorithm: Option<SymmetricAlgorithm>,
    key: Option<String>,
    reason: Option<String>,
    state: Option<ObjectState>,
}

impl OperationBody {
    fn object_id(&self) -> Result<&str, ApiError> {
        self.id
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("object id is required".into()))
    }

    fn algorithm(&self) -> SymmetricAlgorithm {
        self.algorithm.unwrap_or(SymmetricAlgorithm::Aes256Gcm)
    }
}

async fn require(
    state: &AppState,
    auth: &Auth,
    project_id: &str,
    action: Action,
) -> Result<(), ApiError> {
    state
        .permission(auth, project_id)
        .await?
        .require(Subject::Kmip, action)?;
    Ok(())
}

fn client_metadata(client: &KmipClient) -> Value {
    json!({
        "clientId": client.id,
        "name": client.name,
        "permissions": client.permissions,
    })
}

async fn create_client(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateClientBody>,
) -> Result<Json<ClientResponse>, ApiError> {
    body.validate()?;
    require(&state, &auth, &body.project_id, Action::Create).await?;

    let kmip_client = state
        .kmip
        .create_client(
            &body.project_id,
            NewKmipClient {
                name: body.name,
                description: body.description,
                permissions: body.permissions,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::CreateKmipClient,
            client_metadata(&kmip_client),
            &meta,
        )
        .await;
    Ok(Json(ClientResponse { kmip_client }))
}

async fn list_clients(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Query(query): Query<ListClientsQuery>,
) -> Result<Json<ClientsResponse>, ApiError> {
    require(&state, &auth, &query.project_id, Action::Read).await?;

    let (kmip_clients, total_count) = state
        .kmip
        .list_clients(
            &query.project_id,
            ClientListOptions {
                search: query.search,
                offset: query.offset,
                limit: query.limit.min(100),
                order: query.order_direction,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&query.project_id),
            EventType::GetKmipClients,
            json!({ "ids": kmip_clients.iter().map(|c| c.id.as_str()).collect::<Vec<_>>() }),
            &meta,
        )
        .await;
    Ok(Json(ClientsResponse {
        kmip_clients,
        total_count,
    }))
}

async fn get_client(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(client_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ClientResponse>, ApiError> {
    require(&state, &auth, &query.project_id, Action::Read).await?;

    let kmip_client = state.kmip.get_client(&query.project_id, &client_id).await?;

    state
        .emit(
            &auth,
            Some(&query.project_id),
            EventType::GetKmipClient,
            client_metadata(&kmip_client),
            &meta,
        )
        .await;
    Ok(Json(ClientResponse { kmip_client }))
}

async fn update_client(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(client_id): Path<String>,
    Json(body): Json<UpdateClientBody>,
) -> Result<Json<ClientResponse>, ApiError> {
    body.validate()?;
    require(&state, &auth, &body.project_id, Action::Edit).await?;

    let kmip_client = state
        .kmip
        .update_client(
            &body.project_id,
            &client_id,
            KmipClientUpdate {
                name: body.name,
                description: body.description,
                permissions: body.permissions,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::UpdateKmipClient,
            client_metadata(&kmip_client),
            &meta,
        )
        .await;
    Ok(Json(ClientResponse { kmip_client }))
}

async fn delete_client(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(client_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ClientResponse>, ApiError> {
    require(&state, &auth, &query.project_id, Action::Delete).await?;

    let kmip_client = state
        .kmip
        .delete_client(&query.project_id, &client_id)
        .await?;

    state
        .emit(
            &auth,
            Some(&query.project_id),
            EventType::DeleteKmipClient,
            client_metadata(&kmip_client),
            &meta,
        )
        .await;
    Ok(Json(ClientResponse { kmip_client }))
}

fn operation_event(operation: KmipPermission) -> EventType {
    match operation {
        KmipPermission::Create => EventType::KmipOperationCreate,
        KmipPermission::Register => EventType::KmipOperationRegister,
        KmipPermission::Get => EventType::KmipOperationGet,
        KmipPermission::GetAttributes => EventType::KmipOperationGetAttributes,
        KmipPermission::Activate => EventType::KmipOperationActivate,
        KmipPermission::Revoke => EventType::KmipOperationRevoke,
        KmipPermission::Destroy => EventType::KmipOperationDestroy,
        KmipPermission::Locate => EventType::KmipOperationLocate,
    }
}

async fn run_operation(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    headers: HeaderMap,
    Path(operation): Path<String>,
    Json(body): Json<OperationBody>,
) -> Result<Json<Value>, ApiError> {
    let operation: KmipPermission = operation.parse()?;
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", CLIENT_ID_HEADER)))?;

    state.permission(&auth, &body.project_id).await?;
    let client = state
        .kmip
        .authorize(&body.project_id, client_id, operation)
        .await?;

    let kmip = &state.kmip;
    let (response, object_id) = match operation {
        KmipPermission::Create => {
            let object = kmip.create(&client, body.name.clone(), body.algorithm()).await?;
            (json!({ "object": object }), Some(object.id))
        },
        KmipPermission::Register => {
            let material = body
                .key
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("key material is required".into()))?;
            let object = kmip
                .register(&client, body.name.clone(), body.algorithm(), material)
                .await?;
            (json!({ "object": object }), Some(object.id))
        },
        KmipPermission::Get => {
            let material = kmip.get(&client, body.object_id()?).await?;
            let id = material.object.id.clone();
            (json!({ "object": material }), Some(id))
        },
        KmipPermission::GetAttributes => {
            let object = kmip.get_attributes(&client, body.object_id()?).await?;
            (json!({ "object": object }), Some(object.id))
        },
        KmipPermission::Activate => {
            let object = kmip.activate(&client, body.object_id()?).await?;
            (json!({ "object": object }), Some(object.id))
        },
        KmipPermission::Revoke => {
            let object = kmip
                .revoke(&client, body.object_id()?, body.reason.clone())
                .await?;
            (json!({ "object": object }), Some(object.id))
        },
        KmipPermission::Destroy => {
            let object = kmip.destroy(&client, body.object_id()?).await?;
            (json!({ "object": object }), Some(object.id))
        },
        KmipPermission::Locate => {
            let objects = kmip.locate(&client, body.name.as_deref(), body.state).await?;
            (json!({ "objects": objects }), None)
        },
    };

    state
        .record_event(
            &auth.0.org_id,
            Some(&body.project_id),
            AuditActor {
                actor_type: ActorType::KmipClient,
                id: Some(client.id.clone()),
                name: Some(client.name.clone()),
            },
            operation_event(operation),
            json!({ "id": object_id, "identityId": auth.0.actor_id() }),
            &meta,
        )
        .await;
    Ok(Json(response))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    let clients = super::guarded(
        Router::new()
            .route("/api/v1/kmip/clients", post(create_client).get(list_clients))
            .route(
                "/api/v1/kmip/clients/{client_id}",
                get(get_client).patch(update_client).delete(delete_client),
            ),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    );
    let operations = super::guarded(
        Router::new().route("/api/v1/kmip/operations/{operation}", post(run_operation)),
        state,
        IDENTITY,
        RateLimitPolicy::Fixed(RateLimitClass::Write),
    );
    clients.merge(operations)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use coffer_projects::{ActorKind, ProjectRole};

    use super::CLIENT_ID_HEADER;
    use crate::routes::testing::Harness;

    struct Kmip {
        h: Harness,
        token: String,
        client_id: String,
    }

    async fn setup(permissions: Value) -> Kmip {
        let h = Harness::new().await;
        let identity = h
            .state
            .universal_auth
            .create_identity(&h.org_id, "hsm-proxy", "member", None)
            .await
            .unwrap();
        h.state
            .projects
            .add_membership(&h.project.id, &identity.id, ActorKind::Identity, ProjectRole::Viewer)
            .await
            .unwrap();
        let token = h
            .state
            .jwt
            .issue_identity_token(&identity.id, &identity.name, &h.org_id, 3600)
            .unwrap();

        let (status, body) = h
            .admin(
                Method::POST,
                "/api/v1/kmip/clients",
                Some(json!({ "projectId": h.project.id, "name": "db", "permissions": permissions })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let client_id = body["kmipClient"]["id"].as_str().unwrap().to_string();
        Kmip { h, token, client_id }
    }

    async fn op(k: &Kmip, operation: &str, body: Value) -> (StatusCode, Value) {
        let mut body = body;
        body["projectId"] = json!(k.h.project.id);
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/v1/kmip/operations/{}", operation))
            .header("x-forwarded-for", "203.0.113.10")
            .header(header::AUTHORIZATION, format!("Bearer {}", k.token))
            .header(header::CONTENT_TYPE, "application/json")
            .header(CLIENT_ID_HEADER, &k.client_id)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = k.h.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_object_lifecycle() {
        let k = setup(json!(["create", "get", "activate", "revoke", "destroy", "locate"])).await;

        let (status, body) = op(&k, "create", json!({ "name": "dek" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"]["state"], "pre-active");
        let id = body["object"]["id"].as_str().unwrap().to_string();

        let (status, _) = op(&k, "activate", json!({ "id": id })).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = op(&k, "destroy", json!({ "id": id })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = op(&k, "get", json!({ "id": id })).await;
        assert!(body["object"]["value"].as_str().is_some());

        op(&k, "revoke", json!({ "id": id, "reason": "rotation" })).await;
        let (status, body) = op(&k, "destroy", json!({ "id": id })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"]["state"], "destroyed");

        let (_, body) = op(&k, "locate", json!({ "state": "destroyed" })).await;
        assert_eq!(body["objects"].as_array().unwrap().len(), 1);

        let (_, body) = k
            .h
            .admin(
                Method::GET,
                &format!(
                    "/api/v1/projects/{}/audit-logs?eventType=kmip-operation-destroy",
                    k.h.project.id
                ),
                None,
            )
            .await;
        assert_eq!(body["auditLogs"][0]["actor"]["type"], "kmipClient");
    }

    #[tokio::test]
    async fn test_client_permission_gates_operation() {
        let k = setup(json!(["create"])).await;

        let (status, _) = op(&k, "locate", json!({})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = op(&k, "frobnicate", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_user_tokens_cannot_run_operations() {
        let k = setup(json!(["create"])).await;
        let (status, _) = k
            .h
            .admin(
                Method::POST,
                "/api/v1/kmip/operations/create",
                Some(json!({ "projectId": k.h.project.id })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_members_cannot_manage_clients() {
        let h = Harness::new().await;
        let (_, token) = h.member("dev@acme.test", ProjectRole::Member).await;
        let (status, _) = h
            .call(
                Method::GET,
                &format!("/api/v1/kmip/clients?projectId={}", h.project.id),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}

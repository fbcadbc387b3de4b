//! Machine identities and their universal auth client secrets.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use coffer_audit::EventType;
use coffer_auth::{ClientSecret, Identity};

use crate::auth::JWT;
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateIdentityBody {
    #[validate(length(min = 1, max = 64))]
    name: String,
    #[serde(default = "default_role")]
    role: String,
    #[serde(rename = "accessTokenTTL")]
    access_token_ttl: Option<u64>,
}

fn default_role() -> String {
    "member".to_string()
}

#[derive(Debug, Serialize)]
struct IdentityResponse {
    identity: Identity,
}

#[derive(Debug, Serialize)]
struct IdentitiesResponse {
    identities: Vec<Identity>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct CreateClientSecretBody {
    #[validate(length(max = 256))]
    description: String,
    /// Lifetime in seconds; 0 never expires.
    ttl: u64,
    /// Maximum logins; 0 is unlimited.
    num_uses_limit: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientSecretCreated {
    client_secret: String,
    client_secret_data: ClientSecret,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientSecretsResponse {
    client_secret_data: Vec<ClientSecret>,
}

async fn org_identity(state: &AppState, auth: &Auth, id: &str) -> Result<Identity, ApiError> {
    let identity = state.universal_auth.get_identity(id).await?;
    if identity.org_id != auth.0.org_id {
        return Err(ApiError::NotFound(format!("identity '{}' not found", id)));
    }
    Ok(identity)
}

async fn create_identity(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateIdentityBody>,
) -> Result<Json<IdentityResponse>, ApiError> {
    body.validate()?;
    state.require_org_admin(&auth).await?;

    let identity = state
        .universal_auth
        .create_identity(&auth.0.org_id, &body.name, &body.role, body.access_token_ttl)
        .await?;

    state
        .emit(
            &auth,
            None,
            EventType::CreateIdentity,
            json!({ "identityId": identity.id, "name": identity.name }),
            &meta,
        )
        .await;
    Ok(Json(IdentityResponse { identity }))
}

async fn list_identities(
    State(state): State<AppState>,
    auth: Auth,
) -> Result<Json<IdentitiesResponse>, ApiError> {
    let identities = state.universal_auth.list_identities(&auth.0.org_id).await?;
    Ok(Json(IdentitiesResponse { identities }))
}

async fn get_identity(
    State(state): State<AppState>,
    auth: Auth,
    Path(identity_id): Path<String>,
) -> Result<Json<IdentityResponse>, ApiError> {
    let identity = org_identity(&state, &auth, &identity_id).await?;
    Ok(Json(IdentityResponse { identity }))
}

async fn create_client_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(identity_id): Path<String>,
    Json(body): Json<CreateClientSecretBody>,
) -> Result<Json<ClientSecretCreated>, ApiError> {
    body.validate()?;
    state.require_org_admin(&auth).await?;
    org_identity(&state, &auth, &identity_id).await?;

    let (data, plaintext) = state
        .universal_auth
        .create_client_secret(&identity_id, &body.description, body.ttl, body.num_uses_limit)
        .await?;

    state
        .emit(
            &auth,
            None,
            EventType::CreateIdentityUniversalAuthClientSecret,
            json!({ "identityId": identity_id, "clientSecretId": data.id }),
            &meta,
        )
        .await;
    Ok(Json(ClientSecretCreated {
        client_secret: plaintext,
        client_secret_data: data,
    }))
}

async fn list_client_secrets(
    State(state): State<AppState>,
    auth: Auth,
    Path(identity_id): Path<String>,
) -> Result<Json<ClientSecretsResponse>, ApiError> {
    state.require_org_admin(&auth).await?;
    org_identity(&state, &auth, &identity_id).await?;
    let client_secret_data = state.universal_auth.list_client_secrets(&identity_id).await?;
    Ok(Json(ClientSecretsResponse { client_secret_data }))
}

async fn revoke_client_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path((identity_id, secret_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.require_org_admin(&auth).await?;
    org_identity(&state, &auth, &identity_id).await?;

    let secret = state
        .universal_auth
        .revoke_client_secret(&identity_id, &secret_id)
        .await?;

    state
        .emit(
            &auth,
            None,
            EventType::RevokeIdentityUniversalAuthClientSecret,
            json!({ "identityId": identity_id, "clientSecretId": secret_id }),
            &meta,
        )
        .await;
    Ok(Json(json!({ "clientSecretData": secret })))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::guarded(
        Router::new()
            .route("/api/v1/identities", post(create_identity).get(list_identities))
            .route("/api/v1/identities/{identity_id}", get(get_identity))
            .route(
                "/api/v1/identities/{identity_id}/universal-auth/client-secrets",
                post(create_client_secret).get(list_client_secrets),
            )
            .route(
                "/api/v1/identities/{identity_id}/universal-auth/client-secrets/{secret_id}",
                delete(revoke_client_secret),
            ),
        state,
        JWT,
        RateLimitPolicy::ByMethod,
    )
}

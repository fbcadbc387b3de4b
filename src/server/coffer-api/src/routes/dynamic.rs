//! Dynamic secrets and their leases.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use coffer_audit::EventType;
use coffer_auth::Actor;
use coffer_dynamic::{DynamicSecret, DynamicSecretUpdate, Lease, NewDynamicSecret};
use coffer_projects::{Action, Subject};

use super::ProjectQuery;
use crate::auth::JWT_OR_IDENTITY;
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderBody {
    #[serde(rename = "type")]
    provider_type: String,
    inputs: Value,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    project_id: String,
    environment_slug: String,
    #[serde(default = "super::default_path")]
    path: String,
    #[validate(length(min = 1, max = 64))]
    name: String,
    provider: ProviderBody,
    #[serde(rename = "defaultTTL")]
    default_ttl: String,
    #[serde(rename = "maxTTL")]
    max_ttl: Option<String>,
    username_template: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// Addresses one dynamic secret (query string or body).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Scope {
    project_id: String,
    environment_slug: String,
    #[serde(default = "super::default_path")]
    path: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    #[serde(flatten)]
    scope: Scope,
    #[validate(length(min = 1, max = 64))]
    new_name: Option<String>,
    inputs: Option<Value>,
    #[serde(rename = "defaultTTL")]
    default_ttl: Option<String>,
    #[serde(rename = "maxTTL")]
    max_ttl: Option<String>,
    username_template: Option<String>,
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    #[serde(flatten)]
    scope: Scope,
    #[serde(default)]
    is_forced: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLeaseBody {
    #[serde(flatten)]
    scope: Scope,
    dynamic_secret_name: String,
    ttl: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewLeaseBody {
    project_id: String,
    ttl: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeLeaseBody {
    project_id: String,
    #[serde(default)]
    is_forced: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DynamicSecretResponse {
    dynamic_secret: DynamicSecret,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DynamicSecretsResponse {
    dynamic_secrets: Vec<DynamicSecret>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaseCreated {
    lease: Lease,
    dynamic_secret: DynamicSecret,
    data: Value,
}

#[derive(Debug, Serialize)]
struct LeaseResponse {
    lease: Lease,
}

#[derive(Debug, Serialize)]
struct LeasesResponse {
    leases: Vec<Lease>,
}

fn secret_metadata(secret: &DynamicSecret) -> Value {
    json!({
        "dynamicSecretId": secret.id,
        "dynamicSecretName": secret.name,
        "dynamicSecretType": secret.provider_type,
        "environment": secret.environment,
        "secretPath": secret.secret_path,
    })
}

fn lease_metadata(lease: &Lease, secret: &DynamicSecret) -> Value {
    json!({
        "leaseId": lease.id,
        "leaseExternalEntityId": lease.external_entity_id,
        "leaseExpireAt": lease.expire_at,
        "dynamicSecretId": secret.id,
        "dynamicSecretName": secret.name,
        "environment": secret.environment,
        "secretPath": secret.secret_path,
    })
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
        .require(Subject::DynamicSecrets, action)?;
    Ok(())
}

async fn create_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateBody>,
) -> Result<Json<DynamicSecretResponse>, ApiError> {
    body.validate()?;
    require(&state, &auth, &body.project_id, Action::Create).await?;

    let dynamic_secret = state
        .dynamic
        .create(
            &body.project_id,
            NewDynamicSecret {
                environment: body.environment_slug,
                secret_path: body.path,
                name: body.name,
                provider_type: body.provider.provider_type,
                inputs: body.provider.inputs,
                default_ttl: body.default_ttl,
                max_ttl: body.max_ttl,
                username_template: body.username_template,
                metadata: body.metadata,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::CreateDynamicSecret,
            secret_metadata(&dynamic_secret),
            &meta,
        )
        .await;
    Ok(Json(DynamicSecretResponse { dynamic_secret }))
}

async fn list_secrets(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Query(scope): Query<Scope>,
) -> Result<Json<DynamicSecretsResponse>, ApiError> {
    require(&state, &auth, &scope.project_id, Action::Read).await?;

    let dynamic_secrets = state
        .dynamic
        .list(&scope.project_id, &scope.environment_slug, &scope.path)
        .await?;

    state
        .emit(
            &auth,
            Some(&scope.project_id),
            EventType::ListDynamicSecrets,
            json!({ "environment": scope.environment_slug, "secretPath": scope.path }),
            &meta,
        )
        .await;
    Ok(Json(DynamicSecretsResponse { dynamic_secrets }))
}

async fn get_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(name): Path<String>,
    Query(scope): Query<Scope>,
) -> Result<Json<DynamicSecretResponse>, ApiError> {
    require(&state, &auth, &scope.project_id, Action::Read).await?;

    let dynamic_secret = state
        .dynamic
        .get_by_name(&scope.project_id, &scope.environment_slug, &scope.path, &name)
        .await?;

    state
        .emit(
            &auth,
            Some(&scope.project_id),
            EventType::GetDynamicSecret,
            secret_metadata(&dynamic_secret),
            &meta,
        )
        .await;
    Ok(Json(DynamicSecretResponse { dynamic_secret }))
}

async fn update_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(name): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<DynamicSecretResponse>, ApiError> {
    body.validate()?;
    let scope = body.scope;
    require(&state, &auth, &scope.project_id, Action::Edit).await?;

    let dynamic_secret = state
        .dynamic
        .update_by_name(
            &scope.project_id,
            &scope.environment_slug,
            &scope.path,
            &name,
            DynamicSecretUpdate {
                new_name: body.new_name,
                inputs: body.inputs,
                default_ttl: body.default_ttl,
                max_ttl: body.max_ttl,
                username_template: body.username_template,
                metadata: body.metadata,
            },
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&scope.project_id),
            EventType::UpdateDynamicSecret,
            secret_metadata(&dynamic_secret),
            &meta,
        )
        .await;
    Ok(Json(DynamicSecretResponse { dynamic_secret }))
}

async fn delete_secret(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(name): Path<String>,
    Json(body): Json<DeleteBody>,
) -> Result<Json<DynamicSecretResponse>, ApiError> {
    let scope = body.scope;
    require(&state, &auth, &scope.project_id, Action::Delete).await?;

    let dynamic_secret = state
        .dynamic
        .delete_by_name(
            &scope.project_id,
            &scope.environment_slug,
            &scope.path,
            &name,
            body.is_forced,
        )
        .await?;

    let mut metadata = secret_metadata(&dynamic_secret);
    metadata["isForced"] = json!(body.is_forced);
    state
        .emit(
            &auth,
            Some(&scope.project_id),
            EventType::DeleteDynamicSecret,
            metadata,
            &meta,
        )
        .await;
    Ok(Json(DynamicSecretResponse { dynamic_secret }))
}

async fn list_leases(
    State(state): State<AppState>,
    auth: Auth,
    Path(name): Path<String>,
    Query(scope): Query<Scope>,
) -> Result<Json<LeasesResponse>, ApiError> {
    require(&state, &auth, &scope.project_id, Action::Read).await?;

    let leases = state
        .dynamic
        .list_leases(&scope.project_id, &scope.environment_slug, &scope.path, &name)
        .await?;
    Ok(Json(LeasesResponse { leases }))
}

async fn create_lease(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateLeaseBody>,
) -> Result<Json<LeaseCreated>, ApiError> {
    let scope = body.scope;
    require(&state, &auth, &scope.project_id, Action::Lease).await?;

    let identity_name = match &auth.0.actor {
        Actor::Identity { name, .. } => Some(name.as_str()),
        _ => None,
    };
    let issued = state
        .dynamic
        .create_lease(
            &scope.project_id,
            &scope.environment_slug,
            &scope.path,
            &body.dynamic_secret_name,
            body.ttl.as_deref(),
            identity_name,
        )
        .await?;

    state
        .emit(
            &auth,
            Some(&scope.project_id),
            EventType::CreateDynamicSecretLease,
            lease_metadata(&issued.lease, &issued.dynamic_secret),
            &meta,
        )
        .await;
    Ok(Json(LeaseCreated {
        lease: issued.lease,
        dynamic_secret: issued.dynamic_secret,
        data: issued.data,
    }))
}

async fn get_lease(
    State(state): State<AppState>,
    auth: Auth,
    Path(lease_id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<Value>, ApiError> {
    require(&state, &auth, &query.project_id, Action::Read).await?;

    let (lease, dynamic_secret) = state
        .dynamic
        .get_lease(&query.project_id, &lease_id)
        .await?;
    Ok(Json(json!({ "lease": lease, "dynamicSecret": dynamic_secret })))
}

async fn renew_lease(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(lease_id): Path<String>,
    Json(body): Json<RenewLeaseBody>,
) -> Result<Json<LeaseResponse>, ApiError> {
    require(&state, &auth, &body.project_id, Action::Lease).await?;

    let lease = state
        .dynamic
        .renew_lease(&body.project_id, &lease_id, body.ttl.as_deref())
        .await?;
    let (_, dynamic_secret) = state.dynamic.get_lease(&body.project_id, &lease_id).await?;

    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::RenewDynamicSecretLease,
            lease_metadata(&lease, &dynamic_secret),
            &meta,
        )
        .await;
    Ok(Json(LeaseResponse { lease }))
}

async fn revoke_lease(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(lease_id): Path<String>,
    Json(body): Json<RevokeLeaseBody>,
) -> Result<Json<LeaseResponse>, ApiError> {
    require(&state, &auth, &body.project_id, Action::Lease).await?;

    let (_, dynamic_secret) = state.dynamic.get_lease(&body.project_id, &lease_id).await?;
    let lease = state
        .dynamic
        .revoke_lease(&body.project_id, &lease_id, body.is_forced)
        .await?;

    let mut metadata = lease_metadata(&lease, &dynamic_secret);
    metadata["isForced"] = json!(body.is_forced);
    metadata["leaseStatus"] = json!(lease.status);
    state
        .emit(
            &auth,
            Some(&body.project_id),
            EventType::DeleteDynamicSecretLease,
            metadata,
            &meta,
        )
        .await;
    Ok(Json(LeaseResponse { lease }))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::guarded(
        Router::new()
            .route("/api/v1/dynamic-secrets", post(create_secret).get(list_secrets))
            .route("/api/v1/dynamic-secrets/leases", post(create_lease))
            .route(
                "/api/v1/dynamic-secrets/leases/{lease_id}",
                get(get_lease).delete(revoke_lease),
            )
            .route(
                "/api/v1/dynamic-secrets/leases/{lease_id}/renew",
                post(renew_lease),
            )
            .route(
                "/api/v1/dynamic-secrets/{name}",
                get(get_secret).patch(update_secret).delete(delete_secret),
            )
            .route("/api/v1/dynamic-secrets/{name}/leases", get(list_leases)),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    )
}

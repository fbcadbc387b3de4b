//! SCIM 2.0 user provisioning and SCIM token management.
//!
//! Provisioning routes accept SCIM tokens only and answer with SCIM error
//! bodies. Token management is done by organization admins with a JWT.

use std::time::{Duration, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use coffer_audit::EventType;
use coffer_auth::ScimToken;
use coffer_projects::{NewUser, OrgRole, OrgUser, ProjectError, UserUpdate};

use crate::auth::{JWT, SCIM};
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth, RequestMeta};

const USER_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:User";
const LIST_SCHEMA: &str = "urn:ietf:params:scim:api:messages:2.0:ListResponse";
const PATCH_SCHEMA: &str = "urn:ietf:params:scim:api:messages:2.0:PatchOp";
const ERROR_SCHEMA: &str = "urn:ietf:params:scim:api:messages:2.0:Error";

const DEFAULT_PAGE_SIZE: usize = 100;

/// Error answered in the SCIM error format (RFC 7644 section 3.12).
#[derive(Debug)]
pub(crate) struct ScimError {
    status: StatusCode,
    scim_type: Option<&'static str>,
    detail: String,
}

impl ScimError {
    fn invalid(scim_type: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            scim_type: Some(scim_type),
            detail: detail.into(),
        }
    }
}

impl From<ApiError> for ScimError {
    fn from(e: ApiError) -> Self {
        Self {
            status: e.status(),
            scim_type: None,
            detail: e.public_message(),
        }
    }
}

impl From<ProjectError> for ScimError {
    fn from(e: ProjectError) -> Self {
        match e {
            ProjectError::AlreadyExists(_) => Self {
                status: StatusCode::CONFLICT,
                scim_type: Some("uniqueness"),
                detail: e.to_string(),
            },
            other => ApiError::from(other).into(),
        }
    }
}

impl IntoResponse for ScimError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "schemas": [ERROR_SCHEMA],
            "detail": self.detail,
            "status": self.status.as_u16().to_string(),
        });
        if let Some(scim_type) = self.scim_type {
            body["scimType"] = json!(scim_type);
        }
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScimName {
    #[serde(skip_serializing_if = "Option::is_none")]
    given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    family_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScimEmail {
    value: String,
    #[serde(default)]
    primary: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    email_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScimMeta {
    resource_type: &'static str,
    created: String,
    location: String,
}

/// A user in SCIM representation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScimUser {
    schemas: [&'static str; 1],
    id: String,
    user_name: String,
    name: ScimName,
    display_name: String,
    emails: Vec<ScimEmail>,
    active: bool,
    meta: ScimMeta,
}

impl From<OrgUser> for ScimUser {
    fn from(user: OrgUser) -> Self {
        let display_name = match (&user.first_name, &user.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => user.username.clone(),
        };
        let created = humantime::format_rfc3339_seconds(
            UNIX_EPOCH + Duration::from_secs(user.created_at),
        )
        .to_string();
        ScimUser {
            schemas: [USER_SCHEMA],
            meta: ScimMeta {
                resource_type: "User",
                created,
                location: format!("/api/v1/scim/Users/{}", user.id),
            },
            id: user.id,
            user_name: user.username,
            name: ScimName {
                given_name: user.first_name,
                family_name: user.last_name,
            },
            display_name,
            emails: vec![ScimEmail {
                value: user.email,
                primary: true,
                email_type: Some("work".into()),
            }],
            active: user.active,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserBody {
    user_name: String,
    #[serde(default)]
    name: ScimName,
    #[serde(default)]
    emails: Vec<ScimEmail>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PatchOperation {
    op: String,
    path: Option<String>,
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PatchBody {
    schemas: Vec<String>,
    #[serde(rename = "Operations")]
    operations: Vec<PatchOperation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListUsersQuery {
    filter: Option<String>,
    start_index: Option<usize>,
    count: Option<usize>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateTokenBody {
    #[validate(length(max = 256))]
    #[serde(default)]
    description: String,
    #[serde(default)]
    ttl_days: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenResponse {
    scim_token: ScimToken,
    token: String,
}

/// Primary email of a SCIM payload; falls back to a userName that looks like
/// an address.
fn primary_email(emails: &[ScimEmail], user_name: &str) -> Option<String> {
    emails
        .iter()
        .find(|e| e.primary)
        .or_else(|| emails.first())
        .map(|e| e.value.clone())
        .or_else(|| user_name.contains('@').then(|| user_name.to_string()))
}

/// Parses the `userName eq "..."` filter, the only one identity providers
/// send before provisioning.
fn parse_filter(filter: &str) -> Result<(String, String), ScimError> {
    let mut parts = filter.trim().splitn(3, ' ');
    let (Some(attribute), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ScimError::invalid("invalidFilter", format!("invalid filter '{}'", filter)));
    };
    if !op.eq_ignore_ascii_case("eq") {
        return Err(ScimError::invalid(
            "invalidFilter",
            format!("unsupported filter operator '{}'", op),
        ));
    }
    let attribute = attribute.to_ascii_lowercase();
    if attribute != "username" && attribute != "emails.value" {
        return Err(ScimError::invalid(
            "invalidFilter",
            format!("unsupported filter attribute '{}'", attribute),
        ));
    }
    Ok((attribute, value.trim().trim_matches('"').to_string()))
}

/// Applies one `replace` or `add` value at `path` onto `update`.
fn apply_patch_value(update: &mut UserUpdate, path: &str, value: &Value) -> Result<(), ScimError> {
    let text = || {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ScimError::invalid("invalidValue", format!("'{}' must be a string", path)))
    };
    match path {
        "active" => {
            update.active = Some(match value {
                Value::Bool(b) => *b,
                // some providers send booleans as strings
                Value::String(s) => s.eq_ignore_ascii_case("true"),
                _ => return Err(ScimError::invalid("invalidValue", "'active' must be a boolean")),
            });
        },
        "name.givenName" => update.first_name = Some(text()?),
        "name.familyName" => update.last_name = Some(text()?),
        "emails" => {
            let emails: Vec<ScimEmail> = serde_json::from_value(value.clone())
                .map_err(|e| ScimError::invalid("invalidValue", e.to_string()))?;
            update.email = primary_email(&emails, "");
        },
        p if p.starts_with("emails[") => update.email = Some(text()?),
        "name" => {
            let name: ScimName = serde_json::from_value(value.clone())
                .map_err(|e| ScimError::invalid("invalidValue", e.to_string()))?;
            update.first_name = name.given_name.or(update.first_name.take());
            update.last_name = name.family_name.or(update.last_name.take());
        },
        other => {
            return Err(ScimError::invalid(
                "invalidPath",
                format!("attribute '{}' cannot be modified", other),
            ))
        },
    }
    Ok(())
}

fn build_update(body: &PatchBody) -> Result<UserUpdate, ScimError> {
    if !body.schemas.iter().any(|s| s == PATCH_SCHEMA) {
        return Err(ScimError::invalid("invalidSyntax", "missing PatchOp schema"));
    }
    let mut update = UserUpdate::default();
    for operation in &body.operations {
        let op = operation.op.to_ascii_lowercase();
        if op != "replace" && op != "add" {
            return Err(ScimError::invalid(
                "invalidSyntax",
                format!("unsupported patch operation '{}'", operation.op),
            ));
        }
        let value = operation
            .value
            .as_ref()
            .ok_or_else(|| ScimError::invalid("noTarget", "patch operation requires a value"))?;
        match (&operation.path, value) {
            (Some(path), value) => apply_patch_value(&mut update, path, value)?,
            (None, Value::Object(fields)) => {
                for (path, value) in fields {
                    apply_patch_value(&mut update, path, value)?;
                }
            },
            (None, _) => {
                return Err(ScimError::invalid("invalidValue", "patch value must be an object"))
            },
        }
    }
    Ok(update)
}

/// Loads a user of the caller's organization.
async fn org_user(state: &AppState, auth: &Auth, user_id: &str) -> Result<OrgUser, ScimError> {
    match state.projects.get_user(user_id).await {
        Ok(user) if user.org_id == auth.0.org_id => Ok(user),
        Ok(_) | Err(ProjectError::NotFound(_)) => Err(ScimError {
            status: StatusCode::NOT_FOUND,
            scim_type: None,
            detail: format!("user '{}' not found", user_id),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn list_users(
    State(state): State<AppState>,
    auth: Auth,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<Value>, ScimError> {
    let filter = query.filter.as_deref().map(parse_filter).transpose()?;
    let mut users = state.projects.list_users(&auth.0.org_id).await?;
    if let Some((attribute, value)) = filter {
        let value = value.to_lowercase();
        users.retain(|u| match attribute.as_str() {
            "username" => u.username.to_lowercase() == value,
            _ => u.email == value,
        });
    }
    users.sort_by_key(|u| u.created_at);

    let total = users.len();
    let start_index = query.start_index.unwrap_or(1).max(1);
    let count = query.count.unwrap_or(DEFAULT_PAGE_SIZE);
    let resources: Vec<ScimUser> = users
        .into_iter()
        .skip(start_index - 1)
        .take(count)
        .map(ScimUser::from)
        .collect();

    Ok(Json(json!({
        "schemas": [LIST_SCHEMA],
        "totalResults": total,
        "startIndex": start_index,
        "itemsPerPage": resources.len(),
        "Resources": resources,
    })))
}

async fn create_user(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateUserBody>,
) -> Result<(StatusCode, Json<ScimUser>), ScimError> {
    let email = primary_email(&body.emails, &body.user_name)
        .ok_or_else(|| ScimError::invalid("invalidValue", "an email address is required"))?;

    let mut user = state
        .projects
        .create_user(
            &auth.0.org_id,
            NewUser {
                email,
                username: Some(body.user_name),
                first_name: body.name.given_name,
                last_name: body.name.family_name,
                org_role: OrgRole::Member,
            },
        )
        .await?;
    if !body.active {
        user = state
            .projects
            .update_user(
                &user.id,
                UserUpdate {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await?;
    }

    state
        .emit(
            &auth,
            None,
            EventType::ScimProvisionUser,
            json!({ "userId": user.id, "email": user.email }),
            &meta,
        )
        .await;
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn get_user(
    State(state): State<AppState>,
    auth: Auth,
    Path(user_id): Path<String>,
) -> Result<Json<ScimUser>, ScimError> {
    let user = org_user(&state, &auth, &user_id).await?;
    Ok(Json(user.into()))
}

async fn patch_user(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(user_id): Path<String>,
    Json(body): Json<PatchBody>,
) -> Result<Json<ScimUser>, ScimError> {
    let update = build_update(&body)?;
    org_user(&state, &auth, &user_id).await?;
    let user = state.projects.update_user(&user_id, update).await?;

    state
        .emit(
            &auth,
            None,
            EventType::ScimUpdateUser,
            json!({ "userId": user.id, "email": user.email, "active": user.active }),
            &meta,
        )
        .await;
    Ok(Json(user.into()))
}

async fn delete_user(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ScimError> {
    org_user(&state, &auth, &user_id).await?;
    let user = state.projects.delete_user(&user_id).await?;

    state
        .emit(
            &auth,
            None,
            EventType::ScimDeprovisionUser,
            json!({ "userId": user.id, "email": user.email }),
            &meta,
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_token(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Json(body): Json<CreateTokenBody>,
) -> Result<Json<CreateTokenResponse>, ApiError> {
    body.validate()?;
    state.require_org_admin(&auth).await?;

    let (scim_token, token) = state
        .scim_tokens
        .create_token(&auth.0.org_id, &body.description, body.ttl_days)
        .await?;

    state
        .emit(
            &auth,
            None,
            EventType::CreateScimToken,
            json!({ "scimTokenId": scim_token.id, "ttlDays": scim_token.ttl_days }),
            &meta,
        )
        .await;
    Ok(Json(CreateTokenResponse { scim_token, token }))
}

async fn list_tokens(
    State(state): State<AppState>,
    auth: Auth,
) -> Result<Json<Value>, ApiError> {
    state.require_org_admin(&auth).await?;
    let tokens = state.scim_tokens.list_tokens(&auth.0.org_id).await?;
    Ok(Json(json!({ "scimTokens": tokens })))
}

async fn delete_token(
    State(state): State<AppState>,
    auth: Auth,
    meta: RequestMeta,
    Path(token_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.require_org_admin(&auth).await?;
    state.scim_tokens.delete_token(&auth.0.org_id, &token_id).await?;
    state
        .emit(
            &auth,
            None,
            EventType::DeleteScimToken,
            json!({ "scimTokenId": token_id }),
            &meta,
        )
        .await;
    Ok(Json(json!({ "scimTokenId": token_id })))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    let provisioning = super::guarded(
        Router::new()
            .route("/api/v1/scim/Users", get(list_users).post(create_user))
            .route(
                "/api/v1/scim/Users/{user_id}",
                get(get_user).patch(patch_user).delete(delete_user),
            ),
        state,
        SCIM,
        RateLimitPolicy::ByMethod,
    );
    let tokens = super::guarded(
        Router::new()
            .route("/api/v1/scim/tokens", get(list_tokens).post(create_token))
            .route("/api/v1/scim/tokens/{token_id}", delete(delete_token)),
        state,
        JWT,
        RateLimitPolicy::ByMethod,
    );
    provisioning.merge(tokens)
}

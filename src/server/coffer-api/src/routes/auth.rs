//! Universal auth login.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

use coffer_audit::{ActorType, AuditActor, EventType};
use coffer_auth::LoginResult;

use crate::rate_limit::{RateLimitClass, RateLimitPolicy};
use crate::{ApiError, AppState, RequestMeta};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct LoginBody {
    #[validate(length(min = 1))]
    client_id: String,
    #[validate(length(min = 1))]
    client_secret: String,
}

async fn login(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(body): Json<LoginBody>,
) -> Result<Json<LoginResult>, ApiError> {
    body.validate()?;
    let (identity, result) = state
        .universal_auth
        .login(body.client_id.trim(), &body.client_secret)
        .await?;

    state
        .record_event(
            &identity.org_id,
            None,
            AuditActor {
                actor_type: ActorType::Identity,
                id: Some(identity.id.clone()),
                name: Some(identity.name.clone()),
            },
            EventType::LoginIdentityUniversalAuth,
            json!({ "identityId": identity.id }),
            &meta,
        )
        .await;
    Ok(Json(result))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::public(
        Router::new().route("/api/v1/auth/universal-auth/login", post(login)),
        state,
        RateLimitPolicy::Fixed(RateLimitClass::Auth),
    )
}

//! Health endpoint.

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::rate_limit::RateLimitPolicy;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    date: u64,
    message: &'static str,
    version: &'static str,
}

async fn status() -> Json<Status> {
    Json(Status {
        date: coffer_projects::now(),
        message: "Ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::public(
        Router::new().route("/api/status", get(status)),
        state,
        RateLimitPolicy::ByMethod,
    )
}

//! Project audit log queries.

use std::time::UNIX_EPOCH;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use coffer_audit::{AuditEvent, AuditFilter, EventType};
use coffer_projects::{Action, Subject};

use crate::auth::JWT_OR_IDENTITY;
use crate::rate_limit::RateLimitPolicy;
use crate::{ApiError, AppState, Auth};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditLogQuery {
    event_type: Option<String>,
    actor_id: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditLogsResponse {
    audit_logs: Vec<AuditEvent>,
    total_count: usize,
}

/// Parses an RFC 3339 timestamp or Unix seconds.
fn parse_date(field: &str, value: &str) -> Result<u64, ApiError> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }
    humantime::parse_rfc3339_weak(value)
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .ok_or_else(|| ApiError::BadRequest(format!("{} is not a valid date: '{}'", field, value)))
}

/// Comma-separated event type names.
fn parse_event_types(value: Option<&str>) -> Result<Vec<EventType>, ApiError> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().map_err(ApiError::from))
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

async fn list_audit_logs(
    State(state): State<AppState>,
    auth: Auth,
    Path(project_id): Path<String>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogsResponse>, ApiError> {
    state
        .permission(&auth, &project_id)
        .await?
        .require(Subject::AuditLogs, Action::Read)?;

    let filter = AuditFilter {
        project_id: Some(project_id),
        event_types: parse_event_types(query.event_type.as_deref())?,
        actor_id: query.actor_id,
        start: query
            .start_date
            .as_deref()
            .map(|d| parse_date("startDate", d))
            .transpose()?,
        end: query
            .end_date
            .as_deref()
            .map(|d| parse_date("endDate", d))
            .transpose()?,
        offset: query.offset,
        limit: query.limit,
    };

    let (audit_logs, total_count) = state.audit.query(&auth.0.org_id, &filter).await?;
    Ok(Json(AuditLogsResponse {
        audit_logs,
        total_count,
    }))
}

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    super::guarded(
        Router::new().route("/api/v1/projects/{project_id}/audit-logs", get(list_audit_logs)),
        state,
        JWT_OR_IDENTITY,
        RateLimitPolicy::ByMethod,
    )
}

//! Audit emission from handlers.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header;
use axum::http::request::Parts;
use serde_json::Value;
use tracing::error;

use coffer_audit::{AuditActor, EventType, NewAuditEvent, RequestInfo};

use crate::rate_limit::client_ip;
use crate::{ApiError, AppState, Auth};

/// Client IP and User-Agent of the current request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta(pub RequestInfo);

impl FromRequestParts<AppState> for RequestMeta {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(RequestMeta(RequestInfo {
            ip_address: client_ip(&parts.headers, peer, state.rate_limits.trust_proxy()),
            user_agent,
        }))
    }
}

impl AppState {
    /// Records an event on behalf of an explicit actor.
    ///
    /// The operation has already happened, so a failure to record is logged
    /// rather than returned.
    pub async fn record_event(
        &self,
        org_id: &str,
        project_id: Option<&str>,
        actor: AuditActor,
        event_type: EventType,
        metadata: Value,
        meta: &RequestMeta,
    ) {
        let result = self
            .audit
            .record(NewAuditEvent {
                org_id: org_id.to_string(),
                project_id: project_id.map(str::to_string),
                actor,
                event_type,
                metadata,
                request: meta.0.clone(),
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, event_type = %event_type, "Failed to record audit event");
        }
    }

    /// Records an event performed by the authenticated caller.
    pub async fn emit(
        &self,
        auth: &Auth,
        project_id: Option<&str>,
        event_type: EventType,
        metadata: Value,
        meta: &RequestMeta,
    ) {
        self.record_event(
            &auth.0.org_id,
            project_id,
            auth.audit_actor(),
            event_type,
            metadata,
            meta,
        )
        .await;
    }
}

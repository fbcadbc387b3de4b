//! # Coffer Audit
//!
//! Records who did what, in which organization and project.
//!
//! Every event is persisted under its organization and also emitted as a
//! structured `tracing` event on the `audit` target so it can be shipped to
//! a SIEM without reading the store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod event;

use std::sync::Arc;

use uuid::Uuid;

use coffer_storage::{Collection, StorageBackend};

pub use error::AuditError;
pub use event::{
    ActorType, AuditActor, AuditEvent, AuditFilter, EventType, RequestInfo, UserAgentType,
};

/// Default page size for queries.
pub const DEFAULT_LIMIT: usize = 20;

/// Largest page size a query may ask for.
pub const MAX_LIMIT: usize = 100;

/// What to record. Id, time and User-Agent class are filled in by the log.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    /// Organization scope.
    pub org_id: String,
    /// Project scope.
    pub project_id: Option<String>,
    /// Actor.
    pub actor: AuditActor,
    /// Operation.
    pub event_type: EventType,
    /// Operation-specific details.
    pub metadata: serde_json::Value,
    /// Request information.
    pub request: RequestInfo,
}

/// Persistent audit log.
pub struct AuditLog {
    events: Collection<AuditEvent>,
}

impl AuditLog {
    /// Creates the log on top of `storage`.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            events: Collection::new(storage, "audit"),
        }
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    /// Records an event.
    pub async fn record(&self, new: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        let event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            org_id: new.org_id,
            project_id: new.project_id,
            user_agent_type: UserAgentType::from_user_agent(new.request.user_agent.as_deref()),
            actor: new.actor,
            event_type: new.event_type,
            metadata: new.metadata,
            ip_address: new.request.ip_address,
            user_agent: new.request.user_agent,
            created_at: Self::now(),
        };

        // zero-padded time first so keys sort chronologically
        let id = format!("{}/{:020}-{}", event.org_id, event.created_at, event.id);
        self.events.insert(&id, &event).await?;

        tracing::info!(
            target: "audit",
            event_id = %event.id,
            event_type = %event.event_type,
            org_id = %event.org_id,
            project_id = ?event.project_id,
            actor_type = ?event.actor.actor_type,
            actor_id = ?event.actor.id,
            ip = ?event.ip_address,
            "audit event"
        );

        Ok(event)
    }

    /// Returns events of `org_id` matching `filter`, newest first, with the
    /// total number of matches before paging.
    pub async fn query(
        &self,
        org_id: &str,
        filter: &AuditFilter,
    ) -> Result<(Vec<AuditEvent>, usize), AuditError> {
        let mut matching: Vec<AuditEvent> = self
            .events
            .under(&format!("{}/", org_id))
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        matching.reverse();

        let total = matching.len();
        let limit = match filter.limit {
            0 => DEFAULT_LIMIT,
            n => n.min(MAX_LIMIT),
        };
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();

        Ok((page, total))
    }
}

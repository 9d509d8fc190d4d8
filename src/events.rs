//! Lifecycle events for downstream consumers
//!
//! Pipelines downstream of this service (notifications, analytics, billing)
//! care when connections appear, change status or fail to refresh. They get a
//! small closed set of events through [`EventPublisher`]; the default
//! implementation writes them to the structured log and counts them, which is
//! where a queue producer would slot in.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::ActionType;
use crate::models::user_site::{ConnectionStatus, FailureReason};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteEvent {
    /// A refresh batch started under one activity.
    RefreshStarted {
        activity_id: Uuid,
        user_id: Uuid,
        user_site_ids: Vec<Uuid>,
        action_type: ActionType,
    },
    /// A new user-site connection came into existence.
    ConnectionCreated {
        user_site_id: Uuid,
        user_id: Uuid,
        site_id: Uuid,
    },
    /// One connection of a refresh batch failed; the rest continue.
    RefreshFailed {
        activity_id: Uuid,
        user_site_id: Uuid,
        reason: FailureReason,
    },
    /// A connection's visible status changed outside a refresh batch.
    ConnectionStatusChanged {
        user_site_id: Uuid,
        status: ConnectionStatus,
        failure_reason: Option<FailureReason>,
    },
}

impl SiteEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SiteEvent::RefreshStarted { .. } => "refresh_started",
            SiteEvent::ConnectionCreated { .. } => "connection_created",
            SiteEvent::RefreshFailed { .. } => "refresh_failed",
            SiteEvent::ConnectionStatusChanged { .. } => "connection_status_changed",
        }
    }
}

/// Outbound event seam. Publishing is fire-and-forget: a lost event must
/// never fail the lifecycle operation that produced it.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: SiteEvent);
}

pub type SharedEventPublisher = Arc<dyn EventPublisher>;

/// Publishes events to the structured log and the metrics registry.
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, event: SiteEvent) {
        let metric_labels = vec![("event", event.name().to_string())];
        counter!("site_events_published_total", &metric_labels).increment(1);

        match serde_json::to_string(&event) {
            Ok(payload) => info!(event = event.name(), payload = %payload, "Site event"),
            Err(err) => warn!(event = event.name(), "Could not encode site event: {err}"),
        }
    }
}

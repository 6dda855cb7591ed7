use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{GatewayError, GatewayResult};
use crate::storage::EventStore;
use crate::telemetry::metric_inc_reason;
use crate::types::{
    DeadLetterEvent, DeadLetterId, EventAttempt, EventId, EventStatus, StoreSummary, TenantId,
    WebhookEvent,
};

pub const DEFAULT_LIST_LIMIT: usize = 50;
const RECENT_EVENTS_IN_METRICS: usize = 10;

/// Counts and rates reported by `GET /admin/metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_events: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    pub processing: u64,
    pub dead_letter: u64,
    pub average_retries: f64,

    /// Delivered share of all events, as a percentage.
    pub success_rate: f64,
}

impl From<StoreSummary> for MetricsSummary {
    fn from(s: StoreSummary) -> Self {
        let success_rate = if s.total == 0 {
            0.0
        } else {
            s.delivered as f64 / s.total as f64 * 100.0
        };
        Self {
            total_events: s.total,
            delivered: s.delivered,
            failed: s.failed,
            pending: s.pending,
            processing: s.processing,
            dead_letter: s.dead_letter,
            average_retries: round2(s.average_retries),
            success_rate: round2(success_rate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventView {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub status: EventStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl EventView {
    fn summary(event: &WebhookEvent) -> Self {
        Self {
            delivered_at: None,
            ..Self::detailed(event)
        }
    }

    fn detailed(event: &WebhookEvent) -> Self {
        Self {
            id: event.id,
            tenant_id: event.tenant_id.clone(),
            event_type: event.event_type.clone(),
            status: event.status,
            retry_count: event.retry_count,
            created_at: event.created_at,
            delivered_at: event.delivered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub summary: MetricsSummary,
    pub recent_events: Vec<EventView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventList {
    pub events: Vec<EventView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptView {
    pub attempt_number: u32,
    pub status: &'static str,
    pub response_code: Option<u16>,
    pub error_message: Option<String>,

    /// Seconds of backoff waited before this attempt.
    pub retry_delay: u64,

    pub attempted_at: DateTime<Utc>,
}

impl From<EventAttempt> for AttemptView {
    fn from(a: EventAttempt) -> Self {
        Self {
            attempt_number: a.attempt_number,
            status: a.status.as_str(),
            response_code: a.response_code,
            error_message: a.error_message,
            retry_delay: a.retry_delay.as_secs(),
            attempted_at: a.attempted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptHistory {
    pub event_id: EventId,
    pub status: EventStatus,
    pub retry_count: u32,
    pub attempts: Vec<AttemptView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterView {
    pub id: DeadLetterId,
    pub webhook_event_id: EventId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub failure_reason: String,
    pub retry_count: u32,
    pub replayed: bool,
    pub replayed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<DeadLetterEvent> for DeadLetterView {
    fn from(d: DeadLetterEvent) -> Self {
        Self {
            id: d.id,
            webhook_event_id: d.event_id,
            tenant_id: d.tenant_id,
            event_type: d.event_type,
            failure_reason: d.failure_reason,
            retry_count: d.retry_count,
            replayed: d.replayed,
            replayed_at: d.replayed_at,
            created_at: d.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterList {
    pub dead_letters: Vec<DeadLetterView>,
}

/// Result of a manual replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReceipt {
    pub status: &'static str,

    /// The event that is now `pending`.
    pub event_id: EventId,

    /// Source event, set when a dead letter was cloned into a new event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_id: Option<EventId>,
}

/// Read and replay operations over the event store.
pub struct AdminService {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
}

impl AdminService {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn metrics(&self, tenant_id: Option<&TenantId>) -> GatewayResult<MetricsReport> {
        let summary = self.store.summarize(tenant_id).await?;
        let recent = self
            .store
            .recent_events(tenant_id, RECENT_EVENTS_IN_METRICS)
            .await?;

        Ok(MetricsReport {
            summary: summary.into(),
            recent_events: recent.iter().map(EventView::summary).collect(),
        })
    }

    pub async fn events(&self, tenant_id: Option<&TenantId>, limit: usize) -> GatewayResult<EventList> {
        let events = self.store.recent_events(tenant_id, limit).await?;
        Ok(EventList {
            events: events.iter().map(EventView::detailed).collect(),
        })
    }

    pub async fn dead_letters(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> GatewayResult<DeadLetterList> {
        let dead_letters = self.store.list_dead_letters(tenant_id, limit).await?;
        Ok(DeadLetterList {
            dead_letters: dead_letters.into_iter().map(DeadLetterView::from).collect(),
        })
    }

    pub async fn attempts(&self, id: EventId) -> GatewayResult<AttemptHistory> {
        let event = self
            .store
            .get_event(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Event".to_string()))?;
        let attempts = self.store.list_attempts(id).await?;

        Ok(AttemptHistory {
            event_id: event.id,
            status: event.status,
            retry_count: event.retry_count,
            attempts: attempts.into_iter().map(AttemptView::from).collect(),
        })
    }

    /// Requeue `id` for delivery.
    ///
    /// `id` is tried as a dead-letter id first: a match is cloned into a
    /// fresh `pending` event. Otherwise it is taken as an event id and
    /// that event is reset to `pending` in place.
    pub async fn replay(&self, id: i64) -> GatewayResult<ReplayReceipt> {
        let now = self.clock.now();

        if let Some(dead_letter) = self.store.get_dead_letter(DeadLetterId(id)).await? {
            if let Some(event_id) = self.store.replay_dead_letter(dead_letter.id, now).await? {
                tracing::info!(
                    target: "webhook_admin",
                    dead_letter_id = %dead_letter.id,
                    original_id = %dead_letter.event_id,
                    event_id = %event_id,
                    already_replayed = dead_letter.replayed,
                    "dead letter replayed as new event"
                );
                metric_inc_reason("webhook.replay.total", "dead_letter");
                return Ok(ReplayReceipt {
                    status: "replayed",
                    event_id,
                    original_id: Some(dead_letter.event_id),
                });
            }
        }

        match self.store.requeue_event(EventId(id), now).await? {
            Some(event_id) => {
                tracing::info!(
                    target: "webhook_admin",
                    event_id = %event_id,
                    "event requeued in place"
                );
                metric_inc_reason("webhook.replay.total", "in_place");
                Ok(ReplayReceipt {
                    status: "replayed",
                    event_id,
                    original_id: None,
                })
            }
            None => Err(GatewayError::NotFound("Event".to_string())),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

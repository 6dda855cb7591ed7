use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::{GatewayError, GatewayResult};
use crate::rate_limiter::RateLimiter;
use crate::signing::verify_signature;
use crate::storage::EventStore;
use crate::telemetry::{metric_inc, metric_inc_reason, metric_inc_tenant};
use crate::types::{EventId, NewEvent, TenantId, UNKNOWN_EVENT_TYPE};

/// Answer returned to the webhook sender once the event is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub status: &'static str,
    pub event_id: EventId,
    pub rate_limit_remaining: u32,
}

/// Verify, admit and persist inbound webhooks.
///
/// Never calls the sink: delivery happens later on the worker.
pub struct Ingestor {
    secret: Vec<u8>,
    destination: String,
    rate_limiter: Arc<RateLimiter>,
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        destination: impl Into<String>,
        rate_limiter: Arc<RateLimiter>,
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secret: secret.into(),
            destination: destination.into(),
            rate_limiter,
            store,
            clock,
        }
    }

    /// Run one request through the pipeline.
    ///
    /// Each rejection leaves the store untouched. Signature is checked
    /// first, then the tenant quota, then the JSON body, so a request
    /// with a bad signature never consumes quota.
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        tenant_header: Option<&str>,
    ) -> GatewayResult<IngestReceipt> {
        if !verify_signature(raw_body, signature, &self.secret) {
            tracing::warn!(target: "webhook_ingest", "rejected webhook with invalid signature");
            metric_inc_reason("webhook.ingest.rejected", "signature");
            return Err(GatewayError::Unauthorized);
        }

        let tenant_id = TenantId::from_header(tenant_header);
        let limit = self.rate_limiter.limit_for(&tenant_id).await;
        let window = self.rate_limiter.window();
        let decision = self.rate_limiter.check(&tenant_id, limit, window).await;
        if !decision.allowed {
            tracing::warn!(
                target: "webhook_ingest",
                tenant_id = %tenant_id,
                limit,
                "rate limit exceeded"
            );
            metric_inc_reason("webhook.ingest.rejected", "rate_limit");
            metric_inc_tenant("webhook.ingest.rate_limited", &tenant_id);
            return Err(GatewayError::RateLimited {
                limit,
                window_secs: window.as_secs(),
            });
        }

        let payload: serde_json::Value = serde_json::from_slice(raw_body).map_err(|e| {
            tracing::warn!(
                target: "webhook_ingest",
                tenant_id = %tenant_id,
                error = %e,
                "rejected webhook with invalid JSON"
            );
            metric_inc_reason("webhook.ingest.rejected", "validation");
            GatewayError::Validation("Invalid JSON payload".to_string())
        })?;

        let event_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or(UNKNOWN_EVENT_TYPE)
            .to_string();

        let event = self
            .store
            .insert_event(NewEvent {
                tenant_id: tenant_id.clone(),
                event_type,
                payload,
                raw_body: String::from_utf8_lossy(raw_body).into_owned(),
                signature: signature.map(str::to_string),
                destination: self.destination.clone(),
                created_at: self.clock.now(),
            })
            .await?;

        tracing::info!(
            target: "webhook_ingest",
            event_id = %event.id,
            tenant_id = %tenant_id,
            event_type = %event.event_type,
            remaining = decision.remaining,
            "accepted webhook"
        );
        metric_inc("webhook.ingest.accepted");

        Ok(IngestReceipt {
            status: "received",
            event_id: event.id,
            rate_limit_remaining: decision.remaining,
        })
    }
}

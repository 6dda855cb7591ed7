use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::error::{DeliveryFailure, StoreError};
use crate::sink::{Sink, SinkResponse};
use crate::storage::EventStore;
use crate::telemetry::{metric_inc, metric_inc_tenant};
use crate::types::{AttemptStatus, EventId, NewAttempt, Resolution, WebhookEvent};

const RESPONSE_BODY_EXCERPT: usize = 1000;
const ERROR_MESSAGE_EXCERPT: usize = 1000;
const LAST_ERROR_EXCERPT: usize = 500;

/// Shared, read-only context for every delivery task.
pub struct WorkerContext {
    pub store: Arc<dyn EventStore>,
    pub sink: Arc<dyn Sink>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryPolicy,

    /// Bound on one sink call, whatever the sink implementation.
    pub delivery_timeout: Duration,

    /// Maximum events dispatched per poll cycle.
    pub batch_size: usize,

    pub poll_interval: Duration,
}

/// What happened to one event in one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Delivered,
    RetryScheduled { retry_count: u32, delay: Duration },
    DeadLettered { retry_count: u32 },

    /// Not claimable: gone, terminal, already claimed or not yet due.
    Skipped,

    /// The event stopped being `processing` while the sink call was in
    /// flight, typically through an administrative replay. Nothing was
    /// recorded for this attempt.
    ClaimLost,
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Delivered => self.delivered += 1,
            EventOutcome::RetryScheduled { .. } => self.retried += 1,
            EventOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            EventOutcome::Skipped | EventOutcome::ClaimLost => self.skipped += 1,
        }
    }
}

/// Polls the store for due events and forwards them to the sink.
///
/// Each cycle dispatches at most `batch_size` deliveries concurrently and
/// waits for all of them before the next poll. Backoff is never slept in
/// a delivery task: a failed event is written back as `pending` with a
/// due-time and picked up by a later cycle.
pub struct DeliveryWorker {
    ctx: Arc<WorkerContext>,
}

impl DeliveryWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self::shared(Arc::new(ctx))
    }

    pub fn shared(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Run one poll cycle to completion.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let now = self.ctx.clock.now();
        let due = self.ctx.store.due_events(now, self.ctx.batch_size).await?;

        let mut report = CycleReport {
            selected: due.len(),
            ..CycleReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        tracing::debug!(target: "webhook_delivery", batch = due.len(), "dispatching due events");

        let mut tasks = JoinSet::new();
        for id in due {
            let ctx = self.ctx.clone();
            tasks.spawn(async move { (id, process_event(id, &ctx).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(&outcome),
                Ok((id, Err(e))) => {
                    report.errors += 1;
                    tracing::error!(
                        target: "webhook_delivery",
                        event_id = %id,
                        error = %e,
                        "store error while delivering event"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(target: "webhook_delivery", error = %e, "delivery task aborted");
                }
            }
        }

        Ok(report)
    }

    /// Start the polling loop on the runtime.
    ///
    /// The loop stops starting new cycles once [`WorkerHandle::shutdown`]
    /// is called; a cycle already running is allowed to finish.
    pub fn spawn(self) -> WorkerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let notify = Arc::new(Notify::new());

        let loop_running = running.clone();
        let loop_notify = notify.clone();
        let handle = tokio::spawn(async move {
            self.log_stuck_processing().await;
            tracing::info!(
                target: "webhook_delivery",
                poll_interval_ms = self.ctx.poll_interval.as_millis() as u64,
                batch_size = self.ctx.batch_size,
                "delivery worker started"
            );

            while loop_running.load(Ordering::SeqCst) {
                match self.run_cycle().await {
                    Ok(report) if report.selected > 0 => {
                        tracing::debug!(target: "webhook_delivery", ?report, "poll cycle finished");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(target: "webhook_delivery", error = %e, "poll cycle failed");
                    }
                }

                if !loop_running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = loop_notify.notified() => {}
                    _ = tokio::time::sleep(self.ctx.poll_interval) => {}
                }
            }

            tracing::info!(target: "webhook_delivery", "delivery worker stopped");
        });

        WorkerHandle {
            running,
            notify,
            handle: Some(handle),
        }
    }

    // TODO: reclaim events stranded in `processing` after a crash once a
    // lease expiry policy is decided; for now they are only reported.
    async fn log_stuck_processing(&self) {
        match self.ctx.store.summarize(None).await {
            Ok(summary) if summary.processing > 0 => {
                tracing::warn!(
                    target: "webhook_delivery",
                    count = summary.processing,
                    "events left in processing; replay them to requeue"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(target: "webhook_delivery", error = %e, "failed to inspect store");
            }
        }
    }
}

/// Lifecycle handle for a spawned [`DeliveryWorker`].
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop polling and wait for the in-flight cycle to drain.
    pub async fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Attempt delivery of a single event.
pub async fn process_event(id: EventId, ctx: &WorkerContext) -> Result<EventOutcome, StoreError> {
    let now = ctx.clock.now();
    let Some(event) = ctx.store.claim(id, now).await? else {
        tracing::debug!(target: "webhook_delivery", event_id = %id, "event not claimable, skipping");
        return Ok(EventOutcome::Skipped);
    };

    let attempt_number = event.retry_count + 1;
    let retry_delay = ctx.retry.delay_before_attempt(attempt_number);

    let result = match tokio::time::timeout(
        ctx.delivery_timeout,
        ctx.sink.forward(&event.destination, &event.payload),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DeliveryFailure::Timeout),
    };
    let attempted_at = ctx.clock.now();

    let failure = match result {
        Ok(response) if response.is_success() => {
            let attempt = NewAttempt {
                attempt_number,
                status: AttemptStatus::Success,
                response_code: Some(response.status),
                response_body: Some(excerpt(&response.body, RESPONSE_BODY_EXCERPT)),
                error_message: None,
                retry_delay,
                attempted_at,
            };
            if !ctx
                .store
                .finish_attempt(
                    id,
                    event.claim_token,
                    attempt,
                    Resolution::Delivered { at: attempted_at },
                )
                .await?
            {
                return Ok(claim_lost(id));
            }

            tracing::info!(
                target: "webhook_delivery",
                event_id = %id,
                tenant_id = %event.tenant_id,
                attempt = attempt_number,
                status = response.status,
                "event delivered"
            );
            metric_inc("webhook.delivery.success");
            metric_inc_tenant("webhook.delivery.success.tenant", &event.tenant_id);
            return Ok(EventOutcome::Delivered);
        }
        Ok(SinkResponse { status, body }) => DeliveryFailure::Status { code: status, body },
        Err(failure) => failure,
    };

    record_failure(&event, failure, attempt_number, retry_delay, attempted_at, ctx).await
}

async fn record_failure(
    event: &WebhookEvent,
    failure: DeliveryFailure,
    attempt_number: u32,
    retry_delay: Duration,
    attempted_at: DateTime<Utc>,
    ctx: &WorkerContext,
) -> Result<EventOutcome, StoreError> {
    let (response_code, response_body, last_error) = match &failure {
        DeliveryFailure::Status { code, body } => (
            Some(*code),
            Some(excerpt(body, RESPONSE_BODY_EXCERPT)),
            format!("HTTP {code}: {}", excerpt(body, LAST_ERROR_EXCERPT)),
        ),
        other => (None, None, excerpt(&other.to_string(), LAST_ERROR_EXCERPT)),
    };

    let attempt = NewAttempt {
        attempt_number,
        status: AttemptStatus::Failed,
        response_code,
        response_body,
        error_message: Some(excerpt(&failure.to_string(), ERROR_MESSAGE_EXCERPT)),
        retry_delay,
        attempted_at,
    };

    metric_inc("webhook.delivery.failure");
    metric_inc_tenant("webhook.delivery.failure.tenant", &event.tenant_id);

    let retry_count = event.retry_count + 1;

    if ctx.retry.is_exhausted(retry_count) {
        let resolution = Resolution::DeadLetter {
            retry_count,
            last_error: last_error.clone(),
            at: attempted_at,
        };
        let applied = ctx
            .store
            .finish_attempt(event.id, event.claim_token, attempt, resolution)
            .await?;
        if !applied {
            return Ok(claim_lost(event.id));
        }

        tracing::info!(
            target: "webhook_delivery",
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            retry_count,
            error = %last_error,
            "retry budget exhausted, event dead-lettered"
        );
        metric_inc("webhook.dlq.inserted");
        return Ok(EventOutcome::DeadLettered { retry_count });
    }

    let delay = ctx.retry.delay_after_failure(retry_count);
    let wait = chrono::Duration::from_std(delay + ctx.retry.jitter())
        .unwrap_or_else(|_| chrono::Duration::MAX);
    let next_attempt_at = attempted_at
        .checked_add_signed(wait)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let resolution = Resolution::Retry {
        retry_count,
        last_error: last_error.clone(),
        next_attempt_at,
    };
    let applied = ctx
        .store
        .finish_attempt(event.id, event.claim_token, attempt, resolution)
        .await?;
    if !applied {
        return Ok(claim_lost(event.id));
    }

    tracing::warn!(
        target: "webhook_delivery",
        event_id = %event.id,
        tenant_id = %event.tenant_id,
        attempt = attempt_number,
        retry_count,
        delay_ms = delay.as_millis() as u64,
        error = %last_error,
        "delivery failed, retry scheduled"
    );
    metric_inc("webhook.delivery.retry_scheduled");
    Ok(EventOutcome::RetryScheduled { retry_count, delay })
}

fn claim_lost(id: EventId) -> EventOutcome {
    tracing::warn!(
        target: "webhook_delivery",
        event_id = %id,
        "event left processing during delivery; attempt discarded"
    );
    EventOutcome::ClaimLost
}

/// First `max` characters of `text`.
fn excerpt(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

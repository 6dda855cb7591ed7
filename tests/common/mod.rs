#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use webhook_gateway::{
    signature_header, ClaimToken, Clock, DeadLetterEvent, DeadLetterId, DeliveryFailure,
    EventAttempt, EventId, EventStore, Gateway, GatewayConfig, InMemoryEventStore, NewAttempt,
    NewEvent, Resolution, Sink, SinkResponse, StoreError, StoreSummary, TenantId, WebhookEvent,
};

pub const SECRET: &str = "test-secret";
pub const SINK_URL: &str = "http://sink.test/internal/webhook";

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

type Reply = Result<SinkResponse, DeliveryFailure>;

/// Sink that answers from a script, then falls back to a fixed reply.
pub struct ScriptedSink {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedSink {
    pub fn always(reply: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: reply,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn ok() -> Self {
        Self::always(Ok(status(200, "ok")))
    }

    pub fn failing() -> Self {
        Self::always(Ok(status(500, "boom")))
    }

    /// Play `replies` in order, then answer 200.
    pub fn sequence(replies: Vec<Reply>) -> Self {
        let sink = Self::ok();
        *sink.script.lock().unwrap() = replies.into();
        sink
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn status(code: u16, body: &str) -> SinkResponse {
    SinkResponse {
        status: code,
        body: body.to_string(),
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    async fn forward(&self, url: &str, payload: &Value) -> Result<SinkResponse, DeliveryFailure> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Sink that holds every call until the test releases it.
pub struct GatedSink {
    pub entered: Notify,
    started: AtomicUsize,
    finished: AtomicUsize,
    gate: Semaphore,
}

impl GatedSink {
    pub fn new() -> Self {
        Self {
            entered: Notify::new(),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    /// Let `calls` held calls return 200.
    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for GatedSink {
    async fn forward(&self, _url: &str, _payload: &Value) -> Result<SinkResponse, DeliveryFailure> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.gate.acquire().await.unwrap().forget();
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(status(200, "ok"))
    }
}

/// Sink that never answers.
pub struct HangingSink;

#[async_trait]
impl Sink for HangingSink {
    async fn forward(&self, _url: &str, _payload: &Value) -> Result<SinkResponse, DeliveryFailure> {
        std::future::pending().await
    }
}

/// In-memory store whose first `failures` polls for due events error out.
pub struct FlakyStore {
    inner: InMemoryEventStore,
    failures: AtomicUsize,
    polls: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_polls(failures: usize) -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            failures: AtomicUsize::new(failures),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn insert_event(&self, event: NewEvent) -> Result<WebhookEvent, StoreError> {
        self.inner.insert_event(event).await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError> {
        self.inner.get_event(id).await
    }

    async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventId>, StoreError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.due_events(now, limit).await
    }

    async fn claim(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<WebhookEvent>, StoreError> {
        self.inner.claim(id, now).await
    }

    async fn finish_attempt(
        &self,
        id: EventId,
        token: ClaimToken,
        attempt: NewAttempt,
        resolution: Resolution,
    ) -> Result<bool, StoreError> {
        self.inner.finish_attempt(id, token, attempt, resolution).await
    }

    async fn list_attempts(&self, id: EventId) -> Result<Vec<EventAttempt>, StoreError> {
        self.inner.list_attempts(id).await
    }

    async fn recent_events(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        self.inner.recent_events(tenant_id, limit).await
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEvent>, StoreError> {
        self.inner.get_dead_letter(id).await
    }

    async fn list_dead_letters(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>, StoreError> {
        self.inner.list_dead_letters(tenant_id, limit).await
    }

    async fn replay_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> Result<Option<EventId>, StoreError> {
        self.inner.replay_dead_letter(id, now).await
    }

    async fn requeue_event(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<EventId>, StoreError> {
        self.inner.requeue_event(id, now).await
    }

    async fn summarize(&self, tenant_id: Option<&TenantId>) -> Result<StoreSummary, StoreError> {
        self.inner.summarize(tenant_id).await
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        webhook_secret: SECRET.to_string(),
        forward_url: SINK_URL.to_string(),
        worker_poll_interval: Duration::from_millis(10),
        ..GatewayConfig::default()
    }
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub store: Arc<InMemoryEventStore>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(config: GatewayConfig, sink: Arc<dyn Sink>) -> Harness {
    let store = Arc::new(InMemoryEventStore::new());
    let clock = Arc::new(ManualClock::new());
    let gateway = Arc::new(Gateway::new(config, store.clone(), sink, clock.clone()));
    Harness {
        gateway,
        store,
        clock,
    }
}

pub fn sign(body: &[u8]) -> String {
    signature_header(SECRET.as_bytes(), body).unwrap()
}

impl Harness {
    /// Accept a signed webhook for `tenant` and return its event id.
    pub async fn ingest(&self, tenant: &str, body: &str) -> EventId {
        let sig = sign(body.as_bytes());
        self.gateway
            .ingestor()
            .ingest(body.as_bytes(), Some(&sig), Some(tenant))
            .await
            .unwrap()
            .event_id
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn event(&self, id: EventId) -> WebhookEvent {
        self.store.get_event(id).await.unwrap().unwrap()
    }
}

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    AttemptId, ClaimToken, DeadLetterEvent, DeadLetterId, EventAttempt, EventId, EventStatus,
    NewAttempt, NewEvent, Resolution, StoreSummary, TenantId, WebhookEvent,
};

/// Durable record of webhook events, their attempts and dead letters.
///
/// The store doubles as the delivery queue: the worker polls it for due
/// `pending` events. Every method is a single atomic unit; a method that
/// touches several records either applies all of them or none.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new `pending` event due immediately.
    async fn insert_event(&self, event: NewEvent) -> Result<WebhookEvent, StoreError>;

    async fn get_event(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError>;

    /// Ids of up to `limit` events that are `pending` and due at `now`,
    /// oldest first.
    async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventId>, StoreError>;

    /// Move a due `pending` event to `processing` under a fresh
    /// [`ClaimToken`] and return it.
    ///
    /// Returns `None` if the event is gone, not pending or not yet due, so
    /// at most one caller can hold a given event at a time.
    async fn claim(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<WebhookEvent>, StoreError>;

    /// Append `attempt` and apply `resolution` to an event this caller
    /// claimed with `token`.
    ///
    /// Returns `false` without writing anything if the event is no longer
    /// `processing` or has been claimed again since.
    async fn finish_attempt(
        &self,
        id: EventId,
        token: ClaimToken,
        attempt: NewAttempt,
        resolution: Resolution,
    ) -> Result<bool, StoreError>;

    /// Attempts for `id` ordered by attempt number.
    async fn list_attempts(&self, id: EventId) -> Result<Vec<EventAttempt>, StoreError>;

    /// Most recent events first.
    async fn recent_events(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEvent>, StoreError>;

    /// Most recent dead letters first.
    async fn list_dead_letters(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>, StoreError>;

    /// Clone a dead letter into a fresh `pending` event and mark the dead
    /// letter replayed. Returns the new event id, or `None` if `id` is
    /// unknown.
    async fn replay_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> Result<Option<EventId>, StoreError>;

    /// Reset an existing event to `pending` with no retries and no error.
    /// Returns `None` if `id` is unknown.
    async fn requeue_event(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<EventId>, StoreError>;

    /// Counts by status and dead letters, optionally for one tenant.
    async fn summarize(&self, tenant_id: Option<&TenantId>) -> Result<StoreSummary, StoreError>;
}

#[derive(Default)]
struct Tables {
    events: BTreeMap<EventId, WebhookEvent>,
    attempts: HashMap<EventId, Vec<EventAttempt>>,
    dead_letters: BTreeMap<DeadLetterId, DeadLetterEvent>,
    next_event_id: i64,
    next_attempt_id: i64,
    next_dead_letter_id: i64,
}

impl Tables {
    fn next_event_id(&mut self) -> EventId {
        self.next_event_id += 1;
        EventId(self.next_event_id)
    }

    fn next_attempt_id(&mut self) -> AttemptId {
        self.next_attempt_id += 1;
        AttemptId(self.next_attempt_id)
    }

    fn next_dead_letter_id(&mut self) -> DeadLetterId {
        self.next_dead_letter_id += 1;
        DeadLetterId(self.next_dead_letter_id)
    }

    fn push_event(&mut self, new: NewEvent) -> WebhookEvent {
        let id = self.next_event_id();
        let event = WebhookEvent {
            id,
            tenant_id: new.tenant_id,
            event_type: new.event_type,
            payload: new.payload,
            raw_body: new.raw_body,
            signature: new.signature,
            status: EventStatus::Pending,
            retry_count: 0,
            last_error: None,
            destination: new.destination,
            created_at: new.created_at,
            delivered_at: None,
            next_attempt_at: new.created_at,
            claim_token: ClaimToken::default(),
        };
        self.events.insert(id, event.clone());
        event
    }
}

/// In-memory event store for tests and single-process deployments.
///
/// All tables live behind one lock so multi-record writes are atomic.
#[derive(Default)]
pub struct InMemoryEventStore {
    tables: Mutex<Tables>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert_event(&self, event: NewEvent) -> Result<WebhookEvent, StoreError> {
        Ok(self.tables.lock().await.push_event(event))
    }

    async fn get_event(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.tables.lock().await.events.get(&id).cloned())
    }

    async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .events
            .values()
            .filter(|e| e.is_due(now))
            .take(limit)
            .map(|e| e.id)
            .collect())
    }

    async fn claim(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<WebhookEvent>, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(event) = tables.events.get_mut(&id) else {
            return Ok(None);
        };
        if !event.is_due(now) {
            return Ok(None);
        }
        event.status = EventStatus::Processing;
        event.claim_token = ClaimToken(event.claim_token.0 + 1);
        Ok(Some(event.clone()))
    }

    async fn finish_attempt(
        &self,
        id: EventId,
        token: ClaimToken,
        attempt: NewAttempt,
        resolution: Resolution,
    ) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;
        match tables.events.get(&id) {
            Some(event)
                if event.status == EventStatus::Processing && event.claim_token == token => {}
            _ => return Ok(false),
        }

        let attempt_id = tables.next_attempt_id();
        let dead_letter_id = match resolution {
            Resolution::DeadLetter { .. } => Some(tables.next_dead_letter_id()),
            _ => None,
        };

        let Some(event) = tables.events.get_mut(&id) else {
            return Ok(false);
        };

        let mut dead_letter = None;
        match resolution {
            Resolution::Delivered { at } => {
                event.status = EventStatus::Delivered;
                event.delivered_at = Some(at);
            }
            Resolution::Retry {
                retry_count,
                last_error,
                next_attempt_at,
            } => {
                event.status = EventStatus::Pending;
                event.retry_count = retry_count;
                event.last_error = Some(last_error);
                event.next_attempt_at = next_attempt_at;
            }
            Resolution::DeadLetter {
                retry_count,
                last_error,
                at,
            } => {
                event.status = EventStatus::Failed;
                event.retry_count = retry_count;
                event.last_error = Some(last_error.clone());
                if let Some(dl_id) = dead_letter_id {
                    dead_letter = Some(DeadLetterEvent {
                        id: dl_id,
                        event_id: id,
                        tenant_id: event.tenant_id.clone(),
                        event_type: event.event_type.clone(),
                        payload: event.payload.clone(),
                        raw_body: event.raw_body.clone(),
                        failure_reason: last_error,
                        retry_count,
                        created_at: at,
                        replayed: false,
                        replayed_at: None,
                    });
                }
            }
        }

        if let Some(dl) = dead_letter {
            tables.dead_letters.insert(dl.id, dl);
        }

        tables.attempts.entry(id).or_default().push(EventAttempt {
            id: attempt_id,
            event_id: id,
            attempt_number: attempt.attempt_number,
            status: attempt.status,
            response_code: attempt.response_code,
            response_body: attempt.response_body,
            error_message: attempt.error_message,
            retry_delay: attempt.retry_delay,
            attempted_at: attempt.attempted_at,
        });

        Ok(true)
    }

    async fn list_attempts(&self, id: EventId) -> Result<Vec<EventAttempt>, StoreError> {
        let tables = self.tables.lock().await;
        let mut attempts = tables.attempts.get(&id).cloned().unwrap_or_default();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn recent_events(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .events
            .values()
            .rev()
            .filter(|e| tenant_id.map_or(true, |t| &e.tenant_id == t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEvent>, StoreError> {
        Ok(self.tables.lock().await.dead_letters.get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .dead_letters
            .values()
            .rev()
            .filter(|d| tenant_id.map_or(true, |t| &d.tenant_id == t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> Result<Option<EventId>, StoreError> {
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;
        let Some(dead_letter) = tables.dead_letters.get_mut(&id) else {
            return Ok(None);
        };
        dead_letter.replayed = true;
        dead_letter.replayed_at = Some(now);

        let source = tables.events.get(&dead_letter.event_id);
        let new = NewEvent {
            tenant_id: dead_letter.tenant_id.clone(),
            event_type: dead_letter.event_type.clone(),
            payload: dead_letter.payload.clone(),
            raw_body: dead_letter.raw_body.clone(),
            signature: source.and_then(|e| e.signature.clone()),
            destination: source.map(|e| e.destination.clone()).unwrap_or_default(),
            created_at: now,
        };

        Ok(Some(tables.push_event(new).id))
    }

    async fn requeue_event(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<EventId>, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(event) = tables.events.get_mut(&id) else {
            return Ok(None);
        };
        event.status = EventStatus::Pending;
        event.retry_count = 0;
        event.last_error = None;
        event.delivered_at = None;
        event.next_attempt_at = now;
        Ok(Some(id))
    }

    async fn summarize(&self, tenant_id: Option<&TenantId>) -> Result<StoreSummary, StoreError> {
        let tables = self.tables.lock().await;
        let mut summary = StoreSummary::default();

        for event in tables
            .events
            .values()
            .filter(|e| tenant_id.map_or(true, |t| &e.tenant_id == t))
        {
            summary.total += 1;
            match event.status {
                EventStatus::Pending => summary.pending += 1,
                EventStatus::Processing => summary.processing += 1,
                EventStatus::Delivered => summary.delivered += 1,
                EventStatus::Failed => summary.failed += 1,
            }
        }

        summary.dead_letter = tables
            .dead_letters
            .values()
            .filter(|d| tenant_id.map_or(true, |t| &d.tenant_id == t))
            .count() as u64;

        if !tables.events.is_empty() {
            let retries: u64 = tables.events.values().map(|e| u64::from(e.retry_count)).sum();
            summary.average_retries = retries as f64 / tables.events.len() as f64;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttemptStatus;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;

    fn new_event(tenant: &str, created_at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            tenant_id: TenantId::new(tenant),
            event_type: "order.created".to_string(),
            payload: json!({"type": "order.created"}),
            raw_body: r#"{"type":"order.created"}"#.to_string(),
            signature: Some("sha256=abc".to_string()),
            destination: "http://sink.local/hook".to_string(),
            created_at,
        }
    }

    fn failed_attempt(n: u32, at: DateTime<Utc>) -> NewAttempt {
        NewAttempt {
            attempt_number: n,
            status: AttemptStatus::Failed,
            response_code: Some(500),
            response_body: Some("boom".into()),
            error_message: Some("HTTP 500".into()),
            retry_delay: Duration::ZERO,
            attempted_at: at,
        }
    }

    #[tokio::test]
    async fn test_insert_is_pending_and_due() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store.insert_event(new_event("t1", now)).await.unwrap();

        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert!(event.delivered_at.is_none());
        assert_eq!(store.due_events(now, 10).await.unwrap(), vec![event.id]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store.insert_event(new_event("t1", now)).await.unwrap();

        let first = store.claim(event.id, now).await.unwrap();
        assert_eq!(first.unwrap().status, EventStatus::Processing);
        assert!(store.claim(event.id, now).await.unwrap().is_none());
        assert!(store.due_events(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_is_not_due_before_next_attempt_at() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store.insert_event(new_event("t1", now)).await.unwrap();
        let claimed = store.claim(event.id, now).await.unwrap().unwrap();

        let due_at = now + ChronoDuration::seconds(4);
        let applied = store
            .finish_attempt(
                event.id,
                claimed.claim_token,
                failed_attempt(1, now),
                Resolution::Retry {
                    retry_count: 1,
                    last_error: "HTTP 500: boom".into(),
                    next_attempt_at: due_at,
                },
            )
            .await
            .unwrap();
        assert!(applied);

        assert!(store.due_events(now, 10).await.unwrap().is_empty());
        assert!(store.claim(event.id, now).await.unwrap().is_none());
        assert_eq!(store.due_events(due_at, 10).await.unwrap(), vec![event.id]);
    }

    #[tokio::test]
    async fn test_finish_without_claim_writes_nothing() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store.insert_event(new_event("t1", now)).await.unwrap();

        let applied = store
            .finish_attempt(
                event.id,
                event.claim_token,
                failed_attempt(1, now),
                Resolution::Delivered { at: now },
            )
            .await
            .unwrap();
        assert!(!applied);
        assert!(store.list_attempts(event.id).await.unwrap().is_empty());
        assert_eq!(
            store.get_event(event.id).await.unwrap().unwrap().status,
            EventStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_finish_after_reclaim() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store.insert_event(new_event("t1", now)).await.unwrap();

        let stale = store.claim(event.id, now).await.unwrap().unwrap();
        store.requeue_event(event.id, now).await.unwrap();
        let current = store.claim(event.id, now).await.unwrap().unwrap();
        assert_ne!(stale.claim_token, current.claim_token);

        let applied = store
            .finish_attempt(
                event.id,
                stale.claim_token,
                failed_attempt(1, now),
                Resolution::Delivered { at: now },
            )
            .await
            .unwrap();
        assert!(!applied);
        assert!(store.list_attempts(event.id).await.unwrap().is_empty());
        assert_eq!(
            store.get_event(event.id).await.unwrap().unwrap().status,
            EventStatus::Processing
        );

        let applied = store
            .finish_attempt(
                event.id,
                current.claim_token,
                failed_attempt(1, now),
                Resolution::Delivered { at: now },
            )
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(store.list_attempts(event.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_snapshot_is_written_with_failure() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store.insert_event(new_event("t1", now)).await.unwrap();
        let claimed = store.claim(event.id, now).await.unwrap().unwrap();

        store
            .finish_attempt(
                event.id,
                claimed.claim_token,
                failed_attempt(1, now),
                Resolution::DeadLetter {
                    retry_count: 1,
                    last_error: "HTTP 500: boom".into(),
                    at: now,
                },
            )
            .await
            .unwrap();

        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);

        let dead = store.list_dead_letters(None, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_id, event.id);
        assert_eq!(dead[0].failure_reason, "HTTP 500: boom");
        assert_eq!(dead[0].raw_body, event.raw_body);
        assert!(!dead[0].replayed);
    }

    #[tokio::test]
    async fn test_requeue_clears_delivery_state() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = store.insert_event(new_event("t1", now)).await.unwrap();
        let claimed = store.claim(event.id, now).await.unwrap().unwrap();
        store
            .finish_attempt(
                event.id,
                claimed.claim_token,
                failed_attempt(1, now),
                Resolution::Delivered { at: now },
            )
            .await
            .unwrap();

        let later = now + ChronoDuration::seconds(10);
        assert_eq!(store.requeue_event(event.id, later).await.unwrap(), Some(event.id));

        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert!(stored.delivered_at.is_none());
        assert_eq!(stored.next_attempt_at, later);
        assert!(store.requeue_event(EventId(999), later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_summary_filters_by_tenant_but_averages_globally() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let a = store.insert_event(new_event("a", now)).await.unwrap();
        store.insert_event(new_event("b", now)).await.unwrap();

        let claimed = store.claim(a.id, now).await.unwrap().unwrap();
        store
            .finish_attempt(
                a.id,
                claimed.claim_token,
                failed_attempt(1, now),
                Resolution::Retry {
                    retry_count: 1,
                    last_error: "x".into(),
                    next_attempt_at: now,
                },
            )
            .await
            .unwrap();

        let summary = store.summarize(Some(&TenantId::new("b"))).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.pending, 1);
        assert!((summary.average_retries - 0.5).abs() < f64::EPSILON);

        let empty = InMemoryEventStore::new().summarize(None).await.unwrap();
        assert_eq!(empty, StoreSummary::default());
    }

    #[tokio::test]
    async fn test_recent_events_newest_first() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let first = store.insert_event(new_event("t1", now)).await.unwrap();
        let second = store.insert_event(new_event("t2", now)).await.unwrap();
        let third = store.insert_event(new_event("t1", now)).await.unwrap();

        let ids: Vec<EventId> = store
            .recent_events(None, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![third.id, second.id]);

        let t1: Vec<EventId> = store
            .recent_events(Some(&TenantId::new("t1")), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(t1, vec![third.id, first.id]);
    }
}

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::storage::EventStore;
use crate::types::{
    AttemptId, AttemptStatus, ClaimToken, DeadLetterEvent, DeadLetterId, EventAttempt, EventId,
    EventStatus, NewAttempt, NewEvent, Resolution, StoreSummary, TenantId, WebhookEvent,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS webhook_events (
    id BIGSERIAL PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    raw_body TEXT NOT NULL,
    signature TEXT,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    destination TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    delivered_at TIMESTAMPTZ,
    next_attempt_at TIMESTAMPTZ NOT NULL,
    claim_token BIGINT NOT NULL DEFAULT 0
);
ALTER TABLE webhook_events ADD COLUMN IF NOT EXISTS claim_token BIGINT NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS webhook_events_due_idx
    ON webhook_events (status, next_attempt_at);
CREATE INDEX IF NOT EXISTS webhook_events_tenant_idx
    ON webhook_events (tenant_id);

CREATE TABLE IF NOT EXISTS event_attempts (
    id BIGSERIAL PRIMARY KEY,
    event_id BIGINT NOT NULL REFERENCES webhook_events (id),
    attempt_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    response_code INTEGER,
    response_body TEXT,
    error_message TEXT,
    retry_delay_ms BIGINT NOT NULL,
    attempted_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS event_attempts_event_idx
    ON event_attempts (event_id);

CREATE TABLE IF NOT EXISTS dead_letter_events (
    id BIGSERIAL PRIMARY KEY,
    event_id BIGINT NOT NULL REFERENCES webhook_events (id),
    tenant_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    raw_body TEXT NOT NULL,
    failure_reason TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    replayed BOOLEAN NOT NULL DEFAULT FALSE,
    replayed_at TIMESTAMPTZ
);
";

const EVENT_COLUMNS: &str = "id, tenant_id, event_type, payload, raw_body, signature, status, \
     retry_count, last_error, destination, created_at, delivered_at, next_attempt_at, claim_token";

const ATTEMPT_COLUMNS: &str = "id, event_id, attempt_number, status, response_code, \
     response_body, error_message, retry_delay_ms, attempted_at";

const DEAD_LETTER_COLUMNS: &str = "id, event_id, tenant_id, event_type, payload, raw_body, \
     failure_reason, retry_count, created_at, replayed, replayed_at";

/// Event store backed by PostgreSQL.
///
/// Multi-record writes run in a transaction; the claim is a single
/// conditional `UPDATE`.
pub struct PostgresEventStore {
    client: Mutex<Client>,
}

impl PostgresEventStore {
    /// Wrap a connected client, creating the tables if needed.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client.batch_execute(SCHEMA).await?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Connect to `url` without TLS and drive the connection on the runtime.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection closed");
            }
        });
        Self::new(client).await
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Serialization(format!("{field} out of range")))
}

fn to_u32(value: i32, field: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {field}")))
}

fn event_from_row(row: &Row) -> Result<WebhookEvent, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(WebhookEvent {
        id: EventId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        raw_body: row.try_get("raw_body")?,
        signature: row.try_get("signature")?,
        status: EventStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown event status {status}")))?,
        retry_count: to_u32(row.try_get("retry_count")?, "retry_count")?,
        last_error: row.try_get("last_error")?,
        destination: row.try_get("destination")?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claim_token: ClaimToken(row.try_get("claim_token")?),
    })
}

fn attempt_from_row(row: &Row) -> Result<EventAttempt, StoreError> {
    let status: String = row.try_get("status")?;
    let response_code: Option<i32> = row.try_get("response_code")?;
    let retry_delay_ms: i64 = row.try_get("retry_delay_ms")?;
    Ok(EventAttempt {
        id: AttemptId(row.try_get("id")?),
        event_id: EventId(row.try_get("event_id")?),
        attempt_number: to_u32(row.try_get("attempt_number")?, "attempt_number")?,
        status: AttemptStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown attempt status {status}")))?,
        response_code: response_code
            .map(|c| u16::try_from(c).map_err(|_| StoreError::Corrupt("response_code".into())))
            .transpose()?,
        response_body: row.try_get("response_body")?,
        error_message: row.try_get("error_message")?,
        retry_delay: Duration::from_millis(u64::try_from(retry_delay_ms).unwrap_or(0)),
        attempted_at: row.try_get("attempted_at")?,
    })
}

fn dead_letter_from_row(row: &Row) -> Result<DeadLetterEvent, StoreError> {
    Ok(DeadLetterEvent {
        id: DeadLetterId(row.try_get("id")?),
        event_id: EventId(row.try_get("event_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        raw_body: row.try_get("raw_body")?,
        failure_reason: row.try_get("failure_reason")?,
        retry_count: to_u32(row.try_get("retry_count")?, "retry_count")?,
        created_at: row.try_get("created_at")?,
        replayed: row.try_get("replayed")?,
        replayed_at: row.try_get("replayed_at")?,
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn count(row: &Row, idx: usize) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(idx)?;
    Ok(u64::try_from(value).unwrap_or(0))
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn insert_event(&self, event: NewEvent) -> Result<WebhookEvent, StoreError> {
        let client = self.client.lock().await;
        let sql = format!(
            "INSERT INTO webhook_events
                (tenant_id, event_type, payload, raw_body, signature, status,
                 retry_count, destination, created_at, next_attempt_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $7)
             RETURNING {EVENT_COLUMNS}"
        );
        let row = client
            .query_one(
                &sql,
                &[
                    &event.tenant_id.as_str(),
                    &event.event_type,
                    &event.payload,
                    &event.raw_body,
                    &event.signature,
                    &event.destination,
                    &event.created_at,
                ],
            )
            .await?;
        event_from_row(&row)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<WebhookEvent>, StoreError> {
        let client = self.client.lock().await;
        let sql = format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1");
        client
            .query_opt(&sql, &[&id.0])
            .await?
            .as_ref()
            .map(event_from_row)
            .transpose()
    }

    async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventId>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT id FROM webhook_events
                 WHERE status = 'pending' AND next_attempt_at <= $1
                 ORDER BY created_at, id
                 LIMIT $2",
                &[&now, &limit_param(limit)],
            )
            .await?;
        rows.iter()
            .map(|row| -> Result<EventId, StoreError> { Ok(EventId(row.try_get(0)?)) })
            .collect()
    }

    async fn claim(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<WebhookEvent>, StoreError> {
        let client = self.client.lock().await;
        let sql = format!(
            "UPDATE webhook_events SET status = 'processing', claim_token = claim_token + 1
             WHERE id = $1 AND status = 'pending' AND next_attempt_at <= $2
             RETURNING {EVENT_COLUMNS}"
        );
        client
            .query_opt(&sql, &[&id.0, &now])
            .await?
            .as_ref()
            .map(event_from_row)
            .transpose()
    }

    async fn finish_attempt(
        &self,
        id: EventId,
        token: ClaimToken,
        attempt: NewAttempt,
        resolution: Resolution,
    ) -> Result<bool, StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let sql = format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1 FOR UPDATE");
        let event = match tx.query_opt(&sql, &[&id.0]).await? {
            Some(row) => event_from_row(&row)?,
            None => return Ok(false),
        };
        if event.status != EventStatus::Processing || event.claim_token != token {
            return Ok(false);
        }

        let retry_delay_ms = i64::try_from(attempt.retry_delay.as_millis()).unwrap_or(i64::MAX);
        tx.execute(
            "INSERT INTO event_attempts
                (event_id, attempt_number, status, response_code, response_body,
                 error_message, retry_delay_ms, attempted_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &id.0,
                &to_i32(attempt.attempt_number, "attempt_number")?,
                &attempt.status.as_str(),
                &attempt.response_code.map(i32::from),
                &attempt.response_body,
                &attempt.error_message,
                &retry_delay_ms,
                &attempt.attempted_at,
            ],
        )
        .await?;

        match resolution {
            Resolution::Delivered { at } => {
                tx.execute(
                    "UPDATE webhook_events SET status = 'delivered', delivered_at = $2
                     WHERE id = $1",
                    &[&id.0, &at],
                )
                .await?;
            }
            Resolution::Retry {
                retry_count,
                last_error,
                next_attempt_at,
            } => {
                tx.execute(
                    "UPDATE webhook_events
                     SET status = 'pending', retry_count = $2, last_error = $3, next_attempt_at = $4
                     WHERE id = $1",
                    &[
                        &id.0,
                        &to_i32(retry_count, "retry_count")?,
                        &last_error,
                        &next_attempt_at,
                    ],
                )
                .await?;
            }
            Resolution::DeadLetter {
                retry_count,
                last_error,
                at,
            } => {
                let retry_count = to_i32(retry_count, "retry_count")?;
                tx.execute(
                    "UPDATE webhook_events
                     SET status = 'failed', retry_count = $2, last_error = $3
                     WHERE id = $1",
                    &[&id.0, &retry_count, &last_error],
                )
                .await?;
                tx.execute(
                    "INSERT INTO dead_letter_events
                        (event_id, tenant_id, event_type, payload, raw_body,
                         failure_reason, retry_count, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                    &[
                        &id.0,
                        &event.tenant_id.as_str(),
                        &event.event_type,
                        &event.payload,
                        &event.raw_body,
                        &last_error,
                        &retry_count,
                        &at,
                    ],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_attempts(&self, id: EventId) -> Result<Vec<EventAttempt>, StoreError> {
        let client = self.client.lock().await;
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM event_attempts
             WHERE event_id = $1 ORDER BY attempt_number, id"
        );
        let rows = client.query(&sql, &[&id.0]).await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn recent_events(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let client = self.client.lock().await;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events
             WHERE ($1::TEXT IS NULL OR tenant_id = $1)
             ORDER BY created_at DESC, id DESC
             LIMIT $2"
        );
        let rows = client
            .query(&sql, &[&tenant_id.map(TenantId::as_str), &limit_param(limit)])
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEvent>, StoreError> {
        let client = self.client.lock().await;
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_events WHERE id = $1");
        client
            .query_opt(&sql, &[&id.0])
            .await?
            .as_ref()
            .map(dead_letter_from_row)
            .transpose()
    }

    async fn list_dead_letters(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>, StoreError> {
        let client = self.client.lock().await;
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_events
             WHERE ($1::TEXT IS NULL OR tenant_id = $1)
             ORDER BY created_at DESC, id DESC
             LIMIT $2"
        );
        let rows = client
            .query(&sql, &[&tenant_id.map(TenantId::as_str), &limit_param(limit)])
            .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn replay_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> Result<Option<EventId>, StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_events WHERE id = $1 FOR UPDATE");
        let dead_letter = match tx.query_opt(&sql, &[&id.0]).await? {
            Some(row) => dead_letter_from_row(&row)?,
            None => return Ok(None),
        };

        let source = tx
            .query_opt(
                "SELECT signature, destination FROM webhook_events WHERE id = $1",
                &[&dead_letter.event_id.0],
            )
            .await?;
        let (signature, destination): (Option<String>, String) = match source {
            Some(row) => (row.try_get(0)?, row.try_get(1)?),
            None => (None, String::new()),
        };

        let row = tx
            .query_one(
                "INSERT INTO webhook_events
                    (tenant_id, event_type, payload, raw_body, signature, status,
                     retry_count, destination, created_at, next_attempt_at)
                 VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $7)
                 RETURNING id",
                &[
                    &dead_letter.tenant_id.as_str(),
                    &dead_letter.event_type,
                    &dead_letter.payload,
                    &dead_letter.raw_body,
                    &signature,
                    &destination,
                    &now,
                ],
            )
            .await?;
        let new_id = EventId(row.try_get(0)?);

        tx.execute(
            "UPDATE dead_letter_events SET replayed = TRUE, replayed_at = $2 WHERE id = $1",
            &[&id.0, &now],
        )
        .await?;

        tx.commit().await?;
        Ok(Some(new_id))
    }

    async fn requeue_event(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<EventId>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "UPDATE webhook_events
                 SET status = 'pending', retry_count = 0, last_error = NULL,
                     delivered_at = NULL, next_attempt_at = $2
                 WHERE id = $1
                 RETURNING id",
                &[&id.0, &now],
            )
            .await?;
        row.map(|r| -> Result<EventId, StoreError> { Ok(EventId(r.try_get(0)?)) })
            .transpose()
    }

    async fn summarize(&self, tenant_id: Option<&TenantId>) -> Result<StoreSummary, StoreError> {
        let client = self.client.lock().await;
        let tenant = tenant_id.map(TenantId::as_str);

        let counts = client
            .query_one(
                "SELECT COUNT(*),
                        COUNT(*) FILTER (WHERE status = 'pending'),
                        COUNT(*) FILTER (WHERE status = 'processing'),
                        COUNT(*) FILTER (WHERE status = 'delivered'),
                        COUNT(*) FILTER (WHERE status = 'failed')
                 FROM webhook_events
                 WHERE ($1::TEXT IS NULL OR tenant_id = $1)",
                &[&tenant],
            )
            .await?;
        let dead_letters = client
            .query_one(
                "SELECT COUNT(*) FROM dead_letter_events
                 WHERE ($1::TEXT IS NULL OR tenant_id = $1)",
                &[&tenant],
            )
            .await?;
        let average = client
            .query_one(
                "SELECT COALESCE(AVG(retry_count), 0)::FLOAT8 FROM webhook_events",
                &[],
            )
            .await?;

        Ok(StoreSummary {
            total: count(&counts, 0)?,
            pending: count(&counts, 1)?,
            processing: count(&counts, 2)?,
            delivered: count(&counts, 3)?,
            failed: count(&counts, 4)?,
            dead_letter: count(&dead_letters, 0)?,
            average_retries: average.try_get(0)?,
        })
    }
}

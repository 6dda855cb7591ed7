//! A multi-tenant webhook ingestion and relay gateway.
//!
//! Inbound webhooks are verified against a shared HMAC secret, admitted
//! through a per-tenant sliding-window rate limiter and persisted as
//! `pending` events. A background worker polls the store and forwards
//! due events to a single downstream sink, retrying with exponential
//! backoff and dead-lettering events that exhaust their retry budget.
//! An admin surface reports metrics and attempt history and can replay
//! failed events.
//!
//! ## Guarantees
//! - At-least-once delivery to the sink
//! - An attempt record and its state change are written atomically
//! - At most one worker task holds a given event at a time
//! - Exactly one dead-letter record per exhaustion
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Automatic recovery of events stranded in `processing` by a crash
//! - Rate-limit state shared across processes

mod admin;
mod clock;
mod config;
mod error;
mod gateway;
mod ingest;
mod rate_limiter;
mod server;
mod signing;
mod sink;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use admin::{
    AdminService, AttemptHistory, AttemptView, DeadLetterList, DeadLetterView, EventList,
    EventView, MetricsReport, MetricsSummary, ReplayReceipt, DEFAULT_LIST_LIMIT,
};
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, GatewayConfig, RetryPolicy, INSECURE_DEFAULT_SECRET};
pub use error::{DeliveryFailure, ErrorResponse, GatewayError, GatewayResult, StoreError};
pub use gateway::Gateway;
pub use ingest::{IngestReceipt, Ingestor};
pub use rate_limiter::{RateDecision, RateLimiter, RateLimiterStats};
pub use server::{router, TENANT_HEADER};
pub use signing::{
    compute_signature, signature_header, verify_signature, SIGNATURE_HEADER, SIGNATURE_PREFIX,
};
pub use sink::{Sink, SinkResponse};
pub use storage::{EventStore, InMemoryEventStore};
pub use telemetry::init_tracing;
pub use types::{
    AttemptId, AttemptStatus, ClaimToken, DeadLetterEvent, DeadLetterId, EventAttempt, EventId,
    EventStatus, NewAttempt, NewEvent, Resolution, StoreSummary, TenantId, WebhookEvent,
    DEFAULT_TENANT, UNKNOWN_EVENT_TYPE,
};
pub use worker::{process_event, CycleReport, DeliveryWorker, EventOutcome, WorkerContext, WorkerHandle};

#[cfg(feature = "http")]
pub use sink::HttpSink;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresEventStore;

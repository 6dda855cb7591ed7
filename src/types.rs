use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant used when a request carries no `X-Tenant-ID` header.
pub const DEFAULT_TENANT: &str = "default";

/// Event type used when the payload has no `type` field.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Unique identifier for a tenant.
///
/// Strongly typed so tenant ids are never mixed with event types
/// or other free-form strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolve an optional header value, falling back to [`DEFAULT_TENANT`].
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => Self(v.to_string()),
            _ => Self(DEFAULT_TENANT.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Surrogate key of a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

/// Surrogate key of a dead-letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub i64);

/// Surrogate key of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub i64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

/// Generation of an event's current claim.
///
/// Every claim bumps it; a completion is only applied while the event
/// still carries the token it was claimed with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(pub i64);

display_id!(EventId, DeadLetterId, AttemptId, ClaimToken);

/// Delivery lifecycle status of a webhook event.
///
/// `Delivered` and `Failed` are terminal until an administrator
/// replays the event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Delivered => "delivered",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "delivered" => Some(EventStatus::Delivered),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Delivered | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(AttemptStatus::Success),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

/// The unit of delivery work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: String,

    /// Parsed payload; this is what gets forwarded downstream.
    pub payload: serde_json::Value,

    /// Exact body the signature was verified over.
    pub raw_body: String,

    pub signature: Option<String>,
    pub status: EventStatus,

    /// Failed attempts so far. Only reset by administrative replay.
    pub retry_count: u32,

    pub last_error: Option<String>,

    /// Where the worker forwards this event.
    pub destination: String,

    pub created_at: DateTime<Utc>,

    /// Set if and only if `status == Delivered`.
    pub delivered_at: Option<DateTime<Utc>>,

    /// The poller ignores the event until this time has passed.
    pub next_attempt_at: DateTime<Utc>,

    pub claim_token: ClaimToken,
}

impl WebhookEvent {
    /// Whether the poller may claim this event at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.next_attempt_at <= now
    }
}

/// A verified, parsed webhook ready to be persisted as `pending`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tenant_id: TenantId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub raw_body: String,
    pub signature: Option<String>,
    pub destination: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record of one delivery try.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAttempt {
    pub id: AttemptId,
    pub event_id: EventId,

    /// 1-based, sequential per event.
    pub attempt_number: u32,

    pub status: AttemptStatus,

    /// Absent when the sink was never reached.
    pub response_code: Option<u16>,

    pub response_body: Option<String>,
    pub error_message: Option<String>,

    /// Backoff waited before this attempt; zero for the first.
    pub retry_delay: Duration,

    pub attempted_at: DateTime<Utc>,
}

/// Attempt data handed to the store by the worker.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub retry_delay: Duration,
    pub attempted_at: DateTime<Utc>,
}

/// Terminal record for an event that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub id: DeadLetterId,
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub raw_body: String,
    pub failure_reason: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub replayed: bool,
    pub replayed_at: Option<DateTime<Utc>>,
}

/// State change applied together with an attempt record.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Sink accepted the event.
    Delivered { at: DateTime<Utc> },

    /// Back to `pending`, eligible again at `next_attempt_at`.
    Retry {
        retry_count: u32,
        last_error: String,
        next_attempt_at: DateTime<Utc>,
    },

    /// Retry budget exhausted: `failed` plus a dead-letter record.
    DeadLetter {
        retry_count: u32,
        last_error: String,
        at: DateTime<Utc>,
    },
}

/// Aggregate counts over the event store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSummary {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_letter: u64,

    /// Mean `retry_count` across all events, regardless of tenant filter.
    pub average_retries: f64,
}

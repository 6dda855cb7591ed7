use chrono::{DateTime, Utc};

/// Source of wall-clock time for every timestamp the gateway persists.
///
/// Production code uses [`SystemClock`]; tests inject a clock they can
/// move forward to make backoff due-times elapse instantly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

//! Gateway configuration.
//!
//! Every knob has a default so the gateway starts with no environment at
//! all. Present-but-malformed values are rejected rather than silently
//! replaced.

use std::env::VarError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Placeholder secret shipped as the default. The binary warns when it is
/// still in use.
pub const INSECURE_DEFAULT_SECRET: &str = "your-secret-key-change-this";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Postgres connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,

    /// Shared secret for inbound `X-Signature` verification.
    pub webhook_secret: String,

    /// Default sink every accepted event is forwarded to.
    pub forward_url: String,

    /// Requests per window for tenants without an override.
    pub default_rate_limit: u32,

    /// Ceiling applied to every tenant limit, overrides included.
    pub max_rate_limit: u32,

    pub rate_limit_window: Duration,

    /// How often idle tenant windows are purged.
    pub rate_limit_cleanup_interval: Duration,

    /// Failed attempts after which an event is dead-lettered.
    pub max_retry_attempts: u32,

    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,

    /// Random extra delay added to each retry due-time, in milliseconds.
    pub retry_jitter_ms: u64,

    pub worker_poll_interval: Duration,

    /// Upper bound on concurrent deliveries within one poll cycle.
    pub worker_batch_size: usize,

    /// Bound on a single sink call.
    pub delivery_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            database_url: None,
            webhook_secret: INSECURE_DEFAULT_SECRET.to_string(),
            forward_url: "http://127.0.0.1:8001/internal/webhook".to_string(),
            default_rate_limit: 10,
            max_rate_limit: 50,
            rate_limit_window: Duration::from_secs(1),
            rate_limit_cleanup_interval: Duration::from_secs(60),
            max_retry_attempts: 8,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(3600),
            retry_jitter_ms: 0,
            worker_poll_interval: Duration::from_secs(2),
            worker_batch_size: 10,
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Tests supply variables through this without touching the
    /// process environment.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();

        let database_url = reader("DATABASE_URL")
            .ok()
            .map(|v| v.replace(['\n', '\r'], "").trim().to_string())
            .filter(|v| !v.is_empty());

        let config = Self {
            listen_addr: parse_or(&reader, "LISTEN_ADDR", defaults.listen_addr)?,
            database_url,
            webhook_secret: reader("WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
            forward_url: reader("INTERNAL_WEBHOOK_URL").unwrap_or(defaults.forward_url),
            default_rate_limit: parse_or(&reader, "DEFAULT_RATE_LIMIT", defaults.default_rate_limit)?,
            max_rate_limit: parse_or(&reader, "MAX_RATE_LIMIT", defaults.max_rate_limit)?,
            rate_limit_window: secs_or(&reader, "RATE_LIMIT_WINDOW_SECS", defaults.rate_limit_window)?,
            rate_limit_cleanup_interval: secs_or(
                &reader,
                "RATE_LIMIT_CLEANUP_SECS",
                defaults.rate_limit_cleanup_interval,
            )?,
            max_retry_attempts: parse_or(&reader, "MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts)?,
            initial_retry_delay: secs_or(&reader, "INITIAL_RETRY_DELAY", defaults.initial_retry_delay)?,
            max_retry_delay: secs_or(&reader, "MAX_RETRY_DELAY", defaults.max_retry_delay)?,
            retry_jitter_ms: parse_or(&reader, "RETRY_JITTER_MS", defaults.retry_jitter_ms)?,
            worker_poll_interval: secs_or(&reader, "WORKER_POLL_INTERVAL", defaults.worker_poll_interval)?,
            worker_batch_size: parse_or(&reader, "WORKER_BATCH_SIZE", defaults.worker_batch_size)?,
            delivery_timeout: secs_or(&reader, "DELIVERY_TIMEOUT_SECS", defaults.delivery_timeout)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rate_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_RATE_LIMIT".into(),
                "must be at least 1".into(),
            ));
        }
        if self.default_rate_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "DEFAULT_RATE_LIMIT".into(),
                "must be at least 1".into(),
            ));
        }
        if self.default_rate_limit > self.max_rate_limit {
            return Err(ConfigError::InvalidValue(
                "DEFAULT_RATE_LIMIT".into(),
                format!("exceeds MAX_RATE_LIMIT ({})", self.max_rate_limit),
            ));
        }
        if self.rate_limit_window.is_zero() {
            return Err(ConfigError::InvalidValue(
                "RATE_LIMIT_WINDOW_SECS".into(),
                "must be at least 1".into(),
            ));
        }
        if self.worker_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "WORKER_POLL_INTERVAL".into(),
                "must be at least 1".into(),
            ));
        }
        if self.worker_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "WORKER_BATCH_SIZE".into(),
                "must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            initial_delay: self.initial_retry_delay,
            max_delay: self.max_retry_delay,
            jitter_ms: self.retry_jitter_ms,
        }
    }

    pub fn uses_insecure_secret(&self) -> bool {
        self.webhook_secret == INSECURE_DEFAULT_SECRET
    }
}

fn parse_or<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn secs_or<F>(reader: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    parse_or(reader, key, default.as_secs()).map(Duration::from_secs)
}

/// Exponential backoff schedule for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the `retry_count`-th failure.
    ///
    /// `initial * 2^(retry_count - 1)`, capped at `max_delay`.
    pub fn delay_after_failure(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_millis().min(u64::MAX as u128) as u64;
        let max = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let pow = 2u64.checked_pow(retry_count - 1).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(pow).min(max.max(base)))
    }

    /// Delay that preceded attempt number `attempt_number` (1-based).
    pub fn delay_before_attempt(&self, attempt_number: u32) -> Duration {
        self.delay_after_failure(attempt_number.saturating_sub(1))
    }

    /// Whether a failure that brought the count to `retry_count` exhausts the budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }

    pub fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=self.jitter_ms))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

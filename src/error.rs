use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors surfaced synchronously to webhook senders and admin callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or invalid signature. Nothing was persisted.
    #[error("Invalid signature")]
    Unauthorized,

    /// Tenant is over its window quota. Nothing was persisted and the
    /// request was not counted.
    #[error("Rate limit exceeded. Limit: {limit}/{window_secs}s")]
    RateLimited { limit: u32, window_secs: u64 },

    /// Body is not valid JSON. Nothing was persisted.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// JSON body returned for every [`GatewayError`].
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::Validation(_) => "validation_error",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Store(_) => "storage_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures of the durable event store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Why a single delivery attempt did not reach a successful response.
///
/// Recovered locally by retry and backoff; never shown to the sender
/// of the original webhook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// Sink answered with a non-success status.
    #[error("HTTP {code}")]
    Status { code: u16, body: String },
}

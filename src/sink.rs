use async_trait::async_trait;

use crate::error::DeliveryFailure;

/// What the downstream endpoint answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
    pub body: String,
}

impl SinkResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Downstream consumer of delivered events.
///
/// Any HTTP answer, success or not, is `Ok`; `Err` means the sink was
/// never reached or never answered.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn forward(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<SinkResponse, DeliveryFailure>;
}

/// Sink that POSTs the payload as JSON.
#[cfg(feature = "http")]
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpSink {
    /// Build a sink whose requests give up after `timeout`.
    pub fn new(timeout: std::time::Duration) -> Result<Self, DeliveryFailure> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("webhook-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryFailure::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Sink for HttpSink {
    async fn forward(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<SinkResponse, DeliveryFailure> {
        let response = self.client.post(url).json(payload).send().await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                // A body that cannot be read still leaves a usable status.
                let body = resp.text().await.unwrap_or_default();
                Ok(SinkResponse { status, body })
            }
            Err(err) if err.is_timeout() => Err(DeliveryFailure::Timeout),
            Err(err) => Err(DeliveryFailure::Network(err.to_string())),
        }
    }
}

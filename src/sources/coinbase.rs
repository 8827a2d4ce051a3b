use crate::config::Settings;
use crate::types::*;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Spot price client for endpoints shaped like Coinbase's
/// `GET /v2/prices/{pair}/spot`, answering `{ "data": { amount, base, currency } }`
pub struct CoinbaseSpotClient {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl CoinbaseSpotClient {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EtlError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.price_api_url.clone(), settings.request_timeout)
    }

    /// One GET against the endpoint; any status other than 200 is an error
    pub async fn get_spot(&self) -> Result<RawQuote> {
        let started = Instant::now();

        let response = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EtlError::Unreachable(format!(
                        "request to {} timed out after {:?}",
                        self.endpoint, self.timeout
                    ))
                } else {
                    EtlError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!("Price API returned {}: {}", status, body);
            return Err(EtlError::Upstream {
                status_code: status.as_u16(),
                body,
            });
        }

        let envelope: QuoteEnvelope = response
            .json()
            .await
            .map_err(|e| EtlError::InvalidResponse(e.to_string()))?;

        debug!(
            "Price API answered in {}ms",
            started.elapsed().as_millis()
        );

        Ok(envelope.data.unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl PriceSource for CoinbaseSpotClient {
    async fn fetch(&self) -> Result<RawQuote> {
        self.get_spot().await
    }

    fn name(&self) -> &str {
        "coinbase"
    }
}

//! Endpoint latency probing.
//!
//! A probe is a cache-busted `HEAD` against `{base_url}/ping.txt`, timed from
//! request start until response headers arrive. Only a 2xx from the endpoint's
//! own host counts as a latency sample.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, HeaderValue, PRAGMA};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use super::registry::Endpoint;

const PROBE_PATH: &str = "ping.txt";
const MAX_SAME_HOST_REDIRECTS: usize = 5;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe returned http {0}")]
    Status(StatusCode),
    #[error("probe transport error: {0}")]
    Network(String),
}

/// Measures round-trip latency to an endpoint.
#[async_trait]
pub trait LatencyProber: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, ProbeError>;
}

/// Build the cache-busted probe URL for an endpoint.
pub fn probe_url(endpoint: &Endpoint, timestamp_ms: i64) -> String {
    format!(
        "{}/{PROBE_PATH}?t={timestamp_ms}",
        endpoint.base_url.trim_end_matches('/')
    )
}

/// Follows redirects only while they stay on the original host, so a probe
/// bounced to an unrelated origin surfaces as a 3xx failure.
fn same_host_policy() -> Policy {
    Policy::custom(|attempt| {
        let origin_host = attempt
            .previous()
            .first()
            .and_then(|url| url.host_str().map(str::to_string));
        if attempt.previous().len() > MAX_SAME_HOST_REDIRECTS {
            attempt.stop()
        } else if origin_host.as_deref() == attempt.url().host_str() {
            attempt.follow()
        } else {
            attempt.stop()
        }
    })
}

/// Reqwest-backed prober.
pub struct ReqwestLatencyProber {
    client: Client,
}

impl ReqwestLatencyProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().redirect(same_host_policy()).build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client. Its redirect policy is used as-is.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LatencyProber for ReqwestLatencyProber {
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, ProbeError> {
        let url = probe_url(endpoint, chrono::Utc::now().timestamp_millis());
        log::debug!("probing {} at {url}", endpoint.name);

        let started = Instant::now();
        let response = self
            .client
            .head(&url)
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .header(PRAGMA, HeaderValue::from_static("no-cache"))
            .send()
            .await
            .map_err(|err| ProbeError::Network(err.to_string()))?;
        let elapsed = started.elapsed();

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }
        Ok(elapsed)
    }
}

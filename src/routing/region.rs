//! Visitor region classification.
//!
//! Maps an IP-geolocation country code onto the coarse regions the endpoint
//! registry is keyed by. Lookup failures never escape this module: whatever
//! happens, the caller ends up with a [`Region`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const US_COUNTRIES: &[&str] = &["US", "CA", "MX"];
const EU_COUNTRIES: &[&str] = &[
    "GB", "DE", "FR", "IT", "ES", "NL", "BE", "CH", "AT", "SE", "NO", "DK", "FI",
];
const AP_COUNTRIES: &[&str] = &["JP", "KR", "SG", "AU", "IN", "TH", "MY", "ID", "PH", "VN"];

/// Default geolocation service.
pub const IPAPI_URL: &str = "https://ipapi.co/json/";

/// Coarse geographic bucket used for endpoint eligibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Cn,
    Us,
    Eu,
    Ap,
    #[default]
    Global,
}

impl Region {
    /// Classify an ISO-3166 alpha-2 country code.
    pub fn from_country_code(code: &str) -> Self {
        let code = code.trim().to_ascii_uppercase();
        let code = code.as_str();
        if code == "CN" {
            Region::Cn
        } else if US_COUNTRIES.contains(&code) {
            Region::Us
        } else if EU_COUNTRIES.contains(&code) {
            Region::Eu
        } else if AP_COUNTRIES.contains(&code) {
            Region::Ap
        } else {
            Region::Global
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Region::Cn => "cn",
            Region::Us => "us",
            Region::Eu => "eu",
            Region::Ap => "ap",
            Region::Global => "global",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the outcome of a geolocation lookup. Any failure maps to
/// [`Region::Global`].
pub fn classify(lookup: Result<String, GeoLookupError>) -> Region {
    match lookup {
        Ok(code) => Region::from_country_code(&code),
        Err(err) => {
            log::warn!("region detection failed, using global: {err}");
            Region::Global
        }
    }
}

#[derive(Debug, Error)]
pub enum GeoLookupError {
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geolocation lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("geolocation response missing country code")]
    MissingCountry,
}

/// Source of the visitor's country code.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn country_code(&self) -> Result<String, GeoLookupError>;
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    country_code: Option<String>,
}

/// [`GeoLookup`] backed by the ipapi.co JSON endpoint.
pub struct IpApiGeoLookup {
    client: reqwest::Client,
    url: String,
}

impl IpApiGeoLookup {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            url: IPAPI_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl GeoLookup for IpApiGeoLookup {
    async fn country_code(&self) -> Result<String, GeoLookupError> {
        let body: IpApiResponse = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.country_code
            .filter(|code| !code.trim().is_empty())
            .ok_or(GeoLookupError::MissingCountry)
    }
}

/// Run a lookup bounded by `timeout` and classify the result.
pub async fn detect_region(lookup: &dyn GeoLookup, timeout: Duration) -> Region {
    let result = match tokio::time::timeout(timeout, lookup.country_code()).await {
        Ok(result) => result,
        Err(_) => Err(GeoLookupError::Timeout(timeout)),
    };
    classify(result)
}

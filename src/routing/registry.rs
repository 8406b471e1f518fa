//! Static table of delivery endpoints.
//!
//! Endpoints are validated once when the registry is built and are immutable
//! afterwards; selection only ever reads from the registry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::region::Region;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("endpoint name must not be empty")]
    EmptyName,
    #[error("endpoint '{0}' has an invalid base url: {1}")]
    InvalidBaseUrl(String, url::ParseError),
    #[error("endpoint '{0}' must declare at least one region")]
    NoRegions(String),
    #[error("endpoint '{0}' priority must be positive")]
    InvalidPriority(String),
    #[error("duplicate endpoint name '{0}'")]
    Duplicate(String),
    #[error("registry json is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// One configured content-delivery base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    pub base_url: String,
    #[serde(rename = "regions")]
    pub supported_regions: BTreeSet<Region>,
    /// Lower is preferred.
    pub priority: u32,
}

impl Endpoint {
    pub fn new<I>(
        name: impl Into<String>,
        base_url: impl Into<String>,
        regions: I,
        priority: u32,
    ) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Region>,
    {
        let endpoint = Self {
            name: name.into(),
            base_url: base_url.into(),
            supported_regions: regions.into_iter().collect(),
            priority,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        Url::parse(&self.base_url)
            .map_err(|err| RegistryError::InvalidBaseUrl(self.name.clone(), err))?;
        if self.supported_regions.is_empty() {
            return Err(RegistryError::NoRegions(self.name.clone()));
        }
        if self.priority == 0 {
            return Err(RegistryError::InvalidPriority(self.name.clone()));
        }
        Ok(())
    }

    /// True when the endpoint serves `region` directly or serves everyone.
    pub fn serves(&self, region: Region) -> bool {
        self.supported_regions.contains(&region) || self.supported_regions.contains(&Region::Global)
    }

    /// Whether `url` points at this endpoint's origin and path prefix.
    pub fn owns(&self, url: &str) -> bool {
        let base = self.base_url.trim_end_matches('/');
        url.strip_prefix(base)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?', '#']))
    }
}

#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, RegistryError> {
        let mut names = BTreeSet::new();
        for endpoint in &endpoints {
            endpoint.validate()?;
            if !names.insert(endpoint.name.as_str()) {
                return Err(RegistryError::Duplicate(endpoint.name.clone()));
            }
        }
        Ok(Self { endpoints })
    }

    /// Load `[{"name", "baseUrl", "regions", "priority"}, ...]`.
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let endpoints: Vec<Endpoint> = serde_json::from_str(json)?;
        Self::new(endpoints)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn find(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    /// Endpoints eligible for `region`, sorted ascending by priority. Ties keep
    /// declaration order.
    pub fn eligible(&self, region: Region) -> Vec<&Endpoint> {
        let mut eligible: Vec<&Endpoint> = self
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.serves(region))
            .collect();
        eligible.sort_by_key(|endpoint| endpoint.priority);
        eligible
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        let endpoint = |name: &str, base_url: &str, regions: &[Region], priority| Endpoint {
            name: name.to_string(),
            base_url: base_url.to_string(),
            supported_regions: regions.iter().copied().collect(),
            priority,
        };
        Self {
            endpoints: vec![
                endpoint("cloudflare", "https://cdn.vexrobotics.com", &[Region::Global], 1),
                endpoint(
                    "cloudfront",
                    "https://d1234567890.cloudfront.net",
                    &[Region::Us, Region::Eu, Region::Ap],
                    2,
                ),
                endpoint(
                    "aliyun",
                    "https://vex-robotics.oss-cn-beijing.aliyuncs.com",
                    &[Region::Cn],
                    1,
                ),
            ],
        }
    }
}

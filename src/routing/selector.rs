//! Endpoint selection.
//!
//! Filters the registry by region, probes the best-priority candidates
//! concurrently and keeps the fastest responder. When every probe fails the
//! first candidate by priority wins, so selection only fails when the
//! registry has nothing for the region at all.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;

use super::probe::{LatencyProber, ProbeError};
use super::region::Region;
use super::registry::{Endpoint, EndpointRegistry};

pub const DEFAULT_PROBE_CANDIDATES: usize = 2;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no endpoint serves region '{0}' or global")]
    NoEligibleEndpoint(Region),
    #[error("endpoint '{0}' not found")]
    EndpointNotFound(String),
}

/// The endpoint currently used for URL resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSelection {
    pub endpoint: Endpoint,
    /// `None` until the endpoint has been probed successfully.
    pub measured_latency: Option<Duration>,
}

impl ActiveSelection {
    pub fn unmeasured(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            measured_latency: None,
        }
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.measured_latency.map(|d| d.as_secs_f64() * 1000.0)
    }
}

/// Shared handle to the active selection.
///
/// The selection is only ever swapped as a whole value; readers get an `Arc`
/// snapshot and never observe a half-updated selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    inner: Arc<RwLock<Option<Arc<ActiveSelection>>>>,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<ActiveSelection>> {
        self.inner.read().expect("selection lock poisoned").clone()
    }

    pub fn replace(&self, selection: ActiveSelection) -> Arc<ActiveSelection> {
        let selection = Arc::new(selection);
        *self.inner.write().expect("selection lock poisoned") = Some(selection.clone());
        selection
    }
}

/// Result of a single candidate probe.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub endpoint: String,
    pub result: Result<Duration, ProbeError>,
}

/// Selection plus the probe results that led to it.
#[derive(Debug)]
pub struct SelectionReport {
    pub selection: ActiveSelection,
    pub probes: Vec<ProbeOutcome>,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    pub probe_timeout: Duration,
    pub max_candidates: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            max_candidates: DEFAULT_PROBE_CANDIDATES,
        }
    }
}

pub struct EndpointSelector {
    registry: Arc<EndpointRegistry>,
    prober: Arc<dyn LatencyProber>,
    config: SelectorConfig,
}

impl EndpointSelector {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        prober: Arc<dyn LatencyProber>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            prober,
            config,
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Pick the endpoint for `region`.
    pub async fn select(&self, region: Region) -> Result<SelectionReport, SelectionError> {
        let eligible = self.registry.eligible(region);
        let Some(fallback) = eligible.first() else {
            return Err(SelectionError::NoEligibleEndpoint(region));
        };

        let candidates = &eligible[..eligible.len().min(self.config.max_candidates.max(1))];
        let timeout = self.config.probe_timeout;
        let probes = candidates.iter().map(|endpoint| async move {
            let result = match tokio::time::timeout(timeout, self.prober.probe(endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(timeout)),
            };
            ProbeOutcome {
                endpoint: endpoint.name.clone(),
                result,
            }
        });
        let probes = join_all(probes).await;

        // join_all keeps candidate order, so strict comparison breaks ties by priority.
        let mut best: Option<(&Endpoint, Duration)> = None;
        for (endpoint, outcome) in candidates.iter().zip(&probes) {
            match &outcome.result {
                Ok(latency) => {
                    if best.is_none_or(|(_, current)| *latency < current) {
                        best = Some((*endpoint, *latency));
                    }
                }
                Err(err) => log::debug!("endpoint {} probe failed: {err}", endpoint.name),
            }
        }

        let selection = match best {
            Some((endpoint, latency)) => ActiveSelection {
                endpoint: endpoint.clone(),
                measured_latency: Some(latency),
            },
            None => {
                log::warn!(
                    "all probes failed for region {region}, falling back to {}",
                    fallback.name
                );
                ActiveSelection::unmeasured((*fallback).clone())
            }
        };

        log::debug!(
            "selected endpoint {} for region {region} (latency: {:?})",
            selection.endpoint.name,
            selection.measured_latency
        );
        Ok(SelectionReport { selection, probes })
    }

    /// Build a selection for a named endpoint without probing it.
    pub fn switch_to(&self, name: &str) -> Result<ActiveSelection, SelectionError> {
        self.registry
            .find(name)
            .cloned()
            .map(ActiveSelection::unmeasured)
            .ok_or_else(|| SelectionError::EndpointNotFound(name.to_string()))
    }
}

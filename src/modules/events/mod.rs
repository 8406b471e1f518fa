//! Event system for the delivery engine.
//!
//! Provides hooks for logging and custom reactions around endpoint selection
//! and telemetry activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::routing::Region;

#[derive(Debug, Clone)]
pub struct RegionDetectedEvent {
    pub region: Region,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EndpointSelectedEvent {
    pub endpoint: String,
    pub region: Region,
    pub latency: Option<Duration>,
    pub probed: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProbeFailedEvent {
    pub endpoint: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EndpointSwitchedEvent {
    pub from: Option<String>,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TelemetryFlushedEvent {
    pub cdn: String,
    pub kinds: usize,
    pub samples: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TelemetryFailedEvent {
    pub cdn: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    RegionDetected(RegionDetectedEvent),
    EndpointSelected(EndpointSelectedEvent),
    ProbeFailed(ProbeFailedEvent),
    EndpointSwitched(EndpointSwitchedEvent),
    TelemetryFlushed(TelemetryFlushedEvent),
    TelemetryFailed(TelemetryFailedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DeliveryEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: DeliveryEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &DeliveryEvent) {
        match event {
            DeliveryEvent::RegionDetected(detected) => {
                log::info!("visitor region: {}", detected.region);
            }
            DeliveryEvent::EndpointSelected(selected) => {
                log::info!(
                    "endpoint {} active for {} after {} probe(s) (latency: {})",
                    selected.endpoint,
                    selected.region,
                    selected.probed,
                    selected
                        .latency
                        .map(|l| format!("{:.1}ms", l.as_secs_f64() * 1000.0))
                        .unwrap_or_else(|| "unknown".into())
                );
            }
            DeliveryEvent::ProbeFailed(failed) => {
                log::warn!("probe {} failed: {}", failed.endpoint, failed.error);
            }
            DeliveryEvent::EndpointSwitched(switched) => {
                log::info!(
                    "switched endpoint {} -> {}",
                    switched.from.as_deref().unwrap_or("none"),
                    switched.to
                );
            }
            DeliveryEvent::TelemetryFlushed(flushed) => {
                log::debug!(
                    "telemetry flushed for {}: {} kind(s), {} sample(s)",
                    flushed.cdn,
                    flushed.kinds,
                    flushed.samples
                );
            }
            DeliveryEvent::TelemetryFailed(failed) => {
                log::warn!("telemetry submission for {} failed: {}", failed.cdn, failed.error);
            }
        }
    }
}

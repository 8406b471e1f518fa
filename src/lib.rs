//! # cdn-delivery-rs
//!
//! Region-aware CDN endpoint selection and asset delivery for a single page
//! session.
//!
//! The engine classifies the visitor's region, probes the eligible CDN
//! endpoints and keeps the fastest one active. Asset paths are resolved
//! against that endpoint, resource hints are deduplicated, images load
//! lazily as they approach the viewport, and load timings are aggregated
//! and reported periodically.
//!
//! ## Features
//!
//! - Geolocation-based region classification with a `global` fallback
//! - Concurrent latency probes with per-probe timeouts
//! - Deterministic URL building with versioning and image transforms
//! - Preload and prefetch hints emitted at most once per URL
//! - Viewport-driven lazy image loading with an eager fallback mode
//! - Bounded per-kind telemetry windows flushed on a fixed interval
//!
//! ## Example
//!
//! ```no_run
//! use cdn_delivery_rs::{DeliveryEngine, ImageOptions, ResolveOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DeliveryEngine::builder()
//!         .with_site_origin("https://www.example.com")
//!         .build()?;
//!     let active = engine.start().await?;
//!     println!("serving from {}", active.endpoint.name);
//!
//!     let script = engine.resolve("/js/app.js", &ResolveOptions::new().version("1.4.2"));
//!     let hero = engine.resolve_image(
//!         "/img/hero.jpg",
//!         &ImageOptions { width: Some(1200), ..ImageOptions::default() },
//!     );
//!     println!("{script}\n{hero}");
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

mod delivery;

pub mod modules;
pub mod routing;

pub use crate::delivery::{
    DEFAULT_CRITICAL_RESOURCES,
    DEFAULT_GEO_TIMEOUT,
    DeliveryConfig,
    DeliveryEngine,
    DeliveryEngineBuilder,
    DeliveryError,
    DeliveryResult,
};

pub use crate::routing::{
    ActiveSelection,
    Endpoint,
    EndpointRegistry,
    EndpointSelector,
    GeoLookup,
    GeoLookupError,
    IpApiGeoLookup,
    LatencyProber,
    ProbeError,
    Region,
    RegistryError,
    ReqwestLatencyProber,
    SelectionError,
    SelectionState,
};

pub use crate::modules::{
    DeliveryEvent,
    EventDispatcher,
    EventHandler,
    FlushOutcome,
    HeadHints,
    HintPriority,
    HintSink,
    ImageFetcher,
    ImageId,
    ImageOptions,
    LazyImage,
    LazyLoadConfig,
    LazyLoadController,
    LoadState,
    LoggingHandler,
    PerformanceReport,
    PerformanceSample,
    PerformanceStats,
    ProximityEvent,
    ResolveOptions,
    ResourceHint,
    ResourceKind,
    TelemetryError,
    TelemetrySink,
    ViewportObserver,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

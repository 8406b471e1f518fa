//! Delivery services layered on top of the active endpoint.
//!
//! Resource classification, URL resolution, resource hints, lazy image
//! loading, telemetry, and the event hooks the engine reports through.

pub mod events;
pub mod lazy_load;
pub mod prefetch;
pub mod resolver;
pub mod resource_kind;
pub mod telemetry;

// Re-export commonly used types
pub use events::{
    DeliveryEvent, EndpointSelectedEvent, EndpointSwitchedEvent, EventDispatcher, EventHandler,
    LoggingHandler, ProbeFailedEvent, RegionDetectedEvent, TelemetryFailedEvent,
    TelemetryFlushedEvent,
};
pub use lazy_load::{
    BoundingBox, ImageFetcher, ImageId, ImageLoadError, LazyImage, LazyLoadConfig,
    LazyLoadController, LoadState, ProximityEvent, ReqwestImageFetcher, Viewport,
    ViewportObserver,
};
pub use prefetch::{HeadHints, HintPriority, HintRel, HintSink, PrefetchController, ResourceHint};
pub use resolver::{ImageOptions, ResolveOptions, UrlResolver, build_url};
pub use resource_kind::{ResourceKind, ResourcePolicy};
pub use telemetry::{
    FlushOutcome, HttpTelemetrySink, KindStats, KindSummary, PerformanceReport,
    PerformanceSample, PerformanceStats, TelemetryAggregator, TelemetryError, TelemetryReporter,
    TelemetrySink,
};

//! High level delivery orchestration.
//!
//! Wires together region detection, endpoint selection, URL resolution,
//! resource hints, lazy image loading and telemetry into one explicitly
//! constructed engine. Nothing here is global: every engine owns its state
//! and its background flush loop, and tears both down on `shutdown`.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::modules::events::{
	DeliveryEvent, EndpointSelectedEvent, EndpointSwitchedEvent, EventDispatcher, EventHandler,
	LoggingHandler, ProbeFailedEvent, RegionDetectedEvent,
};
use crate::modules::lazy_load::{
	ImageFetcher, ImageId, LazyImage, LazyLoadConfig, LazyLoadController, ReqwestImageFetcher,
	ViewportObserver,
};
use crate::modules::prefetch::{HeadHints, HintPriority, HintSink, PrefetchController};
use crate::modules::resolver::{ImageOptions, ResolveOptions, UrlResolver};
use crate::modules::telemetry::{
	DEFAULT_FLUSH_INTERVAL, DEFAULT_SAMPLE_WINDOW, FlushOutcome, HttpTelemetrySink,
	PerformanceSample, PerformanceStats, REPORT_PATH, TelemetryAggregator, TelemetryReporter,
	TelemetrySink,
};
use crate::routing::selector::{DEFAULT_PROBE_CANDIDATES, DEFAULT_PROBE_TIMEOUT};
use crate::routing::{
	ActiveSelection, EndpointRegistry, EndpointSelector, GeoLookup, IpApiGeoLookup, LatencyProber,
	Region, RegistryError, ReqwestLatencyProber, SelectionError, SelectionState, SelectorConfig,
	detect_region,
};

/// Result alias used across the orchestration layer.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// High-level error surfaced by the engine.
#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("http client error: {0}")]
	Http(#[from] reqwest::Error),
	#[error("invalid report url: {0}")]
	Url(#[from] url::ParseError),
	#[error("endpoint registry error: {0}")]
	Registry(#[from] RegistryError),
	#[error("endpoint selection failed: {0}")]
	Selection(#[from] SelectionError),
}

pub const DEFAULT_GEO_TIMEOUT: Duration = Duration::from_secs(5);

/// Assets preloaded as soon as an endpoint is selected.
pub const DEFAULT_CRITICAL_RESOURCES: &[&str] =
	&["/css/main.css", "/js/main.js", "/fonts/inter-var.woff2"];

/// Engine configuration used by the builder.
#[derive(Clone)]
pub struct DeliveryConfig {
	pub registry: EndpointRegistry,
	pub probe_timeout: Duration,
	pub probe_candidates: usize,
	pub geo_timeout: Duration,
	pub flush_interval: Duration,
	pub sample_window: usize,
	pub report_url: String,
	pub enable_telemetry: bool,
	pub critical_resources: Vec<String>,
	pub lazy_load: LazyLoadConfig,
	pub geo_lookup: Option<Arc<dyn GeoLookup>>,
	pub prober: Option<Arc<dyn LatencyProber>>,
	pub telemetry_sink: Option<Arc<dyn TelemetrySink>>,
	pub hint_sink: Option<Arc<dyn HintSink>>,
	pub viewport_observer: Option<Arc<dyn ViewportObserver>>,
	pub image_fetcher: Option<Arc<dyn ImageFetcher>>,
	pub event_handlers: Vec<Arc<dyn EventHandler>>,
}

impl Default for DeliveryConfig {
	fn default() -> Self {
		Self {
			registry: EndpointRegistry::default(),
			probe_timeout: DEFAULT_PROBE_TIMEOUT,
			probe_candidates: DEFAULT_PROBE_CANDIDATES,
			geo_timeout: DEFAULT_GEO_TIMEOUT,
			flush_interval: DEFAULT_FLUSH_INTERVAL,
			sample_window: DEFAULT_SAMPLE_WINDOW,
			report_url: format!("http://localhost{REPORT_PATH}"),
			enable_telemetry: true,
			critical_resources: DEFAULT_CRITICAL_RESOURCES
				.iter()
				.map(|path| path.to_string())
				.collect(),
			lazy_load: LazyLoadConfig::default(),
			geo_lookup: None,
			prober: None,
			telemetry_sink: None,
			hint_sink: None,
			viewport_observer: None,
			image_fetcher: None,
			event_handlers: Vec::new(),
		}
	}
}

/// Fluent builder for [`DeliveryEngine`].
pub struct DeliveryEngineBuilder {
	config: DeliveryConfig,
}

impl DeliveryEngineBuilder {
	pub fn new() -> Self {
		Self {
			config: DeliveryConfig::default(),
		}
	}

	pub fn with_registry(mut self, registry: EndpointRegistry) -> Self {
		self.config.registry = registry;
		self
	}

	pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
		self.config.probe_timeout = timeout;
		self
	}

	pub fn with_probe_candidates(mut self, candidates: usize) -> Self {
		self.config.probe_candidates = candidates.max(1);
		self
	}

	pub fn with_geo_timeout(mut self, timeout: Duration) -> Self {
		self.config.geo_timeout = timeout;
		self
	}

	pub fn with_flush_interval(mut self, interval: Duration) -> Self {
		self.config.flush_interval = interval;
		self
	}

	pub fn with_sample_window(mut self, window: usize) -> Self {
		self.config.sample_window = window.max(1);
		self
	}

	/// Full URL reports are POSTed to.
	pub fn with_report_url(mut self, url: impl Into<String>) -> Self {
		self.config.report_url = url.into();
		self
	}

	/// Site origin; reports go to `{origin}/api/analytics/performance`.
	pub fn with_site_origin(mut self, origin: &str) -> Self {
		self.config.report_url = format!("{}{REPORT_PATH}", origin.trim_end_matches('/'));
		self
	}

	pub fn with_critical_resources<I, S>(mut self, paths: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.critical_resources = paths.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_lazy_load_config(mut self, config: LazyLoadConfig) -> Self {
		self.config.lazy_load = config;
		self
	}

	pub fn with_geo_lookup(mut self, lookup: Arc<dyn GeoLookup>) -> Self {
		self.config.geo_lookup = Some(lookup);
		self
	}

	pub fn with_prober(mut self, prober: Arc<dyn LatencyProber>) -> Self {
		self.config.prober = Some(prober);
		self
	}

	pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
		self.config.telemetry_sink = Some(sink);
		self
	}

	pub fn with_hint_sink(mut self, sink: Arc<dyn HintSink>) -> Self {
		self.config.hint_sink = Some(sink);
		self
	}

	pub fn with_viewport_observer(mut self, observer: Arc<dyn ViewportObserver>) -> Self {
		self.config.viewport_observer = Some(observer);
		self
	}

	pub fn with_image_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
		self.config.image_fetcher = Some(fetcher);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.config.event_handlers.push(handler);
		self
	}

	pub fn disable_telemetry(mut self) -> Self {
		self.config.enable_telemetry = false;
		self
	}

	pub fn build(self) -> DeliveryResult<DeliveryEngine> {
		DeliveryEngine::with_config(self.config)
	}
}

impl Default for DeliveryEngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct FlushTask {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

/// Delivery engine for one page session.
pub struct DeliveryEngine {
	config: DeliveryConfig,
	geo_lookup: Arc<dyn GeoLookup>,
	selector: EndpointSelector,
	selection: SelectionState,
	region: OnceLock<Region>,
	resolver: UrlResolver,
	telemetry: Arc<TelemetryAggregator>,
	telemetry_sink: Arc<dyn TelemetrySink>,
	reporter: OnceLock<Arc<TelemetryReporter>>,
	prefetcher: PrefetchController,
	lazy_loader: LazyLoadController,
	events: Arc<EventDispatcher>,
	flush_task: Mutex<Option<FlushTask>>,
}

impl DeliveryEngine {
	/// Construct an engine with default configuration.
	pub fn new() -> DeliveryResult<Self> {
		DeliveryEngine::with_config(DeliveryConfig::default())
	}

	/// Obtain a builder to customise the engine instance.
	pub fn builder() -> DeliveryEngineBuilder {
		DeliveryEngineBuilder::new()
	}

	fn with_config(config: DeliveryConfig) -> DeliveryResult<Self> {
		Url::parse(&config.report_url)?;
		let client = reqwest::Client::builder().build()?;

		let geo_lookup: Arc<dyn GeoLookup> = match &config.geo_lookup {
			Some(lookup) => lookup.clone(),
			None => Arc::new(IpApiGeoLookup::new(client.clone())),
		};
		let prober: Arc<dyn LatencyProber> = match &config.prober {
			Some(prober) => prober.clone(),
			None => Arc::new(ReqwestLatencyProber::new()?),
		};
		let telemetry_sink: Arc<dyn TelemetrySink> = match &config.telemetry_sink {
			Some(sink) => sink.clone(),
			None => Arc::new(HttpTelemetrySink::new(client.clone(), config.report_url.clone())),
		};
		let hint_sink: Arc<dyn HintSink> = config
			.hint_sink
			.clone()
			.unwrap_or_else(|| Arc::new(HeadHints::new()));
		let image_fetcher: Arc<dyn ImageFetcher> = config
			.image_fetcher
			.clone()
			.unwrap_or_else(|| Arc::new(ReqwestImageFetcher::new(client)));

		let selection = SelectionState::new();
		let selector = EndpointSelector::new(
			Arc::new(config.registry.clone()),
			prober,
			SelectorConfig {
				probe_timeout: config.probe_timeout,
				max_candidates: config.probe_candidates,
			},
		);

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		for handler in &config.event_handlers {
			events.register_handler(handler.clone());
		}

		Ok(Self {
			geo_lookup,
			selector,
			resolver: UrlResolver::new(selection.clone()),
			telemetry: Arc::new(TelemetryAggregator::with_window(
				selection.clone(),
				config.sample_window,
			)),
			telemetry_sink,
			reporter: OnceLock::new(),
			prefetcher: PrefetchController::new(hint_sink),
			lazy_loader: LazyLoadController::new(
				config.lazy_load,
				config.viewport_observer.clone(),
				image_fetcher,
			),
			selection,
			region: OnceLock::new(),
			events: Arc::new(events),
			flush_task: Mutex::new(None),
			config,
		})
	}

	/// Detect the region, select an endpoint, preload critical resources and
	/// start the telemetry loop.
	///
	/// Fails only when no endpoint serves the region or `global`.
	pub async fn start(&self) -> DeliveryResult<Arc<ActiveSelection>> {
		let region = self.detect_region_once().await;
		let selection = self.select(region).await?;
		self.preload_critical();
		if self.config.enable_telemetry {
			self.spawn_flush_loop(region);
		}
		Ok(selection)
	}

	/// Re-probe and replace the active selection.
	pub async fn reselect(&self) -> DeliveryResult<Arc<ActiveSelection>> {
		self.select(self.region()).await
	}

	/// Make `name` the active endpoint. Its latency is unknown until the next
	/// probe. Telemetry already buffered stays attributed to the previous
	/// endpoint until it is flushed or the new endpoint records a sample.
	pub fn switch_endpoint(&self, name: &str) -> DeliveryResult<Arc<ActiveSelection>> {
		let next = self.selector.switch_to(name)?;
		let previous = self
			.selection
			.current()
			.map(|active| active.endpoint.name.clone());
		let active = self.selection.replace(next);
		self.events.dispatch(DeliveryEvent::EndpointSwitched(EndpointSwitchedEvent {
			from: previous,
			to: active.endpoint.name.clone(),
			timestamp: chrono::Utc::now(),
		}));
		Ok(active)
	}

	/// Stop the telemetry loop and wait for it to exit. Buffered samples are
	/// not flushed.
	pub async fn shutdown(&self) {
		let task = self
			.flush_task
			.lock()
			.expect("flush task lock poisoned")
			.take();
		if let Some(task) = task {
			task.cancel.cancel();
			if let Err(err) = task.handle.await {
				log::warn!("telemetry loop ended abnormally: {err}");
			}
		}
	}

	/// Region for this session; `global` until detection has run.
	pub fn region(&self) -> Region {
		self.region.get().copied().unwrap_or_default()
	}

	pub fn active_selection(&self) -> Option<Arc<ActiveSelection>> {
		self.selection.current()
	}

	pub fn registry(&self) -> &EndpointRegistry {
		self.selector.registry()
	}

	pub fn resolve(&self, path: &str, options: &ResolveOptions) -> String {
		self.resolver.resolve(path, options)
	}

	pub fn resolve_image(&self, path: &str, options: &ImageOptions) -> String {
		self.resolver.resolve_image(path, options)
	}

	pub fn resolver(&self) -> &UrlResolver {
		&self.resolver
	}

	/// Record a finished resource load. Returns `false` when the sample was
	/// ignored.
	pub fn record_sample(&self, sample: PerformanceSample) -> bool {
		self.config.enable_telemetry && self.telemetry.record(sample)
	}

	/// Flush telemetry now instead of waiting for the next tick.
	pub async fn flush_telemetry(&self) -> FlushOutcome {
		match self.reporter.get() {
			Some(reporter) => reporter.flush().await,
			None => FlushOutcome::Empty,
		}
	}

	pub fn performance_stats(&self) -> PerformanceStats {
		self.telemetry.stats(self.region())
	}

	pub fn prefetch(&self, url: &str, priority: HintPriority) -> bool {
		self.prefetcher.prefetch(url, priority)
	}

	pub fn prefetch_page(&self, url: &str) -> bool {
		self.prefetcher.prefetch_page(url)
	}

	pub fn prefetch_critical<I, S>(&self, urls: I) -> usize
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		self.prefetcher.prefetch_critical(urls)
	}

	/// Preload the configured critical resources against the active endpoint.
	pub fn preload_critical(&self) -> usize {
		let urls: Vec<String> = self
			.config
			.critical_resources
			.iter()
			.map(|path| self.resolver.resolve(path, &ResolveOptions::default()))
			.collect();
		self.prefetcher.prefetch_critical(urls)
	}

	/// Register an image for lazy loading with its source resolved against the
	/// active endpoint.
	///
	/// Must be called inside a Tokio runtime; the load or observation task is
	/// spawned immediately.
	pub fn register_image(
		&self,
		placeholder: &str,
		path: &str,
		options: &ImageOptions,
	) -> ImageId {
		let src = self.resolver.resolve_image(path, options);
		self.lazy_loader.register(LazyImage::new(placeholder, src))
	}

	pub fn lazy_loader(&self) -> &LazyLoadController {
		&self.lazy_loader
	}

	async fn detect_region_once(&self) -> Region {
		if let Some(region) = self.region.get() {
			return *region;
		}
		let detected = detect_region(self.geo_lookup.as_ref(), self.config.geo_timeout).await;
		let region = *self.region.get_or_init(|| detected);
		self.events.dispatch(DeliveryEvent::RegionDetected(RegionDetectedEvent {
			region,
			timestamp: chrono::Utc::now(),
		}));
		region
	}

	async fn select(&self, region: Region) -> DeliveryResult<Arc<ActiveSelection>> {
		let report = self.selector.select(region).await?;
		for probe in &report.probes {
			if let Err(err) = &probe.result {
				self.events.dispatch(DeliveryEvent::ProbeFailed(ProbeFailedEvent {
					endpoint: probe.endpoint.clone(),
					error: err.to_string(),
					timestamp: chrono::Utc::now(),
				}));
			}
		}
		let probed = report.probes.len();
		let active = self.selection.replace(report.selection);
		self.events.dispatch(DeliveryEvent::EndpointSelected(EndpointSelectedEvent {
			endpoint: active.endpoint.name.clone(),
			region,
			latency: active.measured_latency,
			probed,
			timestamp: chrono::Utc::now(),
		}));
		Ok(active)
	}

	fn spawn_flush_loop(&self, region: Region) {
		let mut guard = self.flush_task.lock().expect("flush task lock poisoned");
		if guard.is_some() {
			return;
		}
		let reporter = self
			.reporter
			.get_or_init(|| {
				Arc::new(TelemetryReporter::new(
					self.telemetry.clone(),
					self.telemetry_sink.clone(),
					region,
					self.events.clone(),
				))
			})
			.clone();
		let cancel = CancellationToken::new();
		let handle = reporter.spawn(self.config.flush_interval, cancel.clone());
		*guard = Some(FlushTask { cancel, handle });
	}
}

impl Drop for DeliveryEngine {
	fn drop(&mut self) {
		if let Ok(mut guard) = self.flush_task.lock()
			&& let Some(task) = guard.take()
		{
			task.cancel.cancel();
		}
	}
}

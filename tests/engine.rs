use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cdn_delivery_rs::{
    DeliveryEngine,
    DeliveryError,
    Endpoint,
    EndpointRegistry,
    FlushOutcome,
    GeoLookup,
    GeoLookupError,
    HeadHints,
    HintPriority,
    ImageFetcher,
    ImageOptions,
    LatencyProber,
    LoadState,
    PerformanceReport,
    PerformanceSample,
    ProbeError,
    Region,
    ResolveOptions,
    SelectionError,
    TelemetryError,
    TelemetrySink,
    modules::ImageLoadError,
};

struct FixedCountry(&'static str);

#[async_trait]
impl GeoLookup for FixedCountry {
    async fn country_code(&self) -> Result<String, GeoLookupError> {
        Ok(self.0.to_string())
    }
}

struct FailingLookup;

#[async_trait]
impl GeoLookup for FailingLookup {
    async fn country_code(&self) -> Result<String, GeoLookupError> {
        Err(GeoLookupError::MissingCountry)
    }
}

/// Latency per endpoint name; missing names fail with a network error.
struct TableProber(HashMap<&'static str, u64>);

#[async_trait]
impl LatencyProber for TableProber {
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, ProbeError> {
        self.0
            .get(endpoint.name.as_str())
            .map(|ms| Duration::from_millis(*ms))
            .ok_or_else(|| ProbeError::Network("connection refused".into()))
    }
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<PerformanceReport>>,
    fail: bool,
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn submit(&self, report: &PerformanceReport) -> Result<(), TelemetryError> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail {
            return Err(TelemetryError::Status(reqwest::StatusCode::BAD_GATEWAY));
        }
        Ok(())
    }
}

struct OkFetcher;

#[async_trait]
impl ImageFetcher for OkFetcher {
    async fn fetch(&self, _url: &str) -> Result<(), ImageLoadError> {
        Ok(())
    }
}

fn prober(latencies: &[(&'static str, u64)]) -> Arc<TableProber> {
    Arc::new(TableProber(latencies.iter().copied().collect()))
}

#[tokio::test]
async fn cn_visitor_falls_over_to_reachable_endpoint() {
    let hints = Arc::new(HeadHints::new());
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("CN")))
        .with_prober(prober(&[("cloudflare", 50)]))
        .with_telemetry_sink(Arc::new(RecordingSink::default()))
        .with_hint_sink(hints.clone())
        .build()
        .unwrap();

    let active = engine.start().await.unwrap();
    assert_eq!(engine.region(), Region::Cn);
    assert_eq!(active.endpoint.name, "cloudflare");
    assert_eq!(active.latency_ms(), Some(50.0));

    assert_eq!(
        engine.resolve("/js/app.js", &ResolveOptions::new().version("2.0")),
        "https://cdn.vexrobotics.com/js/app.js?v=2.0"
    );

    let preloaded: Vec<_> = hints.hints().into_iter().map(|hint| hint.href).collect();
    assert_eq!(
        preloaded,
        [
            "https://cdn.vexrobotics.com/css/main.css",
            "https://cdn.vexrobotics.com/js/main.js",
            "https://cdn.vexrobotics.com/fonts/inter-var.woff2",
        ]
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_geolocation_classifies_global() {
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FailingLookup))
        .with_prober(prober(&[("cloudflare", 20)]))
        .disable_telemetry()
        .build()
        .unwrap();

    let active = engine.start().await.unwrap();
    assert_eq!(engine.region(), Region::Global);
    assert_eq!(active.endpoint.name, "cloudflare");
}

#[tokio::test]
async fn image_urls_carry_transform_defaults() {
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("DE")))
        .with_prober(prober(&[("cloudflare", 80), ("cloudfront", 30)]))
        .disable_telemetry()
        .build()
        .unwrap();

    engine.start().await.unwrap();
    let url = engine.resolve_image(
        "img/hero.jpg",
        &ImageOptions {
            width: Some(640),
            ..ImageOptions::default()
        },
    );
    assert_eq!(url, "https://d1234567890.cloudfront.net/img/hero.jpg?f=auto&q=85&w=640");
}

#[tokio::test]
async fn start_fails_without_eligible_endpoint() {
    let registry = EndpointRegistry::new(vec![
        Endpoint::new("us-only", "https://us.example.net", [Region::Us], 1).unwrap(),
    ])
    .unwrap();
    let engine = DeliveryEngine::builder()
        .with_registry(registry)
        .with_geo_lookup(Arc::new(FixedCountry("FR")))
        .with_prober(prober(&[("us-only", 10)]))
        .disable_telemetry()
        .build()
        .unwrap();

    let err = engine.start().await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::Selection(SelectionError::NoEligibleEndpoint(Region::Eu))
    ));
    assert!(engine.active_selection().is_none());
    assert_eq!(engine.resolve("/a.css", &ResolveOptions::default()), "/a.css");
}

#[tokio::test]
async fn switching_endpoints() {
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("US")))
        .with_prober(prober(&[("cloudflare", 40), ("cloudfront", 60)]))
        .disable_telemetry()
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let switched = engine.switch_endpoint("cloudfront").unwrap();
    assert_eq!(switched.endpoint.name, "cloudfront");
    assert!(switched.measured_latency.is_none());
    assert_eq!(
        engine.active_selection().unwrap().endpoint.name,
        "cloudfront"
    );

    assert!(matches!(
        engine.switch_endpoint("fastly"),
        Err(DeliveryError::Selection(SelectionError::EndpointNotFound(_)))
    ));
    assert_eq!(
        engine.active_selection().unwrap().endpoint.name,
        "cloudfront"
    );

    let reselected = engine.reselect().await.unwrap();
    assert_eq!(reselected.endpoint.name, "cloudflare");
}

#[tokio::test]
async fn prefetch_hints_once_per_url() {
    let hints = Arc::new(HeadHints::new());
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("JP")))
        .with_prober(prober(&[("cloudflare", 40)]))
        .with_critical_resources(Vec::<String>::new())
        .with_hint_sink(hints.clone())
        .disable_telemetry()
        .build()
        .unwrap();
    engine.start().await.unwrap();

    assert!(engine.prefetch_page("/products"));
    assert!(!engine.prefetch_page("/products"));
    assert!(!engine.prefetch("/products", HintPriority::High));
    assert_eq!(hints.render(), "<link rel=\"prefetch\" href=\"/products\">");
}

#[tokio::test]
async fn telemetry_is_dropped_after_failed_submission() {
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("SG")))
        .with_prober(prober(&[("cloudflare", 70), ("cloudfront", 25)]))
        .with_telemetry_sink(sink.clone())
        .with_flush_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let base = "https://d1234567890.cloudfront.net";
    assert!(engine.record_sample(PerformanceSample::new(format!("{base}/img/a.webp"), 120.0, 4096)));
    assert!(engine.record_sample(PerformanceSample::new(format!("{base}/js/app.js"), 40.0, 1024)));
    assert!(!engine.record_sample(PerformanceSample::new("https://elsewhere.net/x.png", 10.0, 1)));

    let stats = engine.performance_stats();
    assert_eq!(stats.cdn.as_deref(), Some("cloudfront"));
    assert_eq!(stats.region, Region::Ap);

    assert!(matches!(engine.flush_telemetry().await, FlushOutcome::Failed(_)));
    {
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].data.len(), 2);
    }
    assert_eq!(engine.flush_telemetry().await, FlushOutcome::Empty);
    assert_eq!(sink.reports.lock().unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn flush_before_start_sends_nothing() {
    let sink = Arc::new(RecordingSink::default());
    let engine = DeliveryEngine::builder()
        .with_telemetry_sink(sink.clone())
        .build()
        .unwrap();
    assert_eq!(engine.flush_telemetry().await, FlushOutcome::Empty);
    assert!(sink.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn images_load_eagerly_without_observer() {
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("GB")))
        .with_prober(prober(&[("cloudflare", 15)]))
        .with_image_fetcher(Arc::new(OkFetcher))
        .disable_telemetry()
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let loader = engine.lazy_loader();
    assert!(loader.is_fallback());
    let id = engine.register_image("/img/blank.gif", "/img/gallery-1.jpg", &ImageOptions::default());
    loader.settle().await;

    let image = loader.image(id).unwrap();
    assert_eq!(image.state(), LoadState::Loaded);
    assert_eq!(
        image.src(),
        "https://cdn.vexrobotics.com/img/gallery-1.jpg?f=auto&q=85"
    );
    assert!(image.deferred_src().is_none());
}

#[tokio::test]
async fn start_twice_keeps_one_flush_loop() {
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("MX")))
        .with_prober(prober(&[("cloudflare", 30)]))
        .with_telemetry_sink(Arc::new(RecordingSink::default()))
        .build()
        .unwrap();
    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.region(), Region::Us);
    engine.shutdown().await;
    engine.shutdown().await;
}

struct StalledSink;

#[async_trait]
impl TelemetrySink for StalledSink {
    async fn submit(&self, _report: &PerformanceReport) -> Result<(), TelemetryError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn timed_out_flush_does_not_stall_telemetry() {
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("US")))
        .with_prober(prober(&[("cloudflare", 30)]))
        .with_telemetry_sink(Arc::new(StalledSink))
        .with_flush_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let url = "https://cdn.vexrobotics.com/img/a.png";
    assert!(engine.record_sample(PerformanceSample::new(url, 12.0, 512)));
    let abandoned = tokio::time::timeout(Duration::from_millis(50), engine.flush_telemetry()).await;
    assert!(abandoned.is_err());

    assert_eq!(engine.flush_telemetry().await, FlushOutcome::Empty);
    engine.shutdown().await;
}

#[tokio::test]
async fn buffered_telemetry_keeps_endpoint_across_switch() {
    let sink = Arc::new(RecordingSink::default());
    let engine = DeliveryEngine::builder()
        .with_geo_lookup(Arc::new(FixedCountry("KR")))
        .with_prober(prober(&[("cloudflare", 90), ("cloudfront", 20)]))
        .with_telemetry_sink(sink.clone())
        .with_flush_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let base = "https://d1234567890.cloudfront.net";
    assert!(engine.record_sample(PerformanceSample::new(format!("{base}/css/a.css"), 15.0, 800)));
    engine.switch_endpoint("cloudflare").unwrap();

    assert_eq!(engine.flush_telemetry().await, FlushOutcome::Submitted { kinds: 1 });
    let reports = sink.reports.lock().unwrap();
    assert_eq!(reports[0].cdn(), Some("cloudfront"));
    drop(reports);
    engine.shutdown().await;
}

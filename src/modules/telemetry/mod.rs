//! Delivery performance telemetry.
//!
//! Resource timings served by the active endpoint are bucketed by
//! [`ResourceKind`] into bounded FIFO windows. A reporter periodically drains
//! every bucket into one [`PerformanceReport`] and submits it.
//!
//! Delivery is at-most-once: buckets are cleared when the report is packaged,
//! before submission, so a failed submission drops that interval's data.
//! Buckets belong to the endpoint that served their samples; the first sample
//! served by a different endpoint discards them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::modules::events::{
    DeliveryEvent, EventDispatcher, TelemetryFailedEvent, TelemetryFlushedEvent,
};
use crate::modules::resource_kind::ResourceKind;
use crate::routing::{Region, SelectionState};

pub const DEFAULT_SAMPLE_WINDOW: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const REPORT_PATH: &str = "/api/analytics/performance";

/// One observed resource load.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub url: String,
    pub duration_ms: f64,
    pub size_bytes: u64,
    pub timestamp_ms: i64,
}

impl PerformanceSample {
    pub fn new(url: impl Into<String>, duration_ms: f64, size_bytes: u64) -> Self {
        Self {
            url: url.into(),
            duration_ms,
            size_bytes,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        ResourceKind::from_url(&self.url)
    }
}

/// Per-kind entry of a submitted report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSummary {
    pub count: usize,
    pub avg_duration: f64,
    pub avg_size: f64,
    pub cdn: String,
    pub region: Region,
}

/// Body POSTed to the reporting endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub timestamp: i64,
    pub data: BTreeMap<ResourceKind, KindSummary>,
}

impl PerformanceReport {
    /// Endpoint that served the reported samples.
    pub fn cdn(&self) -> Option<&str> {
        self.data.values().next().map(|summary| summary.cdn.as_str())
    }

    pub fn sample_count(&self) -> usize {
        self.data.values().map(|summary| summary.count).sum()
    }
}

/// On-demand statistics for one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindStats {
    pub count: usize,
    pub avg_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub avg_size: f64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceStats {
    pub cdn: Option<String>,
    pub region: Region,
    pub stats: BTreeMap<ResourceKind, KindStats>,
}

#[derive(Debug)]
struct Bucket {
    samples: VecDeque<PerformanceSample>,
    window: usize,
}

impl Bucket {
    fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    fn record(&mut self, sample: PerformanceSample) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn means(&self) -> Option<(f64, f64)> {
        if self.samples.is_empty() {
            return None;
        }
        let count = self.samples.len() as f64;
        let duration = self.samples.iter().map(|s| s.duration_ms).sum::<f64>();
        let size = self.samples.iter().map(|s| s.size_bytes as f64).sum::<f64>();
        Some((duration / count, size / count))
    }

    fn stats(&self) -> Option<KindStats> {
        let (avg_duration, avg_size) = self.means()?;
        let durations = self.samples.iter().map(|s| s.duration_ms);
        Some(KindStats {
            count: self.samples.len(),
            avg_duration,
            min_duration: durations.clone().fold(f64::INFINITY, f64::min),
            max_duration: durations.fold(f64::NEG_INFINITY, f64::max),
            avg_size,
            total_size: self.samples.iter().map(|s| s.size_bytes).sum(),
        })
    }
}

#[derive(Debug, Default)]
struct Buckets {
    owner: Option<String>,
    kinds: HashMap<ResourceKind, Bucket>,
}

/// Bounded per-kind sample store scoped to the active endpoint.
#[derive(Debug)]
pub struct TelemetryAggregator {
    selection: SelectionState,
    window: usize,
    buckets: Mutex<Buckets>,
}

impl TelemetryAggregator {
    pub fn new(selection: SelectionState) -> Self {
        Self::with_window(selection, DEFAULT_SAMPLE_WINDOW)
    }

    pub fn with_window(selection: SelectionState, window: usize) -> Self {
        Self {
            selection,
            window: window.max(1),
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Record a sample. Samples from any origin other than the active
    /// endpoint, or recorded before selection, are ignored.
    pub fn record(&self, sample: PerformanceSample) -> bool {
        let Some(active) = self.selection.current() else {
            return false;
        };
        if !active.endpoint.owns(&sample.url) {
            return false;
        }
        let kind = sample.kind();
        let mut guard = self.buckets.lock().expect("telemetry lock poisoned");
        if guard.owner.as_deref() != Some(active.endpoint.name.as_str()) {
            if let Some(previous) = guard.owner.as_deref() {
                let dropped: usize = guard.kinds.values().map(|b| b.samples.len()).sum();
                if dropped > 0 {
                    log::debug!(
                        "discarding {dropped} sample(s) served by {previous}, now {}",
                        active.endpoint.name
                    );
                }
            }
            guard.kinds.clear();
            guard.owner = Some(active.endpoint.name.clone());
        }
        guard
            .kinds
            .entry(kind)
            .or_insert_with(|| Bucket::new(self.window))
            .record(sample);
        true
    }

    pub fn samples(&self, kind: ResourceKind) -> Vec<PerformanceSample> {
        let guard = self.buckets.lock().expect("telemetry lock poisoned");
        guard
            .kinds
            .get(&kind)
            .map(|bucket| bucket.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.buckets.lock().expect("telemetry lock poisoned");
        guard.kinds.values().all(|bucket| bucket.samples.is_empty())
    }

    /// Summarise and clear every bucket in one step, tagged with the endpoint
    /// that served the samples. Returns `None` when nothing was recorded.
    pub fn take_report(&self, region: Region) -> Option<PerformanceReport> {
        let drained = std::mem::take(&mut *self.buckets.lock().expect("telemetry lock poisoned"));
        let cdn = drained.owner?;
        let data: BTreeMap<_, _> = drained
            .kinds
            .into_iter()
            .filter_map(|(kind, bucket)| {
                let (avg_duration, avg_size) = bucket.means()?;
                Some((
                    kind,
                    KindSummary {
                        count: bucket.samples.len(),
                        avg_duration,
                        avg_size,
                        cdn: cdn.clone(),
                        region,
                    },
                ))
            })
            .collect();
        if data.is_empty() {
            return None;
        }
        Some(PerformanceReport {
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        })
    }

    /// Snapshot of the current windows. Does not clear anything.
    pub fn stats(&self, region: Region) -> PerformanceStats {
        let guard = self.buckets.lock().expect("telemetry lock poisoned");
        let stats = guard
            .kinds
            .iter()
            .filter_map(|(kind, bucket)| bucket.stats().map(|stats| (*kind, stats)))
            .collect();
        PerformanceStats {
            cdn: guard
                .owner
                .clone()
                .or_else(|| self.selection.current().map(|active| active.endpoint.name.clone())),
            region,
            stats,
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telemetry endpoint returned http {0}")]
    Status(StatusCode),
}

/// Destination for packaged reports.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn submit(&self, report: &PerformanceReport) -> Result<(), TelemetryError>;
}

/// POSTs reports as JSON.
pub struct HttpTelemetrySink {
    client: Client,
    url: String,
}

impl HttpTelemetrySink {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn submit(&self, report: &PerformanceReport) -> Result<(), TelemetryError> {
        let response = self.client.post(&self.url).json(report).send().await?;
        if !response.status().is_success() {
            return Err(TelemetryError::Status(response.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was recorded since the last flush.
    Empty,
    /// Another flush was still running.
    Skipped,
    Submitted { kinds: usize },
    Failed(String),
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the aggregator into the sink, on demand or on a fixed period.
pub struct TelemetryReporter {
    aggregator: Arc<TelemetryAggregator>,
    sink: Arc<dyn TelemetrySink>,
    region: Region,
    events: Arc<EventDispatcher>,
    flushing: AtomicBool,
}

impl TelemetryReporter {
    pub fn new(
        aggregator: Arc<TelemetryAggregator>,
        sink: Arc<dyn TelemetrySink>,
        region: Region,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            aggregator,
            sink,
            region,
            events,
            flushing: AtomicBool::new(false),
        }
    }

    /// Package, clear and submit. Never fails; submission errors are logged.
    ///
    /// The in-flight marker is released when this future completes or is
    /// dropped, so a cancelled flush does not block later ones.
    pub async fn flush(&self) -> FlushOutcome {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return FlushOutcome::Skipped;
        }
        let _guard = FlushGuard(&self.flushing);
        self.flush_inner().await
    }

    async fn flush_inner(&self) -> FlushOutcome {
        let Some(report) = self.aggregator.take_report(self.region) else {
            return FlushOutcome::Empty;
        };

        let cdn = report.cdn().unwrap_or_default().to_string();
        let kinds = report.data.len();
        match self.sink.submit(&report).await {
            Ok(()) => {
                self.events
                    .dispatch(DeliveryEvent::TelemetryFlushed(TelemetryFlushedEvent {
                        cdn,
                        kinds,
                        samples: report.sample_count(),
                        timestamp: chrono::Utc::now(),
                    }));
                FlushOutcome::Submitted { kinds }
            }
            Err(err) => {
                let error = err.to_string();
                self.events
                    .dispatch(DeliveryEvent::TelemetryFailed(TelemetryFailedEvent {
                        cdn,
                        error: error.clone(),
                        timestamp: chrono::Utc::now(),
                    }));
                FlushOutcome::Failed(error)
            }
        }
    }

    /// Flush every `period` until `cancel` fires. The first flush happens one
    /// period after spawning; ticks missed while a flush is in flight are skipped.
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush().await;
                    }
                }
            }
            log::debug!("telemetry flush loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{ActiveSelection, Endpoint};
    use std::sync::atomic::AtomicUsize;

    const BASE: &str = "https://cdn.example.com";

    fn selected() -> SelectionState {
        let state = SelectionState::new();
        state.replace(ActiveSelection::unmeasured(
            Endpoint::new("cloudflare", BASE, [Region::Global], 1).unwrap(),
        ));
        state
    }

    fn sample(path: &str, duration_ms: f64, size: u64) -> PerformanceSample {
        PerformanceSample::new(format!("{BASE}{path}"), duration_ms, size)
    }

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<PerformanceReport>>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn submit(&self, report: &PerformanceReport) -> Result<(), TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TelemetryError::Status(StatusCode::SERVICE_UNAVAILABLE));
            }
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    fn reporter(
        aggregator: Arc<TelemetryAggregator>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Arc<TelemetryReporter> {
        Arc::new(TelemetryReporter::new(
            aggregator,
            sink,
            Region::Eu,
            Arc::new(EventDispatcher::new()),
        ))
    }

    #[test]
    fn bucket_keeps_most_recent_window() {
        let aggregator = TelemetryAggregator::new(selected());
        for i in 0..250 {
            aggregator.record(sample(&format!("/img/{i}.png"), i as f64, 10));
        }
        let samples = aggregator.samples(ResourceKind::Image);
        assert_eq!(samples.len(), DEFAULT_SAMPLE_WINDOW);
        assert_eq!(samples.first().unwrap().url, format!("{BASE}/img/150.png"));
        assert_eq!(samples.last().unwrap().url, format!("{BASE}/img/249.png"));
    }

    #[test]
    fn ignores_foreign_origins_and_unselected_state() {
        let aggregator = TelemetryAggregator::new(selected());
        assert!(!aggregator.record(PerformanceSample::new("https://fonts.other.com/a.woff2", 5.0, 1)));
        assert!(aggregator.record(sample("/a.woff2", 5.0, 1)));

        let unselected = TelemetryAggregator::new(SelectionState::new());
        assert!(!unselected.record(sample("/a.css", 1.0, 1)));
        assert!(unselected.is_empty());
    }

    #[test]
    fn unknown_extensions_bucket_to_other() {
        let aggregator = TelemetryAggregator::new(selected());
        aggregator.record(sample("/api/data.bin", 3.0, 7));
        assert_eq!(aggregator.samples(ResourceKind::Other).len(), 1);
    }

    #[test]
    fn report_summarises_and_clears() {
        let aggregator = TelemetryAggregator::new(selected());
        aggregator.record(sample("/a.js", 10.0, 100));
        aggregator.record(sample("/b.js", 30.0, 300));
        aggregator.record(sample("/a.css", 5.0, 50));

        let report = aggregator.take_report(Region::Eu).unwrap();
        let scripts = &report.data[&ResourceKind::Script];
        assert_eq!(scripts.count, 2);
        assert_eq!(scripts.avg_duration, 20.0);
        assert_eq!(scripts.avg_size, 200.0);
        assert_eq!(scripts.cdn, "cloudflare");
        assert_eq!(report.data.len(), 2);
        assert!(aggregator.is_empty());
        assert!(aggregator.take_report(Region::Eu).is_none());
    }

    #[test]
    fn report_serializes_to_wire_shape() {
        let aggregator = TelemetryAggregator::new(selected());
        aggregator.record(sample("/logo.svg", 12.0, 2048));
        let report = aggregator.take_report(Region::Cn).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["timestamp"].is_i64());
        assert_eq!(
            json["data"]["image"],
            serde_json::json!({
                "count": 1,
                "avgDuration": 12.0,
                "avgSize": 2048.0,
                "cdn": "cloudflare",
                "region": "cn"
            })
        );
    }

    #[test]
    fn stats_do_not_clear() {
        let aggregator = TelemetryAggregator::new(selected());
        aggregator.record(sample("/a.png", 10.0, 100));
        aggregator.record(sample("/b.png", 40.0, 300));
        let stats = aggregator.stats(Region::Us);
        let images = &stats.stats[&ResourceKind::Image];
        assert_eq!(stats.cdn.as_deref(), Some("cloudflare"));
        assert_eq!(images.min_duration, 10.0);
        assert_eq!(images.max_duration, 40.0);
        assert_eq!(images.total_size, 400);
        assert!(!aggregator.is_empty());
    }

    #[tokio::test]
    async fn failed_submission_still_clears() {
        let aggregator = Arc::new(TelemetryAggregator::new(selected()));
        aggregator.record(sample("/a.png", 10.0, 100));
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let reporter = reporter(aggregator.clone(), sink.clone());

        assert!(matches!(reporter.flush().await, FlushOutcome::Failed(_)));
        assert!(aggregator.is_empty());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_flush_sends_nothing() {
        let aggregator = Arc::new(TelemetryAggregator::new(selected()));
        let sink = Arc::new(RecordingSink::default());
        let reporter = reporter(aggregator, sink.clone());
        assert_eq!(reporter.flush().await, FlushOutcome::Empty);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn periodic_loop_flushes_until_cancelled() {
        let aggregator = Arc::new(TelemetryAggregator::new(selected()));
        let sink = Arc::new(RecordingSink::default());
        let reporter = reporter(aggregator.clone(), sink.clone());

        aggregator.record(sample("/a.mp4", 100.0, 1000));
        let cancel = CancellationToken::new();
        let handle = reporter.spawn(Duration::from_millis(50), cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].data[&ResourceKind::Video].region, Region::Eu);
        assert!(aggregator.is_empty());
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
    async fn abandoned_flush_does_not_block_later_flushes() {
        let aggregator = Arc::new(TelemetryAggregator::new(selected()));
        let reporter = reporter(aggregator.clone(), Arc::new(StalledSink));

        aggregator.record(sample("/a.png", 10.0, 100));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), reporter.flush()).await;
        assert!(abandoned.is_err());

        assert_eq!(reporter.flush().await, FlushOutcome::Empty);
    }

    #[test]
    fn reports_carry_the_endpoint_that_served_them() {
        let selection = selected();
        let aggregator = TelemetryAggregator::new(selection.clone());
        aggregator.record(sample("/a.js", 10.0, 100));

        selection.replace(ActiveSelection::unmeasured(
            Endpoint::new("cloudfront", "https://edge.example.net", [Region::Eu], 2).unwrap(),
        ));
        // Switching alone keeps the existing windows and their owner.
        let report = aggregator.take_report(Region::Eu).unwrap();
        assert_eq!(report.cdn(), Some("cloudflare"));

        aggregator.record(sample("/b.js", 10.0, 100));
        assert!(aggregator.is_empty());
        aggregator.record(PerformanceSample::new("https://edge.example.net/c.js", 30.0, 300));
        let report = aggregator.take_report(Region::Eu).unwrap();
        assert_eq!(report.cdn(), Some("cloudfront"));
        assert_eq!(report.data[&ResourceKind::Script].count, 1);
        assert_eq!(report.data[&ResourceKind::Script].avg_duration, 30.0);
    }

    #[test]
    fn first_sample_from_new_endpoint_discards_previous_windows() {
        let selection = selected();
        let aggregator = TelemetryAggregator::new(selection.clone());
        aggregator.record(sample("/a.css", 10.0, 100));
        aggregator.record(sample("/b.png", 10.0, 100));

        selection.replace(ActiveSelection::unmeasured(
            Endpoint::new("cloudfront", "https://edge.example.net", [Region::Eu], 2).unwrap(),
        ));
        assert!(aggregator.record(PerformanceSample::new("https://edge.example.net/c.css", 5.0, 50)));

        let stats = aggregator.stats(Region::Eu);
        assert_eq!(stats.cdn.as_deref(), Some("cloudfront"));
        assert_eq!(stats.stats.len(), 1);
        assert_eq!(stats.stats[&ResourceKind::Style].count, 1);
    }
}

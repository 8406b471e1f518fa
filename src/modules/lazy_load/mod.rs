//! Deferred image loading.
//!
//! Each registered image starts `Pending` with its real source held back in a
//! deferred attribute. When a [`ViewportObserver`] reports it within the
//! configured margin of the viewport, the image moves to `Loading`, the real
//! source is fetched, and the image ends `Loaded` or `Errored`. Without an
//! observer every image is loaded immediately.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::task::JoinSet;

pub const LOADED_CLASS: &str = "loaded";
pub const ERROR_CLASS: &str = "error";

pub type ImageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Loading,
    Loaded,
    Errored,
}

/// An image element under lazy-load control.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyImage {
    src: String,
    deferred_src: Option<String>,
    classes: BTreeSet<String>,
    state: LoadState,
}

impl LazyImage {
    pub fn new(placeholder: impl Into<String>, deferred_src: impl Into<String>) -> Self {
        Self {
            src: placeholder.into(),
            deferred_src: Some(deferred_src.into()),
            classes: BTreeSet::new(),
            state: LoadState::Pending,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.insert(class.into());
        self
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn deferred_src(&self) -> Option<&str> {
        self.deferred_src.as_deref()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.contains(class)
    }

    pub fn state(&self) -> LoadState {
        self.state
    }
}

/// Element bounds relative to the viewport origin, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Position update for an observed image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityEvent {
    pub image: ImageId,
    pub bounds: BoundingBox,
    pub viewport: Viewport,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LazyLoadConfig {
    pub vertical_margin: f64,
    pub horizontal_margin: f64,
}

impl Default for LazyLoadConfig {
    fn default() -> Self {
        Self {
            vertical_margin: 50.0,
            horizontal_margin: 0.0,
        }
    }
}

impl LazyLoadConfig {
    /// Whether the image box intersects the viewport grown by the margins.
    pub fn is_near(&self, event: &ProximityEvent) -> bool {
        let b = event.bounds;
        b.bottom >= -self.vertical_margin
            && b.top <= event.viewport.height + self.vertical_margin
            && b.right >= -self.horizontal_margin
            && b.left <= event.viewport.width + self.horizontal_margin
    }
}

/// Platform hook delivering position updates for an image.
pub trait ViewportObserver: Send + Sync {
    fn observe(&self, image: ImageId) -> BoxStream<'static, ProximityEvent>;
}

#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("image request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("image request returned http {0}")]
    Status(StatusCode),
}

/// Fetches the real image bytes before the source is swapped in.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<(), ImageLoadError>;
}

pub struct ReqwestImageFetcher {
    client: Client,
}

impl ReqwestImageFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for ReqwestImageFetcher {
    async fn fetch(&self, url: &str) -> Result<(), ImageLoadError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ImageLoadError::Status(response.status()));
        }
        response.bytes().await?;
        Ok(())
    }
}

struct Shared {
    images: Mutex<HashMap<ImageId, LazyImage>>,
    fetcher: Arc<dyn ImageFetcher>,
}

impl Shared {
    async fn load(&self, id: ImageId) {
        let url = {
            let mut images = self.images.lock().expect("lazy-load lock poisoned");
            let Some(image) = images.get_mut(&id) else {
                return;
            };
            if image.state != LoadState::Pending {
                return;
            }
            let Some(url) = image.deferred_src.clone() else {
                return;
            };
            image.state = LoadState::Loading;
            url
        };

        let result = self.fetcher.fetch(&url).await;

        let mut images = self.images.lock().expect("lazy-load lock poisoned");
        let Some(image) = images.get_mut(&id) else {
            return;
        };
        match result {
            Ok(()) => {
                image.src = url;
                image.deferred_src = None;
                image.classes.insert(LOADED_CLASS.to_string());
                image.state = LoadState::Loaded;
            }
            Err(err) => {
                log::warn!("image load failed for {url}: {err}");
                image.classes.insert(ERROR_CLASS.to_string());
                image.state = LoadState::Errored;
            }
        }
    }
}

pub struct LazyLoadController {
    config: LazyLoadConfig,
    observer: Option<Arc<dyn ViewportObserver>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
}

impl LazyLoadController {
    /// `observer: None` selects fallback mode.
    pub fn new(
        config: LazyLoadConfig,
        observer: Option<Arc<dyn ViewportObserver>>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            config,
            observer,
            shared: Arc::new(Shared {
                images: Mutex::new(HashMap::new()),
                fetcher,
            }),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.observer.is_none()
    }

    /// Start controlling `image`. Must be called inside a Tokio runtime.
    pub fn register(&self, image: LazyImage) -> ImageId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .images
            .lock()
            .expect("lazy-load lock poisoned")
            .insert(id, image);

        let shared = self.shared.clone();
        let mut tasks = self.tasks.lock().expect("lazy-load task lock poisoned");
        reap_finished(&mut tasks);
        match &self.observer {
            Some(observer) => {
                let mut events = observer.observe(id);
                let config = self.config;
                tasks.spawn(async move {
                    while let Some(event) = events.next().await {
                        if event.image == id && config.is_near(&event) {
                            shared.load(id).await;
                            break;
                        }
                    }
                });
            }
            None => {
                tasks.spawn(async move { shared.load(id).await });
            }
        }
        id
    }

    pub fn image(&self, id: ImageId) -> Option<LazyImage> {
        self.shared
            .images
            .lock()
            .expect("lazy-load lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn state(&self, id: ImageId) -> Option<LoadState> {
        self.image(id).map(|image| image.state)
    }

    pub fn count_in(&self, state: LoadState) -> usize {
        self.shared
            .images
            .lock()
            .expect("lazy-load lock poisoned")
            .values()
            .filter(|image| image.state == state)
            .count()
    }

    /// Load and observation tasks not yet reaped.
    pub fn active_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().expect("lazy-load task lock poisoned");
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// Wait for every spawned load and observation task to finish.
    /// Observation tasks finish once their image loads or their stream ends.
    pub async fn settle(&self) {
        loop {
            let mut tasks =
                std::mem::take(&mut *self.tasks.lock().expect("lazy-load task lock poisoned"));
            if tasks.is_empty() {
                break;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(err) = result {
                    log::warn!("lazy-load task ended abnormally: {err}");
                }
            }
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(err) = result {
            log::warn!("lazy-load task ended abnormally: {err}");
        }
    }
}

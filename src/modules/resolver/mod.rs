//! Asset URL rewriting against the active endpoint.

use url::form_urlencoded;

use crate::routing::SelectionState;

pub const DEFAULT_IMAGE_QUALITY: u8 = 85;
pub const DEFAULT_IMAGE_FORMAT: &str = "auto";

/// Optimisation parameters appended to a resolved URL.
///
/// Parameters are emitted in a fixed order (`v`, `f`, `q`, `w`, `h`) so the
/// same inputs always produce the same, cacheable URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    pub version: Option<String>,
    pub format: Option<String>,
    pub quality: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    fn query(&self) -> Option<String> {
        let mut query = form_urlencoded::Serializer::new(String::new());
        let mut any = false;
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                query.append_pair(key, &value);
                any = true;
            }
        };
        push("v", self.version.clone());
        push("f", self.format.clone());
        push("q", self.quality.map(|q| q.to_string()));
        push("w", self.width.map(|w| w.to_string()));
        push("h", self.height.map(|h| h.to_string()));
        any.then(|| query.finish())
    }
}

/// Image-specific options; quality and format have defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
    pub format: String,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            quality: DEFAULT_IMAGE_QUALITY,
            format: DEFAULT_IMAGE_FORMAT.to_string(),
        }
    }
}

impl From<&ImageOptions> for ResolveOptions {
    fn from(options: &ImageOptions) -> Self {
        ResolveOptions {
            version: None,
            format: Some(options.format.clone()),
            quality: Some(options.quality),
            width: options.width,
            height: options.height,
        }
    }
}

/// Join `path` onto `base_url` with exactly one separator and append the
/// optimisation query.
pub fn build_url(base_url: &str, path: &str, options: &ResolveOptions) -> String {
    let mut url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(query) = options.query() {
        url.push('?');
        url.push_str(&query);
    }
    url
}

/// Resolves asset paths against whatever endpoint is currently selected.
#[derive(Debug, Clone)]
pub struct UrlResolver {
    selection: SelectionState,
}

impl UrlResolver {
    pub fn new(selection: SelectionState) -> Self {
        Self { selection }
    }

    /// Resolve `path`. Before any endpoint has been selected the path is
    /// returned unchanged so pages can render immediately.
    pub fn resolve(&self, path: &str, options: &ResolveOptions) -> String {
        match self.selection.current() {
            Some(active) => {
                let url = build_url(&active.endpoint.base_url, path, options);
                log::debug!("resolved {path} -> {url}");
                url
            }
            None => path.to_string(),
        }
    }

    pub fn resolve_image(&self, path: &str, options: &ImageOptions) -> String {
        self.resolve(path, &ResolveOptions::from(options))
    }
}

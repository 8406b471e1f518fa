//! Resource kind classification.
//!
//! Maps file extensions onto asset kinds and the delivery policy attached to
//! each kind. The policy is configuration only; nothing here performs I/O.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

const DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Image,
    Video,
    Script,
    Style,
    Font,
    Document,
    Other,
}

/// Caching and optimisation hints for a [`ResourceKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub extensions: &'static [&'static str],
    pub cache_ttl: Option<Duration>,
    pub compress: bool,
    pub minify: bool,
    pub lazy_load: bool,
}

const IMAGE: ResourcePolicy = ResourcePolicy {
    extensions: &["jpg", "jpeg", "png", "gif", "webp", "svg"],
    cache_ttl: Some(Duration::from_secs(DAY * 30)),
    compress: true,
    minify: false,
    lazy_load: true,
};

const VIDEO: ResourcePolicy = ResourcePolicy {
    extensions: &["mp4", "webm", "ogg"],
    cache_ttl: Some(Duration::from_secs(DAY * 7)),
    compress: true,
    minify: false,
    lazy_load: true,
};

const SCRIPT: ResourcePolicy = ResourcePolicy {
    extensions: &["js", "mjs"],
    cache_ttl: Some(Duration::from_secs(DAY * 7)),
    compress: true,
    minify: true,
    lazy_load: false,
};

const STYLE: ResourcePolicy = ResourcePolicy {
    extensions: &["css"],
    cache_ttl: Some(Duration::from_secs(DAY * 7)),
    compress: true,
    minify: true,
    lazy_load: false,
};

const FONT: ResourcePolicy = ResourcePolicy {
    extensions: &["woff", "woff2", "ttf", "otf"],
    cache_ttl: Some(Duration::from_secs(DAY * 365)),
    compress: false,
    minify: false,
    lazy_load: false,
};

const DOCUMENT: ResourcePolicy = ResourcePolicy {
    extensions: &["pdf", "doc", "docx", "ppt", "pptx"],
    cache_ttl: Some(Duration::from_secs(DAY * 30)),
    compress: true,
    minify: false,
    lazy_load: false,
};

const OTHER: ResourcePolicy = ResourcePolicy {
    extensions: &[],
    cache_ttl: None,
    compress: false,
    minify: false,
    lazy_load: false,
};

static EXTENSIONS: Lazy<HashMap<&'static str, ResourceKind>> = Lazy::new(|| {
    ResourceKind::ALL
        .iter()
        .flat_map(|kind| kind.policy().extensions.iter().map(move |ext| (*ext, *kind)))
        .collect()
});

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Image,
        ResourceKind::Video,
        ResourceKind::Script,
        ResourceKind::Style,
        ResourceKind::Font,
        ResourceKind::Document,
        ResourceKind::Other,
    ];

    pub fn policy(self) -> &'static ResourcePolicy {
        match self {
            ResourceKind::Image => &IMAGE,
            ResourceKind::Video => &VIDEO,
            ResourceKind::Script => &SCRIPT,
            ResourceKind::Style => &STYLE,
            ResourceKind::Font => &FONT,
            ResourceKind::Document => &DOCUMENT,
            ResourceKind::Other => &OTHER,
        }
    }

    /// Classify by extension, case-insensitively. Unknown or missing
    /// extensions are [`ResourceKind::Other`].
    pub fn from_extension(ext: &str) -> Self {
        EXTENSIONS
            .get(ext.to_ascii_lowercase().as_str())
            .copied()
            .unwrap_or(ResourceKind::Other)
    }

    /// Classify a URL or path by the extension of its last path segment.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let segment = path.rsplit('/').next().unwrap_or_default();
        match segment.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => Self::from_extension(ext),
            _ => ResourceKind::Other,
        }
    }

    /// Value of the `as` attribute for a preload hint.
    pub fn preload_destination(self) -> Option<&'static str> {
        match self {
            ResourceKind::Image => Some("image"),
            ResourceKind::Video => Some("video"),
            ResourceKind::Script => Some("script"),
            ResourceKind::Style => Some("style"),
            ResourceKind::Font => Some("font"),
            ResourceKind::Document | ResourceKind::Other => None,
        }
    }

    /// Fonts must be preloaded in anonymous CORS mode or the browser fetches twice.
    pub fn requires_cors(self) -> bool {
        self == ResourceKind::Font
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Image => "image",
            ResourceKind::Video => "video",
            ResourceKind::Script => "script",
            ResourceKind::Style => "style",
            ResourceKind::Font => "font",
            ResourceKind::Document => "document",
            ResourceKind::Other => "other",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

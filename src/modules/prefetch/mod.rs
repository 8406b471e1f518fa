//! Resource hint emission with per-URL deduplication.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::modules::resource_kind::ResourceKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HintPriority {
    High,
    #[default]
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintRel {
    /// Eager fetch for the current navigation.
    Preload,
    /// Best-effort fetch for a likely future navigation.
    Prefetch,
}

impl HintRel {
    pub fn as_str(self) -> &'static str {
        match self {
            HintRel::Preload => "preload",
            HintRel::Prefetch => "prefetch",
        }
    }
}

impl From<HintPriority> for HintRel {
    fn from(priority: HintPriority) -> Self {
        match priority {
            HintPriority::High => HintRel::Preload,
            HintPriority::Low => HintRel::Prefetch,
        }
    }
}

/// A `<link>` resource hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHint {
    pub rel: HintRel,
    pub href: String,
    pub destination: Option<&'static str>,
    pub crossorigin: bool,
}

impl ResourceHint {
    pub fn new(rel: HintRel, href: impl Into<String>) -> Self {
        let href = href.into();
        let kind = ResourceKind::from_url(&href);
        let (destination, crossorigin) = match rel {
            HintRel::Preload => (kind.preload_destination(), kind.requires_cors()),
            HintRel::Prefetch => (None, false),
        };
        Self {
            rel,
            href,
            destination,
            crossorigin,
        }
    }

    pub fn to_html(&self) -> String {
        let mut tag = format!(
            "<link rel=\"{}\" href=\"{}\"",
            self.rel.as_str(),
            html_escape::encode_double_quoted_attribute(&self.href)
        );
        if let Some(destination) = self.destination {
            tag.push_str(&format!(" as=\"{destination}\""));
        }
        if self.crossorigin {
            tag.push_str(" crossorigin=\"anonymous\"");
        }
        tag.push('>');
        tag
    }
}

/// Receives hints destined for the document head.
pub trait HintSink: Send + Sync {
    fn emit(&self, hint: ResourceHint);
}

/// Collects hints in emission order and renders them as markup.
#[derive(Debug, Default)]
pub struct HeadHints {
    hints: Mutex<Vec<ResourceHint>>,
}

impl HeadHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hints(&self) -> Vec<ResourceHint> {
        self.hints.lock().expect("hint lock poisoned").clone()
    }

    pub fn render(&self) -> String {
        self.hints
            .lock()
            .expect("hint lock poisoned")
            .iter()
            .map(ResourceHint::to_html)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl HintSink for HeadHints {
    fn emit(&self, hint: ResourceHint) {
        self.hints.lock().expect("hint lock poisoned").push(hint);
    }
}

/// Emits at most one hint per URL for the lifetime of the controller.
pub struct PrefetchController {
    sink: Arc<dyn HintSink>,
    seen: Mutex<HashSet<String>>,
}

impl PrefetchController {
    pub fn new(sink: Arc<dyn HintSink>) -> Self {
        Self {
            sink,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Hint `url`. Returns `false` when the URL was already hinted.
    pub fn prefetch(&self, url: &str, priority: HintPriority) -> bool {
        let first = self
            .seen
            .lock()
            .expect("prefetch lock poisoned")
            .insert(url.to_string());
        if !first {
            return false;
        }
        log::debug!("{} hint for {url}", HintRel::from(priority).as_str());
        self.sink.emit(ResourceHint::new(priority.into(), url));
        true
    }

    pub fn prefetch_page(&self, url: &str) -> bool {
        self.prefetch(url, HintPriority::Low)
    }

    pub fn prefetch_critical<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        urls.into_iter()
            .filter(|url| self.prefetch(url.as_ref(), HintPriority::High))
            .count()
    }

    pub fn is_hinted(&self, url: &str) -> bool {
        self.seen.lock().expect("prefetch lock poisoned").contains(url)
    }
}

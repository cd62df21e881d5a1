//! HTTP-first fetching with a headless-browser fallback.

use crate::error::{FetchError, FetchResult};
use crate::scraper::browser::Renderer;
use crate::scraper::http_client::PageSource;
use scraper::{Html, Selector};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Visible-text markers of a page still waiting for its scripts.
pub const LOADING_MARKERS: &[&str] = &[
    "loading...",
    "please wait",
    "javascript is required",
    "enable javascript",
    "laster...",
    "vennligst vent",
    "laddar...",
];

/// What a fully rendered page of a given site looks like.
#[derive(Debug, Clone, Copy)]
pub struct RenderHints {
    pub markers: &'static [&'static str],
    /// At least one of these must match for the page to count as rendered.
    pub containers: &'static [&'static str],
    pub min_text_len: usize,
}

impl RenderHints {
    /// Hints for documents that are never rendered (feeds, JSON).
    pub const NEVER: RenderHints = RenderHints {
        markers: &[],
        containers: &[],
        min_text_len: 0,
    };
}

/// Whether `html` needs a script-executing browser to be useful.
pub fn needs_render(html: &str, hints: &RenderHints) -> bool {
    let doc = Html::parse_document(html);
    let text = visible_text(&doc);

    let lower = text.to_lowercase();
    if hints.markers.iter().any(|m| lower.contains(m)) {
        return true;
    }

    if text.chars().count() < hints.min_text_len {
        return true;
    }

    if hints.containers.is_empty() {
        return false;
    }
    !hints.containers.iter().any(|css| match Selector::parse(css) {
        Ok(sel) => doc.select(&sel).next().is_some(),
        Err(_) => false,
    })
}

/// Text outside `script`/`style`/`noscript`, whitespace-trimmed per node.
fn visible_text(doc: &Html) -> String {
    let mut out = String::new();
    for node in doc.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript" | "template"));
        if hidden {
            continue;
        }
        let t = text.trim();
        if !t.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(t);
        }
    }
    out
}

// ── Strategy ──────────────────────────────────────────────────────────────────

pub struct FetchStrategy {
    http: Arc<dyn PageSource>,
    renderer: Option<Arc<dyn Renderer>>,
}

impl FetchStrategy {
    pub fn new(http: Arc<dyn PageSource>, renderer: Option<Arc<dyn Renderer>>) -> Self {
        Self { http, renderer }
    }

    /// `Ok(None)` means the URL is done for this cycle without a document.
    /// Only a browser that cannot be started at all is an `Err`.
    pub async fn fetch(&self, url: &str, hints: &RenderHints) -> FetchResult<Option<String>> {
        let html = match self.http.get_text(url).await {
            Ok(html) => html,
            Err(FetchError::RobotsDisallowed { .. }) => {
                info!(url, "Disallowed by robots.txt, skipping");
                return Ok(None);
            }
            Err(e) => {
                warn!(url, "Fetch failed: {}", e);
                return Ok(None);
            }
        };

        if !needs_render(&html, hints) {
            return Ok(Some(html));
        }

        let Some(renderer) = &self.renderer else {
            debug!(url, "Render required but browser disabled; using raw HTML");
            return Ok(Some(html));
        };

        info!(url, "Content looks script-rendered, using browser");
        match renderer.render(url).await {
            Ok(rendered) => Ok(Some(rendered)),
            Err(e @ FetchError::BrowserUnavailable(_)) => Err(e),
            Err(e) => {
                warn!(url, "Render failed: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn close(&self) {
        if let Some(renderer) = &self.renderer {
            renderer.close().await;
        }
    }
}

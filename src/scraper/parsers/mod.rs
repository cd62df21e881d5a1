//! Per-source extraction.
//!
//! Every source is a [`Site`] variant. A variant owns its selectors and turns
//! one fetched document into candidate records. Extraction never fails as a
//! whole: a container that can't be read is logged and skipped.

pub mod hegnar;
pub mod nasdaq;
pub mod newsweb;
pub mod nordnet;
pub mod placera;

use crate::models::Candidate;
use crate::scraper::cleaner::{normalize_whitespace, try_parse_site_time, SiteTime};
use crate::scraper::fetch::RenderHints;
use anyhow::Result;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, error, warn};
use url::Url;

/// Posts with less text than this are noise ("+1", emoji).
pub const MIN_POST_CHARS: usize = 10;

/// Everything a parser knows besides the document.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub forum_id: i32,
    pub fetched_at: DateTime<Utc>,
    pub page_url: String,
    /// Thread- or feed-level ticker, when one is known before parsing.
    pub thread_hint: Option<String>,
}

impl ParseContext {
    pub fn new(forum_id: i32, page_url: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            forum_id,
            fetched_at,
            page_url: page_url.into(),
            thread_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.thread_hint = hint;
        self
    }

    /// Resolve a possibly relative link against the page URL.
    pub fn absolute(&self, href: &str) -> Option<String> {
        Url::parse(&self.page_url)
            .and_then(|base| base.join(href))
            .ok()
            .map(String::from)
    }
}

// ── Sites ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Site {
    Hegnar,
    Placera,
    Nordnet,
    OsloBors,
    Nasdaq,
}

impl Site {
    pub const ALL: [Site; 5] = [
        Site::Hegnar,
        Site::Placera,
        Site::Nordnet,
        Site::OsloBors,
        Site::Nasdaq,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Site::Hegnar => "hegnar",
            Site::Placera => "placera",
            Site::Nordnet => "nordnet",
            Site::OsloBors => "oslobors",
            Site::Nasdaq => "nasdaq",
        }
    }

    pub fn from_name(name: &str) -> Option<Site> {
        Site::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Records without a resolved ticker are dropped for these sources.
    pub fn ticker_required(&self) -> bool {
        match self {
            Site::Placera | Site::OsloBors | Site::Nasdaq => true,
            // Hegnar has a general board; Shareville is general discussion.
            Site::Hegnar | Site::Nordnet => false,
        }
    }

    pub fn render_hints(&self) -> RenderHints {
        match self {
            Site::Hegnar => hegnar::RENDER_HINTS,
            Site::Placera => placera::RENDER_HINTS,
            Site::Nordnet => nordnet::RENDER_HINTS,
            Site::OsloBors | Site::Nasdaq => RenderHints::NEVER,
        }
    }

    /// Listing page `page` (1-based) of a forum; `None` for feed sources.
    pub fn listing_url(&self, base_url: &str, page: u32) -> Option<String> {
        let base = base_url.trim_end_matches('/');
        let first = match self {
            Site::Hegnar => format!("{}/forum/", base),
            Site::Placera => format!("{}/", base),
            Site::Nordnet => format!("{}/aksjeforum", base),
            Site::OsloBors | Site::Nasdaq => return None,
        };
        Some(paged_url(&first, page))
    }

    pub fn parse(&self, document: &str, ctx: &ParseContext) -> Vec<Candidate> {
        let out = match self {
            Site::Hegnar => hegnar::parse_posts(document, ctx),
            Site::Placera => placera::parse(document, ctx),
            Site::Nordnet => nordnet::parse(document, ctx),
            Site::OsloBors => newsweb::parse(document, ctx),
            Site::Nasdaq => nasdaq::parse(document, ctx),
        };
        match out {
            Ok(records) => records,
            Err(e) => {
                error!(site = self.name(), "Extraction failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

/// `url` for page 1, `url?page=N` (or `&page=N`) after that.
pub fn paged_url(url: &str, page: u32) -> String {
    if page <= 1 {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}page={}", url, sep, page)
}

// ── Selectors ─────────────────────────────────────────────────────────────────

pub fn css(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow::anyhow!("selector {:?}: {:?}", selector, e))
}

/// CSS for one layout of a post list.
#[derive(Debug, Clone, Copy)]
pub struct SelectorSet {
    pub container: &'static str,
    pub author: &'static str,
    pub timestamp: &'static str,
    pub body: &'static str,
    pub title: Option<&'static str>,
    pub ticker_tag: Option<&'static str>,
}

pub struct Selectors {
    pub container: Selector,
    pub author: Selector,
    pub timestamp: Selector,
    pub body: Selector,
    pub title: Option<Selector>,
    pub ticker_tag: Option<Selector>,
}

impl Selectors {
    pub fn compile(set: &SelectorSet) -> Result<Self> {
        Ok(Self {
            container: css(set.container)?,
            author: css(set.author)?,
            timestamp: css(set.timestamp)?,
            body: css(set.body)?,
            title: set.title.map(css).transpose()?,
            ticker_tag: set.ticker_tag.map(css).transpose()?,
        })
    }
}

/// Containers matched by `primary`, or by `fallback` when `primary` finds
/// none. Returns the set that matched so fields are read consistently.
pub fn select_containers<'a, 's>(
    doc: &'a Html,
    primary: &'s Selectors,
    fallback: &'s Selectors,
) -> (Vec<ElementRef<'a>>, &'s Selectors) {
    let found: Vec<_> = doc.select(&primary.container).collect();
    if !found.is_empty() {
        return (found, primary);
    }
    let found: Vec<_> = doc.select(&fallback.container).collect();
    if !found.is_empty() {
        warn!(
            "Primary selectors matched nothing, {} containers via fallback",
            found.len()
        );
    }
    (found, fallback)
}

/// Run `build` over every container or feed item, skipping the ones that fail.
pub fn extract_each<T, F>(source: &str, items: Vec<T>, mut build: F) -> Vec<Candidate>
where
    F: FnMut(T) -> Result<Option<Candidate>>,
{
    let total = items.len();
    let mut out = Vec::with_capacity(total);
    for (i, item) in items.into_iter().enumerate() {
        match build(item) {
            Ok(Some(candidate)) => out.push(candidate),
            Ok(None) => {}
            Err(e) => warn!(source, "Skipping item {}/{}: {:#}", i + 1, total, e),
        }
    }
    debug!(source, "Extracted {} of {} items", out.len(), total);
    out
}

// ── Text helpers ──────────────────────────────────────────────────────────────

/// Whitespace-normalised text of an element.
pub fn element_text(el: ElementRef<'_>) -> String {
    normalize_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn first_text(el: ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .map(element_text)
        .find(|t| !t.is_empty())
}

pub fn first_attr(el: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    el.select(sel)
        .find_map(|e| e.value().attr(attr))
        .map(str::to_string)
}

/// First timestamp under `sel` that parses, preferring `datetime` attributes.
pub fn first_timestamp(
    el: ElementRef<'_>,
    sel: &Selector,
    fetched_at: DateTime<Utc>,
) -> Option<SiteTime> {
    el.select(sel).find_map(|s| {
        s.value()
            .attr("datetime")
            .and_then(|dt| try_parse_site_time(dt, fetched_at))
            .or_else(|| try_parse_site_time(&element_text(s), fetched_at))
    })
}

/// Element text leaving out anything nested under the named tags.
pub fn text_without(el: ElementRef<'_>, skip: &[&str]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let skipped = node
            .ancestors()
            .take_while(|a| a.id() != el.id())
            .any(|a| a.value().as_element().is_some_and(|e| skip.contains(&e.name())));
        if !skipped {
            parts.push(&**text);
        }
    }
    normalize_whitespace(&parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_names_round_trip() {
        for site in Site::ALL {
            assert_eq!(Site::from_name(site.name()), Some(site));
        }
        assert_eq!(Site::from_name(" Hegnar "), Some(Site::Hegnar));
        assert!(Site::from_name("reddit").is_none());
    }

    #[test]
    fn listing_urls() {
        assert_eq!(
            Site::Hegnar.listing_url("https://www.finansavisen.no/", 1).as_deref(),
            Some("https://www.finansavisen.no/forum/")
        );
        assert_eq!(
            Site::Nordnet.listing_url("https://www.nordnet.no", 3).as_deref(),
            Some("https://www.nordnet.no/aksjeforum?page=3")
        );
        assert!(Site::Nasdaq.listing_url("https://x", 1).is_none());
        assert_eq!(paged_url("https://x/a?b=1", 2), "https://x/a?b=1&page=2");
    }

    #[test]
    fn quotes_are_dropped_from_text() {
        let doc = Html::parse_fragment(
            "<div id='c'><blockquote>old <b>quoted</b> words</blockquote><p>Fresh   reply</p></div>",
        );
        let div = doc.select(&css("#c").unwrap()).next().unwrap();
        assert_eq!(text_without(div, &["blockquote"]), "Fresh reply");
        assert_eq!(element_text(div), "old quoted words Fresh reply");
    }

    #[test]
    fn bad_selector_is_an_error() {
        assert!(css("div[").is_err());
    }

    #[test]
    fn relative_links_resolve_against_page() {
        let ctx = ParseContext::new(1, "https://forum.placera.se/", Utc::now());
        assert_eq!(
            ctx.absolute("/inlagg/12345").as_deref(),
            Some("https://forum.placera.se/inlagg/12345")
        );
    }
}

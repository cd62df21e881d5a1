//! Placera forum (Avanza).
//!
//! The feed is a paged list of `article.post-card`. Each card names its
//! company through a destination label, which is a display name rather than
//! a symbol, so most tickers come from the body scan.

use super::{
    css, element_text, extract_each, first_attr, first_text, first_timestamp, select_containers,
    ParseContext, SelectorSet, Selectors, MIN_POST_CHARS,
};
use crate::models::{Candidate, Post};
use crate::scraper::cleaner::SiteTime;
use crate::scraper::fetch::{RenderHints, LOADING_MARKERS};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

pub const RENDER_HINTS: RenderHints = RenderHints {
    markers: LOADING_MARKERS,
    containers: &["article.post-card", "div.post-list"],
    min_text_len: 200,
};

const PRIMARY: SelectorSet = SelectorSet {
    container: "article.post-card",
    author: "a[data-testid='author-name']",
    timestamp: "time, p > span",
    body: "div.post-body",
    title: Some("h3"),
    ticker_tag: Some("a[data-testid='destination-label']"),
};

const FALLBACK: SelectorSet = SelectorSet {
    container: "div.forum-post, article.forum-post, div.thread-post, div.message",
    author: ".author, .username, .user, .poster",
    timestamp: "time, .timestamp, .date, .time, .post-date",
    body: ".content, .message-text, .post-text, .post-content",
    title: Some("h3, h4"),
    ticker_tag: None,
};

static POST_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/inlagg/(\d+)").expect("post link regex"));

pub fn parse(html: &str, ctx: &ParseContext) -> Result<Vec<Candidate>> {
    let doc = Html::parse_document(html);
    let primary = Selectors::compile(&PRIMARY)?;
    let fallback = Selectors::compile(&FALLBACK)?;
    let link_sel = css("a[href*='/inlagg/']")?;

    let (containers, sel) = select_containers(&doc, &primary, &fallback);
    Ok(extract_each("placera", containers, |c| {
        extract_post(c, sel, &link_sel, ctx)
    }))
}

fn extract_post(
    container: ElementRef<'_>,
    sel: &Selectors,
    link_sel: &Selector,
    ctx: &ParseContext,
) -> Result<Option<Candidate>> {
    let Some(body) = first_text(container, &sel.body) else {
        return Ok(None);
    };
    if body.chars().count() < MIN_POST_CHARS {
        return Ok(None);
    }

    let author = first_text(container, &sel.author).unwrap_or_else(|| "Unknown".to_string());
    let stamp = first_timestamp(container, &sel.timestamp, ctx.fetched_at)
        .unwrap_or_else(|| SiteTime::approximate(ctx.fetched_at));
    let title = sel.title.as_ref().and_then(|t| first_text(container, t));

    let label = sel.ticker_tag.as_ref().and_then(|t| {
        container
            .select(t)
            .next()
            .map(|a| (element_text(a), a.value().attr("href").map(str::to_string)))
    });

    let link = first_attr(container, link_sel, "href");
    let external_id = link
        .as_deref()
        .and_then(|href| POST_LINK_RE.captures(href))
        .map(|c| c[1].to_string());

    let mut post = Post::new(ctx.forum_id, author, stamp.at, body)
        .with_meta("source", "placera_forum");
    if let Some((name, href)) = &label {
        post = post.with_meta("company", name.as_str());
        if let Some(href) = href.as_deref().and_then(|h| ctx.absolute(h)) {
            post = post.with_meta("company_url", href);
        }
    }
    post.title = title;
    post.url = link.as_deref().and_then(|h| ctx.absolute(h));
    post.external_id = external_id;
    post.thread_url = post.url.clone();
    post.approximate_time = stamp.approximate;

    // Only labels that read as a symbol survive tag decoding.
    let tag = label.map(|(name, _)| name).filter(|n| !n.is_empty());
    Ok(Some(Candidate::post(post).with_tag(tag)))
}

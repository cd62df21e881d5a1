//! Hegnar Online (finansavisen.no) forum.
//!
//! The index lists threads as table rows; each thread page holds
//! `div#post_<id>` containers. Threads are fetched one by one, so the index
//! only yields [`ThreadRef`]s and posts come from thread pages.

use super::{
    css, element_text, extract_each, first_attr, first_text, select_containers, text_without,
    ParseContext, SelectorSet, Selectors, MIN_POST_CHARS,
};
use crate::models::{Candidate, Post};
use crate::scraper::cleaner::{parse_site_time, try_parse_site_time};
use crate::scraper::fetch::{RenderHints, LOADING_MARKERS};
use crate::ticker::decode_tag;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::HashSet;

pub const RENDER_HINTS: RenderHints = RenderHints {
    markers: LOADING_MARKERS,
    containers: &["div[id^='post_']", "a[href*='/thread/']"],
    min_text_len: 200,
};

const PRIMARY: SelectorSet = SelectorSet {
    container: "div[id^='post_']",
    author: "a[href*='/forum/user/']",
    timestamp: "span",
    body: "div.post.content",
    title: None,
    ticker_tag: Some("a[href*='/forum/ticker/']"),
};

const FALLBACK: SelectorSet = SelectorSet {
    container: "article.forum-post, div.forum-post",
    author: ".author, .username",
    timestamp: "time, .date, .timestamp",
    body: ".post-content, .content, .message",
    title: None,
    ticker_tag: Some("a[href*='/ticker/']"),
};

static THREAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/thread/(\d+)/view").expect("thread regex"));
static POST_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^post_(\d+)$").expect("post id regex"));
static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{2}\.\d{2}\.\d{4}(?:\s*kl\.?\s*\d{1,2}:\d{2})?").expect("date regex")
});
// "AKER - Q2", "AKER: ...", "Diskusjon om Aker (AKER)".
static TITLE_TICKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]{2,6})\s*[-:–]|\(([A-Z]{2,6})\)").expect("title ticker regex")
});

/// A thread discovered on the forum index.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadRef {
    pub id: String,
    pub url: String,
    pub title: String,
    pub ticker_hint: Option<String>,
    pub author: Option<String>,
    pub replies: Option<u32>,
}

/// Thread-level ticker: tagged link first, then the title, then the URL.
pub fn thread_hint(tag: Option<&str>, title: &str, url: &str) -> Option<String> {
    if let Some(t) = tag.and_then(decode_tag) {
        return Some(t);
    }
    if let Some(caps) = TITLE_TICKER_RE.captures(title.trim()) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            return Some(m.as_str().to_string());
        }
    }
    url.split_once("/forum/ticker/")
        .and_then(|(_, rest)| decode_tag(rest.split(['?', '#']).next().unwrap_or_default()))
}

pub fn parse_index(html: &str, ctx: &ParseContext) -> Result<Vec<ThreadRef>> {
    let doc = Html::parse_document(html);
    let link_sel = css("a[href*='/thread/']")?;
    let ticker_sel = css("a[href*='/forum/ticker/']")?;
    let user_sel = css("a[href*='/forum/user/']")?;
    let span_sel = css("span")?;

    let mut seen = HashSet::new();
    let mut threads = Vec::new();

    for link in doc.select(&link_sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(id) = THREAD_RE.captures(href).map(|c| c[1].to_string()) else {
            continue;
        };
        let title = element_text(link);
        if title.is_empty() || !seen.insert(id.clone()) {
            continue;
        }
        let Some(url) = ctx.absolute(href) else {
            continue;
        };

        let row = enclosing_row(link);
        let tag = row.and_then(|r| first_attr(r, &ticker_sel, "href"));
        let author = row.and_then(|r| first_text(r, &user_sel));
        let replies = row.and_then(|r| {
            r.select(&span_sel)
                .map(element_text)
                .find_map(|t| t.trim().parse::<u32>().ok())
        });

        threads.push(ThreadRef {
            ticker_hint: thread_hint(tag.as_deref(), &title, &url),
            id,
            url,
            title,
            author,
            replies,
        });
    }
    Ok(threads)
}

fn enclosing_row(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "tr")
}

/// Ticker named by the thread page itself: a tag outside the posts, or the
/// page heading.
fn page_hint(doc: &Html) -> Result<Option<String>> {
    let tag_sel = css("a[href*='/forum/ticker/']")?;
    let heading_sel = css("h1")?;

    let outside_posts = doc.select(&tag_sel).find(|a| {
        !a.ancestors()
            .filter_map(ElementRef::wrap)
            .any(|p| p.value().id().is_some_and(|id| id.starts_with("post_")))
    });
    let tag = outside_posts.and_then(|a| a.value().attr("href"));
    let heading = doc.select(&heading_sel).next().map(element_text).unwrap_or_default();
    Ok(thread_hint(tag, &heading, ""))
}

pub fn parse_posts(html: &str, ctx: &ParseContext) -> Result<Vec<Candidate>> {
    let doc = Html::parse_document(html);
    let primary = Selectors::compile(&PRIMARY)?;
    let fallback = Selectors::compile(&FALLBACK)?;

    let hint = match ctx.thread_hint.clone() {
        Some(h) => Some(h),
        None => page_hint(&doc)?,
    };
    let thread_url = ctx.page_url.split('?').next().unwrap_or_default().to_string();

    let (containers, sel) = select_containers(&doc, &primary, &fallback);
    Ok(extract_each("hegnar", containers, |c| {
        let found = extract_post(c, sel, ctx, &thread_url)?;
        Ok(found.map(|(post, tag)| {
            Candidate::post(post)
                .with_tag(tag)
                .with_thread_hint(hint.clone())
        }))
    }))
}

fn extract_post(
    container: ElementRef<'_>,
    sel: &Selectors,
    ctx: &ParseContext,
    thread_url: &str,
) -> Result<Option<(Post, Option<String>)>> {
    let external_id = container
        .value()
        .id()
        .and_then(|id| POST_ID_RE.captures(id))
        .map(|c| c[1].to_string());

    let Some(body_el) = container.select(&sel.body).next() else {
        return Ok(None);
    };
    let body = text_without(body_el, &["blockquote"]);
    if body.chars().count() < MIN_POST_CHARS {
        return Ok(None);
    }
    let had_quote = body_el
        .descendants()
        .filter_map(ElementRef::wrap)
        .any(|e| e.value().name() == "blockquote");

    let author = first_text(container, &sel.author).unwrap_or_else(|| "Unknown".to_string());

    let stamp = container
        .select(&sel.timestamp)
        .find_map(|s| {
            if let Some(dt) = s.value().attr("datetime") {
                return Some(dt.to_string());
            }
            let text = element_text(s);
            match DATE_RE.find(&text) {
                Some(m) => Some(m.as_str().to_string()),
                None => try_parse_site_time(&text, ctx.fetched_at).map(|_| text),
            }
        });
    let time = parse_site_time(stamp.as_deref().unwrap_or_default(), ctx.fetched_at);

    let tag = sel
        .ticker_tag
        .as_ref()
        .and_then(|t| first_attr(container, t, "href"));

    let mut post = Post::new(ctx.forum_id, author, time.at, body.clone())
        .with_meta("source", "individual_post")
        .with_meta("content_length", body.chars().count())
        .with_meta("had_quote", had_quote)
        .with_meta(
            "post_level",
            container.value().attr("data-post-level").unwrap_or("0"),
        );
    post.url = match &external_id {
        Some(id) => ctx.absolute(&format!("/forum/post/{}", id)),
        None => None,
    };
    post.external_id = external_id;
    post.thread_url = Some(thread_url.to_string());
    post.approximate_time = time.approximate;

    Ok(Some((post, tag.filter(|t| !t.is_empty()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use chrono::{TimeZone, Utc};

    const INDEX: &str = r#"<html><body><table><tbody>
      <tr>
        <td><a href="/forum/thread/901/view">Aker - kvartalstall Q2</a></td>
        <td><a href="/forum/ticker/AKER">AKER</a></td>
        <td><a href="/forum/user/42/view">ola</a></td>
        <td><span>17</span></td>
      </tr>
      <tr>
        <td><a href="/forum/thread/902/view">Oljeprisen (EQNR)</a></td>
        <td></td>
        <td><a href="/forum/user/7/view">kari</a></td>
        <td><span>3</span></td>
      </tr>
      <tr>
        <td><a href="/forum/thread/903/view">Generelt om markedet</a></td>
        <td><a href="/forum/thread/903/view">Generelt om markedet</a></td>
      </tr>
    </tbody></table></body></html>"#;

    const THREAD: &str = r#"<html><body>
      <h1>AKER - kvartalstall Q2</h1>
      <div id="post_5001" data-post-level="0">
        <a href="/forum/user/42/view">ola</a>
        <span>19.07.2024 kl 16:18</span>
        <div class="post content text-left">
          <blockquote>Sitat: gammelt innlegg om NHY</blockquote>
          <p>Sterke tall fra Aker i dag, holder posisjonen.</p>
        </div>
      </div>
      <div id="post_5002">
        <a href="/forum/user/7/view">kari</a>
        <a href="/forum/ticker/MOWI">MOWI</a>
        <span>20.07.2024 kl 09:05</span>
        <div class="post content text-left"><p>Bytter over til laks, MOWI ser billig ut.</p></div>
      </div>
      <div id="post_5003">
        <a href="/forum/user/9/view">per</a>
        <span>20.07.2024 kl 10:00</span>
        <div class="post content text-left"><p>+1</p></div>
      </div>
      <div id="post_5004">
        <span>20.07.2024 kl 11:00</span>
      </div>
    </body></html>"#;

    fn ctx(url: &str) -> ParseContext {
        let fetched = Utc.with_ymd_and_hms(2024, 7, 21, 8, 0, 0).unwrap();
        ParseContext::new(1, url, fetched)
    }

    #[test]
    fn index_yields_threads_with_hints() {
        let threads = parse_index(INDEX, &ctx("https://www.finansavisen.no/forum/")).unwrap();
        assert_eq!(threads.len(), 3);

        assert_eq!(threads[0].id, "901");
        assert_eq!(threads[0].url, "https://www.finansavisen.no/forum/thread/901/view");
        assert_eq!(threads[0].ticker_hint.as_deref(), Some("AKER"));
        assert_eq!(threads[0].author.as_deref(), Some("ola"));
        assert_eq!(threads[0].replies, Some(17));

        // No tag: the title carries it.
        assert_eq!(threads[1].ticker_hint.as_deref(), Some("EQNR"));
        assert_eq!(threads[2].ticker_hint, None);
    }

    #[test]
    fn thread_posts_trim_quotes_and_noise() {
        let c = ctx("https://www.finansavisen.no/forum/thread/901/view?page=2")
            .with_hint(Some("AKER".into()));
        let out = parse_posts(THREAD, &c).unwrap();
        assert_eq!(out.len(), 2);

        let Record::Post(first) = &out[0].record else {
            panic!("expected post");
        };
        assert_eq!(first.external_id.as_deref(), Some("5001"));
        assert_eq!(first.author, "ola");
        assert_eq!(first.raw_text, "Sterke tall fra Aker i dag, holder posisjonen.");
        assert_eq!(first.clean_text, first.raw_text);
        assert_eq!(first.timestamp, Utc.with_ymd_and_hms(2024, 7, 19, 16, 18, 0).unwrap());
        assert_eq!(
            first.thread_url.as_deref(),
            Some("https://www.finansavisen.no/forum/thread/901/view")
        );
        assert_eq!(
            first.url.as_deref(),
            Some("https://www.finansavisen.no/forum/post/5001")
        );
        assert_eq!(out[0].ticker_tag, None);
        assert_eq!(out[0].thread_hint.as_deref(), Some("AKER"));

        assert_eq!(out[1].ticker_tag.as_deref(), Some("/forum/ticker/MOWI"));
    }

    #[test]
    fn hint_is_derived_from_page_when_missing() {
        let out = parse_posts(THREAD, &ctx("https://www.finansavisen.no/forum/thread/901/view")).unwrap();
        assert_eq!(out[0].thread_hint.as_deref(), Some("AKER"));
    }

    #[test]
    fn fallback_layout_is_used() {
        let html = r#"<div class="forum-post">
            <span class="author">ola</span><time datetime="2024-07-19T16:18:00Z">i går</time>
            <div class="post-content">Et innlegg i ny layout fra forumet.</div></div>"#;
        let out = parse_posts(html, &ctx("https://www.finansavisen.no/forum/thread/1/view")).unwrap();
        assert_eq!(out.len(), 1);
        let Record::Post(p) = &out[0].record else {
            panic!("expected post");
        };
        assert_eq!(p.author, "ola");
        assert!(p.external_id.is_none());
        assert!(p.post_key().starts_with("h:"));
    }

    #[test]
    fn hint_sources() {
        assert_eq!(thread_hint(Some("/forum/ticker/NHY"), "x", "").as_deref(), Some("NHY"));
        assert_eq!(thread_hint(None, "KOG: ordrebok", "").as_deref(), Some("KOG"));
        assert_eq!(
            thread_hint(None, "x", "https://www.finansavisen.no/forum/ticker/NAS?page=2").as_deref(),
            Some("NAS")
        );
        assert_eq!(thread_hint(None, "Generelt", ""), None);
    }
}

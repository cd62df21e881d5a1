//! Nordnet Shareville.
//!
//! Markup is generated by styled-components, so the primary class names
//! drift between deploys. The fallback set reads plain list items and
//! articles.

use super::{
    element_text, extract_each, first_text, first_timestamp, select_containers, ParseContext,
    SelectorSet, Selectors, MIN_POST_CHARS,
};
use crate::models::{Candidate, Post};
use crate::scraper::cleaner::SiteTime;
use crate::scraper::fetch::{RenderHints, LOADING_MARKERS};
use anyhow::Result;
use scraper::{ElementRef, Html, Selector};

pub const RENDER_HINTS: RenderHints = RenderHints {
    markers: LOADING_MARKERS,
    containers: &[
        "li.ListItem__StyledListItem-sc-pn91gs-0",
        "div[data-testid='shareville-section']",
    ],
    min_text_len: 300,
};

const PRIMARY: SelectorSet = SelectorSet {
    container: "li.ListItem__StyledListItem-sc-pn91gs-0",
    author: "div.Flexbox__StyledFlexbox-sc-1ob4g1e-0.haAnAc > span > a.Link__StyledLink-sc-apj04t-0, \
             a[data-testid='author-name']",
    timestamp: "div.Flexbox__StyledFlexbox-sc-1ob4g1e-0.hllVYC > span.Typography__Span-sc-10mju41-0, \
                span[data-testid='timestamp']",
    body: "div.Content-styled__MarkContentFlexbox-sc-d426b66b-3 > div.CssGrid__StyledDiv-sc-bu5cxy-0, \
           span.ContentMessage-styled__ShortenedText-sc-5bd6ed6d-1",
    title: Some("h3, h4"),
    ticker_tag: Some("a[data-testid='ticker']"),
};

const FALLBACK: SelectorSet = SelectorSet {
    container: "article, div.post-card, li",
    author: "a[data-testid='author-name'], .author-name, .username",
    timestamp: "time, span[data-testid='timestamp'], .timestamp, .date",
    body: ".post-body, .post-content, .content",
    title: Some("h3, h4, .post-title"),
    ticker_tag: Some("a[data-testid='ticker'], .ticker, .stock-symbol"),
};

const LIKES: &str = "span.lmVbIM, .likes-count, button[aria-label='Lik'] span";

pub fn parse(html: &str, ctx: &ParseContext) -> Result<Vec<Candidate>> {
    let doc = Html::parse_document(html);
    let primary = Selectors::compile(&PRIMARY)?;
    let fallback = Selectors::compile(&FALLBACK)?;
    let likes_sel = super::css(LIKES)?;

    let (containers, sel) = select_containers(&doc, &primary, &fallback);
    Ok(extract_each("nordnet", containers, |c| {
        extract_post(c, sel, &likes_sel, ctx)
    }))
}

fn extract_post(
    container: ElementRef<'_>,
    sel: &Selectors,
    likes_sel: &Selector,
    ctx: &ParseContext,
) -> Result<Option<Candidate>> {
    let content = first_text(container, &sel.body).unwrap_or_default();
    let title = sel
        .title
        .as_ref()
        .and_then(|t| first_text(container, t))
        .unwrap_or_default();

    let raw_text = format!("{}\n\n{}", title, content).trim().to_string();
    if raw_text.chars().count() < MIN_POST_CHARS {
        return Ok(None);
    }

    let author = first_text(container, &sel.author).unwrap_or_else(|| "Unknown".to_string());
    let stamp = first_timestamp(container, &sel.timestamp, ctx.fetched_at)
        .unwrap_or_else(|| SiteTime::approximate(ctx.fetched_at));
    let likes = container
        .select(likes_sel)
        .map(element_text)
        .find_map(|t| t.parse::<u64>().ok());
    let tag = sel
        .ticker_tag
        .as_ref()
        .and_then(|t| first_text(container, t));

    let mut post = Post::new(ctx.forum_id, author, stamp.at, raw_text)
        .with_meta("source", "nordnet_shareville")
        .with_meta("title", title.as_str())
        .with_meta("likes_count", likes);
    post.title = Some(title).filter(|t| !t.is_empty());
    post.thread_url = Some(ctx.page_url.clone());
    post.approximate_time = stamp.approximate;

    Ok(Some(Candidate::post(post).with_tag(tag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use crate::storage::Repository;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Value;

    const SHAREVILLE: &str = r#"<div data-testid="shareville-section"><ul>
      <li class="ListItem__StyledListItem-sc-pn91gs-0 kVYBzE">
        <div class="Flexbox__StyledFlexbox-sc-1ob4g1e-0 haAnAc">
          <span><a class="Link__StyledLink-sc-apj04t-0 x" href="/profil/trader1">Trader1</a></span>
        </div>
        <div class="Flexbox__StyledFlexbox-sc-1ob4g1e-0 hllVYC">
          <span class="Typography__Span-sc-10mju41-0 gAAhrK">2 timer siden</span>
        </div>
        <a data-testid="ticker" href="/aksjer/kurser/ensurge-micropower-ensu-xosl">ENSU</a>
        <h3>Solid kvartal</h3>
        <div class="Content-styled__MarkContentFlexbox-sc-d426b66b-3">
          <div class="CssGrid__StyledDiv-sc-bu5cxy-0">Omsetningen dobler seg, holder videre.</div>
        </div>
        <button aria-label="Lik"><span class="lmVbIM">7</span></button>
      </li>
      <li class="ListItem__StyledListItem-sc-pn91gs-0 kVYBzE">
        <div class="Flexbox__StyledFlexbox-sc-1ob4g1e-0 haAnAc">
          <span><a class="Link__StyledLink-sc-apj04t-0" href="/profil/b">Bjorn</a></span>
        </div>
        <div class="Flexbox__StyledFlexbox-sc-1ob4g1e-0 hllVYC">
          <span class="Typography__Span-sc-10mju41-0">15. aug.</span>
        </div>
        <div class="Content-styled__MarkContentFlexbox-sc-d426b66b-3">
          <div class="CssGrid__StyledDiv-sc-bu5cxy-0">Noen som har fulgt med på renten i dag?</div>
        </div>
      </li>
    </ul></div>"#;

    fn ctx() -> ParseContext {
        let fetched = Utc.with_ymd_and_hms(2025, 9, 1, 10, 0, 0).unwrap();
        ParseContext::new(3, "https://www.nordnet.no/aksjeforum", fetched)
    }

    #[test]
    fn styled_list_items_are_extracted() {
        let c = ctx();
        let out = parse(SHAREVILLE, &c).unwrap();
        assert_eq!(out.len(), 2);

        let Record::Post(first) = &out[0].record else {
            panic!("expected post");
        };
        assert_eq!(first.author, "Trader1");
        assert_eq!(first.raw_text, "Solid kvartal\n\nOmsetningen dobler seg, holder videre.");
        assert_eq!(first.timestamp, c.fetched_at - Duration::hours(2));
        assert_eq!(first.metadata["likes_count"], Value::from(7u64));
        assert_eq!(first.title.as_deref(), Some("Solid kvartal"));
        assert!(first.post_key().starts_with("h:"));
        assert_eq!(out[0].ticker_tag.as_deref(), Some("ENSU"));

        let Record::Post(second) = &out[1].record else {
            panic!("expected post");
        };
        assert_eq!(second.raw_text, "Noen som har fulgt med på renten i dag?");
        assert_eq!(second.timestamp, Utc.with_ymd_and_hms(2025, 8, 15, 0, 0, 0).unwrap());
        assert_eq!(second.metadata["likes_count"], Value::Null);
        assert!(second.title.is_none());
    }

    #[test]
    fn fallback_reads_plain_articles() {
        let html = r#"<main><article>
            <a data-testid="author-name">kari</a>
            <span data-testid="timestamp">for 1 døgn siden</span>
            <div class="post-body">Kjøpte litt mer i dag etter fallet.</div>
        </article></main>"#;
        let c = ctx();
        let out = parse(html, &c).unwrap();
        assert_eq!(out.len(), 1);
        let Record::Post(p) = &out[0].record else {
            panic!("expected post");
        };
        assert_eq!(p.author, "kari");
        assert_eq!(p.timestamp, c.fetched_at - Duration::days(1));
        assert_eq!(out[0].ticker_tag, None);
    }

    #[test]
    fn relative_times_store_once_across_fetches() {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();

        let first = ctx();
        let later = ParseContext::new(3, first.page_url.clone(), first.fetched_at + Duration::minutes(10));
        let records = |c: &ParseContext| -> Vec<Record> {
            parse(SHAREVILLE, c).unwrap().into_iter().map(|c| c.record).collect()
        };

        assert_eq!(repo.upsert_records(&records(&first)).unwrap(), 2);
        assert_eq!(repo.upsert_records(&records(&later)).unwrap(), 0);
        // A day later the phrase has changed but the post is the same.
        let next_day = ParseContext::new(3, first.page_url.clone(), first.fetched_at + Duration::hours(26));
        let html = SHAREVILLE.replace("2 timer siden", "for 1 døgn siden");
        let again: Vec<Record> = parse(&html, &next_day).unwrap().into_iter().map(|c| c.record).collect();
        assert_eq!(repo.upsert_records(&again).unwrap(), 0);
        assert_eq!(repo.post_count().unwrap(), 2);
    }
}

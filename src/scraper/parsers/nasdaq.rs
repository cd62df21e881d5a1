//! Nasdaq Nordic company announcements, one RSS feed per instrument.

use super::{extract_each, ParseContext};
use crate::models::{Announcement, Candidate};
use crate::scraper::cleaner::{normalize_whitespace, parse_feed_timestamp};
use anyhow::{anyhow, bail, Context, Result};
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use scraper::Html;
use serde::Deserialize;
use url::Url;

pub const SOURCE: &str = "nasdaq";
pub const CATEGORY: &str = "filing";
pub const IMPORTANCE: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/// `{rss}/NewsRelease?Instrument={ric}`
pub fn feed_url(rss_url: &str, ric: &str) -> Result<String> {
    let mut url = Url::parse(&format!("{}/NewsRelease", rss_url.trim_end_matches('/')))
        .with_context(|| format!("invalid Nasdaq RSS url {}", rss_url))?;
    url.query_pairs_mut().append_pair("Instrument", ric);
    Ok(url.into())
}

/// `VOLV-B.ST` → `VOLV-B`.
pub fn ticker_from_ric(ric: &str) -> String {
    ric.split('.').next().unwrap_or_default().trim().to_uppercase()
}

fn strip_markup(fragment: &str) -> String {
    let doc = Html::parse_fragment(fragment);
    normalize_whitespace(&doc.root_element().text().collect::<Vec<_>>().join(" "))
}

/// Raw `<item>` elements of the channel, each decoded on its own later.
fn item_fragments(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut channel = false;
    let mut items = Vec::new();
    loop {
        match reader.read_event().context("reading nasdaq rss xml")? {
            Event::Start(e) if e.local_name().as_ref() == b"channel" => channel = true,
            Event::Start(e) if e.local_name().as_ref() == b"item" => {
                let span = reader
                    .read_to_end(e.to_end().name())
                    .context("unterminated rss item")?;
                let inner = xml
                    .get(span.start as usize..span.end as usize)
                    .unwrap_or_default();
                items.push(format!("<item>{}</item>", inner));
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !channel {
        bail!("no <channel> in nasdaq rss");
    }
    Ok(items)
}

/// Feed items for the instrument named by `ctx.thread_hint` (a RIC).
pub fn parse(xml: &str, ctx: &ParseContext) -> Result<Vec<Candidate>> {
    let items = item_fragments(xml)?;
    let ticker = ctx
        .thread_hint
        .as_deref()
        .map(ticker_from_ric)
        .unwrap_or_default();

    Ok(extract_each("nasdaq", items, |fragment| {
        let it: Item = from_str(&fragment).context("malformed rss item")?;
        let headline = normalize_whitespace(it.title.as_deref().unwrap_or_default());
        if headline.is_empty() {
            return Ok(None);
        }
        let pub_date = it.pub_date.as_deref().unwrap_or_default();
        let published_at = parse_feed_timestamp(pub_date)
            .ok_or_else(|| anyhow!("unparseable pubDate {:?} for {:?}", pub_date, headline))?;
        let mut a = Announcement::new(ticker.clone(), SOURCE, headline, published_at);
        a.summary = it
            .description
            .as_deref()
            .map(strip_markup)
            .filter(|s| !s.is_empty());
        a.link = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
        a.category = CATEGORY.to_string();
        a.importance = IMPORTANCE;
        Ok(Some(Candidate::announcement(a)))
    }))
}

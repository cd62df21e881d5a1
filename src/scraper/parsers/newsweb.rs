//! Oslo Børs NewsWeb announcements (JSON API).

use super::{extract_each, ParseContext};
use crate::models::{Announcement, Candidate};
use crate::scraper::cleaner::{normalize_whitespace, parse_feed_timestamp};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

pub const SOURCE: &str = "oslobors";
pub const CATEGORY: &str = "filing";
pub const IMPORTANCE: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct NewsResponse {
    // Items are decoded one by one so a malformed entry only loses itself.
    #[serde(default)]
    news: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct NewsItem {
    #[serde(default)]
    headline: String,
    lead: Option<String>,
    body: Option<String>,
    url: Option<String>,
    #[serde(rename = "publishDate", default)]
    publish_date: String,
}

/// `{api}/news?issuerId=..&from=YYYY-MM-DD&lang=en`
pub fn feed_url(api_url: &str, issuer: &str, since: NaiveDate) -> Result<String> {
    let mut url = Url::parse(&format!("{}/news", api_url.trim_end_matches('/')))
        .with_context(|| format!("invalid NewsWeb url {}", api_url))?;
    url.query_pairs_mut()
        .append_pair("issuerId", issuer)
        .append_pair("from", &since.format("%Y-%m-%d").to_string())
        .append_pair("lang", "en");
    Ok(url.into())
}

/// Announcements for the issuer named by `ctx.thread_hint`.
pub fn parse(json: &str, ctx: &ParseContext) -> Result<Vec<Candidate>> {
    let response: NewsResponse =
        serde_json::from_str(json).context("parsing NewsWeb response")?;
    let issuer = ctx.thread_hint.clone().unwrap_or_default();

    Ok(extract_each("newsweb", response.news, |raw| {
        let item: NewsItem = serde_json::from_value(raw).context("malformed news item")?;
        let headline = normalize_whitespace(&item.headline);
        if headline.is_empty() {
            return Ok(None);
        }
        let published_at = parse_feed_timestamp(&item.publish_date)
            .ok_or_else(|| anyhow!("unparseable publishDate {:?} for {:?}", item.publish_date, headline))?;
        let mut a = Announcement::new(issuer.clone(), SOURCE, headline, published_at);
        a.summary = item.lead.filter(|s| !s.trim().is_empty());
        a.body = item.body.filter(|s| !s.trim().is_empty());
        a.link = item.url.filter(|s| !s.trim().is_empty());
        a.category = CATEGORY.to_string();
        a.importance = IMPORTANCE;
        Ok(Some(
            Candidate::announcement(a).with_thread_hint(ctx.thread_hint.clone()),
        ))
    }))
}

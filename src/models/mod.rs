use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

// ── Forum (reference data) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forum {
    pub id: i32,
    pub name: String,
    pub base_url: String,
}

// ── Post ──────────────────────────────────────────────────────────────────────

/// Characters of the title (or body, when untitled) folded into a derived key.
const KEY_FRAGMENT_CHARS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub forum_id: i32,
    pub external_id: Option<String>,
    pub ticker: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub title: Option<String>,
    pub raw_text: String,
    pub clean_text: String,
    pub url: Option<String>,
    pub thread_url: Option<String>,
    pub metadata: Map<String, Value>,
    /// The timestamp was estimated from the fetch time and may move between
    /// fetches, so it stays out of the derived key.
    #[serde(default)]
    pub approximate_time: bool,
}

impl Post {
    /// A fresh post; `clean_text` starts as a copy of `raw_text`.
    pub fn new(
        forum_id: i32,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
        raw_text: impl Into<String>,
    ) -> Self {
        let raw_text = raw_text.into();
        Self {
            forum_id,
            external_id: None,
            ticker: None,
            timestamp,
            author: author.into(),
            title: None,
            clean_text: raw_text.clone(),
            raw_text,
            url: None,
            thread_url: None,
            metadata: Map::new(),
            approximate_time: false,
        }
    }

    /// Natural key within the forum: the external id when the site exposes
    /// one, otherwise a content hash over author, timestamp and title fragment.
    /// Approximate times are left out and the whole text fragment is hashed.
    pub fn post_key(&self) -> String {
        match self.external_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ if self.approximate_time => {
                derived_post_key(self.forum_id, &self.author, None, &self.raw_text)
            }
            _ => derived_post_key(
                self.forum_id,
                &self.author,
                Some(self.timestamp),
                self.title.as_deref().unwrap_or(&self.raw_text),
            ),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

pub fn derived_post_key(
    forum_id: i32,
    author: &str,
    timestamp: Option<DateTime<Utc>>,
    title: &str,
) -> String {
    let fragment: String = title.trim().chars().take(KEY_FRAGMENT_CHARS).collect();
    let mut hasher = Sha256::new();
    hasher.update(forum_id.to_be_bytes());
    hasher.update(b"|");
    hasher.update(author.trim().as_bytes());
    hasher.update(b"|");
    match timestamp {
        Some(ts) => hasher.update(ts.to_rfc3339().as_bytes()),
        None => hasher.update(b"~"),
    }
    hasher.update(b"|");
    hasher.update(fragment.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("h:{}", hex)
}

// ── Announcement ──────────────────────────────────────────────────────────────

pub const DEFAULT_CATEGORY: &str = "news";
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Announcement {
    pub ticker: String,
    pub source: String,
    pub headline: String,
    pub published_at: DateTime<Utc>,
    pub summary: Option<String>,
    pub body: Option<String>,
    pub link: Option<String>,
    pub category: String,
    pub importance: f64,
}

impl Announcement {
    pub fn new(
        ticker: impl Into<String>,
        source: impl Into<String>,
        headline: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            source: source.into(),
            headline: headline.into(),
            published_at,
            summary: None,
            body: None,
            link: None,
            category: DEFAULT_CATEGORY.to_string(),
            importance: DEFAULT_IMPORTANCE,
        }
    }
}

// ── Candidate records ─────────────────────────────────────────────────────────

/// Identity of a record for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NaturalKey {
    Post {
        forum_id: i32,
        post_key: String,
    },
    Announcement {
        ticker: String,
        source: String,
        headline: String,
        published_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Post(Post),
    Announcement(Announcement),
}

impl Record {
    pub fn natural_key(&self) -> NaturalKey {
        match self {
            Record::Post(p) => NaturalKey::Post {
                forum_id: p.forum_id,
                post_key: p.post_key(),
            },
            Record::Announcement(a) => NaturalKey::Announcement {
                ticker: a.ticker.clone(),
                source: a.source.clone(),
                headline: a.headline.clone(),
                published_at: a.published_at,
            },
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Post(p) => p.timestamp,
            Record::Announcement(a) => a.published_at,
        }
    }

    pub fn ticker(&self) -> Option<&str> {
        match self {
            Record::Post(p) => p.ticker.as_deref(),
            Record::Announcement(a) => Some(a.ticker.as_str()).filter(|t| !t.is_empty()),
        }
    }

    pub fn set_ticker(&mut self, ticker: Option<String>) {
        match self {
            Record::Post(p) => p.ticker = ticker,
            Record::Announcement(a) => {
                if let Some(t) = ticker {
                    a.ticker = t;
                }
            }
        }
    }

    /// Text scanned for ticker mentions.
    pub fn body(&self) -> &str {
        match self {
            Record::Post(p) => &p.raw_text,
            Record::Announcement(a) => &a.headline,
        }
    }
}

/// A parsed record plus the ticker evidence found around it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub record: Record,
    /// Tag or link attached to the record itself.
    pub ticker_tag: Option<String>,
    /// Ticker of the enclosing thread, derived from the page.
    pub thread_hint: Option<String>,
}

impl Candidate {
    pub fn post(post: Post) -> Self {
        Self {
            record: Record::Post(post),
            ticker_tag: None,
            thread_hint: None,
        }
    }

    pub fn announcement(announcement: Announcement) -> Self {
        Self {
            record: Record::Announcement(announcement),
            ticker_tag: None,
            thread_hint: None,
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.ticker_tag = tag;
        self
    }

    pub fn with_thread_hint(mut self, hint: Option<String>) -> Self {
        self.thread_hint = hint;
        self
    }
}

// ── Fetch state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFetchState {
    pub source: String,
    pub last_fetch_ts: Option<DateTime<Utc>>,
    pub last_backfill_ts: Option<DateTime<Utc>>,
    pub total_fetch_count: i64,
}

impl SourceFetchState {
    pub fn empty(source: &str) -> Self {
        Self {
            source: source.to_string(),
            last_fetch_ts: None,
            last_backfill_ts: None,
            total_fetch_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub days_back: i64,
    pub is_incremental: bool,
    pub reference_ts: Option<DateTime<Utc>>,
}

impl FetchWindow {
    /// Oldest timestamp still inside the window.
    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.days_back)
    }
}

/// Outcome of one per-source cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub records_found: usize,
    pub records_stored: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn external_id_wins_over_hash() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 19, 16, 18, 0).unwrap();
        let mut post = Post::new(1, "ola", ts, "Body text here");
        post.external_id = Some("12345".into());
        assert_eq!(post.post_key(), "12345");
    }

    #[test]
    fn derived_key_is_deterministic() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 19, 16, 18, 0).unwrap();
        let a = Post::new(3, "kari", ts, "Same body");
        let b = Post::new(3, "kari", ts, "Same body");
        assert_eq!(a.post_key(), b.post_key());
        assert!(a.post_key().starts_with("h:"));

        let other_forum = Post::new(4, "kari", ts, "Same body");
        assert_ne!(a.post_key(), other_forum.post_key());
    }

    #[test]
    fn approximate_time_stays_out_of_the_key() {
        let ts = Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap();
        let mut a = Post::new(3, "kari", ts, "Solid kvartal\n\nOmsetningen dobler seg");
        a.title = Some("Solid kvartal".into());
        a.approximate_time = true;
        let mut b = a.clone();
        b.timestamp = ts + Duration::hours(1);
        assert_eq!(a.post_key(), b.post_key());

        // Same title, different body: distinct posts.
        let mut c = a.clone();
        c.raw_text = "Solid kvartal\n\nMen marginene faller".into();
        assert_ne!(a.post_key(), c.post_key());

        let mut exact = a.clone();
        exact.approximate_time = false;
        assert_ne!(a.post_key(), exact.post_key());
    }

    #[test]
    fn blank_external_id_falls_back_to_hash() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut post = Post::new(1, "a", ts, "x");
        post.external_id = Some("  ".into());
        assert!(post.post_key().starts_with("h:"));
    }

    #[test]
    fn clean_text_starts_as_raw_copy() {
        let post = Post::new(1, "a", Utc::now(), "raw words");
        assert_eq!(post.clean_text, post.raw_text);
    }
}

//! Ticker resolution.
//!
//! First match wins: a ticker the source assigned (announcement feeds are
//! per issuer), a tag on the record itself, then the thread hint, then a
//! scan of the body for uppercase 2-6 letter tokens that are not common
//! words.

use crate::models::{Candidate, Record};
use crate::scraper::cleaner::percent_decode;
use crate::scraper::parsers::ParseContext;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

static SYMBOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2,6}$").expect("symbol regex"));
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{2,6}\b").expect("token regex"));

/// Uppercase words that look like symbols but are prose in EN/NO/SV posts.
pub const STOPWORDS: &[&str] = &[
    // English
    "THE", "AND", "FOR", "ARE", "YOU", "ALL", "HER", "HIS", "ITS", "OUR", "NOT", "BUT", "CAN",
    "HAS", "WAS", "ONE", "NEW", "NOW", "GET", "OUT", "WHO", "HOW", "WHY", "BUY", "SELL", "HOLD",
    "IMO", "LOL", "OK", "CEO", "CFO", "IPO", "ETF", "USA", "EU", "UK", "AI", "PS", "TLDR",
    // Norwegian
    "OG", "DET", "ER", "SOM", "EN", "ET", "MED", "TIL", "AV", "IKKE", "JEG", "DU", "VI", "DE",
    "HAR", "KAN", "SKAL", "MEN", "KL", "ASA", "AS",
    // Swedish
    "VAR", "OCH", "ATT", "INTE", "DEN", "JAG", "AB", "MVH",
    // Currencies
    "NOK", "SEK", "DKK", "EUR", "USD",
];

/// Normalise a tag taken from a link or label to a symbol.
///
/// Accepts `/forum/ticker/AKER`, `AKER%20`, `$AKER`, `AKER`.
pub fn decode_tag(raw: &str) -> Option<String> {
    let decoded = percent_decode(raw);
    let last = decoded
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let symbol = last.trim().trim_start_matches('$');
    SYMBOL_RE.is_match(symbol).then(|| symbol.to_string())
}

pub struct TickerResolver {
    stopwords: HashSet<String>,
    universe: Option<HashSet<String>>,
}

impl Default for TickerResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TickerResolver {
    pub fn new() -> Self {
        Self {
            stopwords: STOPWORDS.iter().map(|s| s.to_string()).collect(),
            universe: None,
        }
    }

    /// Restrict body-scan candidates to known symbols. An empty universe
    /// leaves the scan unrestricted.
    pub fn with_universe<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = symbols.into_iter().map(Into::into).collect();
        self.universe = if set.is_empty() { None } else { Some(set) };
        self
    }

    /// Uppercase tokens in `text`, stopwords removed, first-seen order.
    pub fn scan(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        TOKEN_RE
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|t| !self.stopwords.contains(*t))
            .filter(|t| self.universe.as_ref().is_none_or(|u| u.contains(*t)))
            .filter(|t| seen.insert(t.to_string()))
            .map(str::to_string)
            .collect()
    }

    pub fn resolve(&self, candidate: &Candidate, ctx: &ParseContext) -> Option<String> {
        if let Some(assigned) = candidate.record.ticker() {
            return Some(assigned.to_string());
        }
        if let Some(tag) = candidate.ticker_tag.as_deref().and_then(decode_tag) {
            return Some(tag);
        }
        let hint = candidate
            .thread_hint
            .as_deref()
            .or(ctx.thread_hint.as_deref())
            .and_then(decode_tag);
        if hint.is_some() {
            return hint;
        }
        self.scan(candidate.record.body()).into_iter().next()
    }

    /// Attach tickers and drop unresolved records when the source needs one.
    pub fn apply(
        &self,
        candidates: Vec<Candidate>,
        ctx: &ParseContext,
        ticker_required: bool,
    ) -> Vec<Record> {
        let mut dropped = 0usize;
        let out: Vec<Record> = candidates
            .into_iter()
            .filter_map(|c| {
                let ticker = self.resolve(&c, ctx);
                if ticker.is_none() && ticker_required {
                    dropped += 1;
                    return None;
                }
                let mut record = c.record;
                record.set_ticker(ticker);
                Some(record)
            })
            .collect();
        if dropped > 0 {
            debug!("Dropped {} records without a ticker", dropped);
        }
        out
    }
}

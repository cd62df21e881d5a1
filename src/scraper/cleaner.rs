//! Field normalisation shared by the site parsers: timestamps and text.

use chrono::{
    DateTime, Datelike, Duration, DurationRound, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

// ── Timestamps ────────────────────────────────────────────────────────────────

/// Date-and-time formats, most specific first. Day-first before month-first.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M",
    "%d.%m.%Y %H:%M",
    "%d.%m.%Y kl %H:%M",
    "%d.%m.%Y kl. %H:%M",
    "%d.%m.%Y, %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"];

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

static RELATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:for|för|about|ca\.?)?\s*(\d+|ett|en|ei|et|one|an|a)\s*(\p{L}+)\.?\s+(?:siden|sedan|ago)$",
    )
    .expect("relative time regex")
});

static DAY_WORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(i\s*går|igår|yesterday|i\s*dag|idag|today)(?:[^\d]*(\d{1,2})[:.](\d{2}))?$")
        .expect("day word regex")
});

static DAY_MONTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(\d{1,2})\.?\s+(\p{L}+)\.?(?:\s+(\d{4}))?(?:,?\s*(?:kl\.?)?\s*(\d{1,2})[:.](\d{2}))?$",
    )
    .expect("day month regex")
});

/// A parsed site time. `approximate` marks times derived from the fetch
/// time ("2 timer siden", "i går"), which drift between fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteTime {
    pub at: DateTime<Utc>,
    pub approximate: bool,
}

impl SiteTime {
    fn exact(at: DateTime<Utc>) -> Self {
        Self { at, approximate: false }
    }

    pub fn approximate(at: DateTime<Utc>) -> Self {
        Self { at, approximate: true }
    }
}

/// Parse a site timestamp; anything unrecognised becomes an approximate
/// `fetched_at`.
///
/// Site times carry no zone and are stored as UTC.
pub fn parse_site_time(text: &str, fetched_at: DateTime<Utc>) -> SiteTime {
    match try_parse_site_time(text, fetched_at) {
        Some(t) => t,
        None => {
            debug!("Unparseable timestamp {:?}, using fetch time", text);
            SiteTime::approximate(fetched_at)
        }
    }
}

pub fn try_parse_site_time(text: &str, fetched_at: DateTime<Utc>) -> Option<SiteTime> {
    let s = normalize_whitespace(text);
    if s.is_empty() {
        return None;
    }
    parse_absolute(&s)
        .map(SiteTime::exact)
        .or_else(|| parse_relative(&s, fetched_at).map(SiteTime::approximate))
        .or_else(|| parse_day_word(&s, fetched_at))
        .or_else(|| parse_day_month(&s, fetched_at).map(SiteTime::exact))
}

/// Absolute timestamps only; feeds must not fall back to the fetch time.
pub fn parse_feed_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let s = normalize_whitespace(text);
    if s.is_empty() {
        return None;
    }
    parse_absolute(&s)
}

fn parse_absolute(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d.and_time(NaiveTime::MIN).and_utc());
        }
    }
    None
}

/// "2 timer siden", "för 1 minut sedan", "3 hours ago", "for 1 døgn siden".
///
/// Results are truncated to the phrase's unit (at most an hour) so that the
/// same phrase read a few minutes apart lands on the same instant.
fn parse_relative(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = s.to_lowercase();
    if matches!(
        lower.as_str(),
        "nå" | "akkurat nå" | "nu" | "just nu" | "just now" | "now"
    ) {
        return now.duration_trunc(Duration::minutes(1)).ok();
    }

    let caps = RELATIVE_RE.captures(&lower)?;
    let n: i64 = match &caps[1] {
        "ett" | "en" | "ei" | "et" | "one" | "an" | "a" => 1,
        digits => digits.parse().ok()?,
    };
    let n = i32::try_from(n).ok().filter(|n| *n <= 100_000)?;
    let unit = unit_duration(&caps[2])?;
    let at = now.checked_sub_signed(unit * n)?;
    at.duration_trunc(unit.min(Duration::hours(1))).ok()
}

fn unit_duration(unit: &str) -> Option<Duration> {
    let d = match unit {
        "s" | "sek" | "sekund" | "sekunder" | "second" | "seconds" | "sec" | "secs" => {
            Duration::seconds(1)
        }
        "m" | "min" | "mins" | "minutt" | "minutter" | "minut" | "minuter" | "minute"
        | "minutes" => Duration::minutes(1),
        "t" | "h" | "time" | "timer" | "timme" | "timmar" | "hour" | "hours" => Duration::hours(1),
        "d" | "døgn" | "dag" | "dager" | "dagar" | "day" | "days" => Duration::days(1),
        "uke" | "uker" | "vecka" | "veckor" | "week" | "weeks" => Duration::weeks(1),
        _ => return None,
    };
    Some(d)
}

/// "i går kl 14:30", "idag 09:15", "yesterday". A bare day word is
/// approximate and pinned to midnight.
fn parse_day_word(s: &str, now: DateTime<Utc>) -> Option<SiteTime> {
    let caps = DAY_WORD_RE.captures(s)?;
    let word = caps[1].to_lowercase();
    let date = if word.contains("går") || word == "yesterday" {
        now.date_naive() - Duration::days(1)
    } else {
        now.date_naive()
    };
    match (caps.get(2), caps.get(3)) {
        (Some(h), Some(m)) => {
            let time = NaiveTime::from_hms_opt(h.as_str().parse().ok()?, m.as_str().parse().ok()?, 0)?;
            Some(SiteTime::exact(date.and_time(time).and_utc()))
        }
        _ => Some(SiteTime::approximate(date.and_time(NaiveTime::MIN).and_utc())),
    }
}

/// "15. aug.", "3 mars 2024", "15. aug. kl 10:30". Without a year the most
/// recent such date not after the fetch is assumed.
fn parse_day_month(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = DAY_MONTH_RE.captures(s)?;
    let day: u32 = caps[1].parse().ok()?;
    let month = month_number(&caps[2].to_lowercase())?;
    let time = match (caps.get(4), caps.get(5)) {
        (Some(h), Some(m)) => {
            NaiveTime::from_hms_opt(h.as_str().parse().ok()?, m.as_str().parse().ok()?, 0)?
        }
        _ => NaiveTime::MIN,
    };

    let at = |year: i32| {
        NaiveDate::from_ymd_opt(year, month, day).map(|d| Utc.from_utc_datetime(&d.and_time(time)))
    };

    match caps.get(3) {
        Some(y) => at(y.as_str().parse().ok()?),
        None => {
            let this_year = at(now.year())?;
            if this_year > now + Duration::days(1) {
                at(now.year() - 1)
            } else {
                Some(this_year)
            }
        }
    }
}

fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect();
    let n = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "mai" | "maj" | "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "okt" | "oct" => 10,
        "nov" => 11,
        "des" | "dec" => 12,
        _ => return None,
    };
    Some(n)
}

// ── Text ──────────────────────────────────────────────────────────────────────

/// Collapse whitespace runs to a single space and trim.
pub fn normalize_whitespace(s: &str) -> String {
    WS_RE.replace_all(s.trim(), " ").into_owned()
}

/// Undo percent-encoding in URL fragments like `/forum/ticker/AKER%20BP`.
/// Form-style `+` reads as a space; undecodable input is returned as given.
pub fn percent_decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned(),
    }
}

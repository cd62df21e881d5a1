//! Politeness: robots.txt compliance, header rotation and per-origin pacing.

use crate::config::PolitenessConfig;
use crate::scraper::robots::RobotsTxt;
use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, USER_AGENT};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use url::Url;

// ── Header pools ──────────────────────────────────────────────────────────────

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "nb-NO,nb;q=0.9,no;q=0.8,en;q=0.7",
    "no-NO,no;q=0.9,en;q=0.8",
    "sv-SE,sv;q=0.9,en;q=0.8",
    "da-DK,da;q=0.9,en;q=0.8",
];

// Only encodings the client can decode.
const ACCEPT_ENCODINGS: &[&str] = &["gzip, deflate", "gzip, deflate, br", "gzip, br", "gzip"];

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// One draw from the header pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub user_agent: String,
    pub accept_language: String,
    pub accept_encoding: String,
}

impl RequestHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        let pairs = [
            (USER_AGENT, self.user_agent.as_str()),
            (ACCEPT_LANGUAGE, self.accept_language.as_str()),
            (ACCEPT_ENCODING, self.accept_encoding.as_str()),
            (ACCEPT, ACCEPT_HTML),
        ];
        for (name, value) in pairs {
            if let Ok(v) = HeaderValue::from_str(value) {
                map.insert(name, v);
            }
        }
        map
    }
}

// ── Pacing math ───────────────────────────────────────────────────────────────

/// Delay after `failures` consecutive failures: geometric growth, capped.
/// The cap never shrinks a base delay that already exceeds it.
pub fn adaptive_delay(base: Duration, failures: u32, factor: f64, cap: Duration) -> Duration {
    if failures == 0 {
        return base;
    }
    let grown = base.as_secs_f64() * factor.max(1.0).powi(failures.min(32) as i32);
    let capped = grown.min(cap.as_secs_f64().max(base.as_secs_f64()));
    Duration::from_secs_f64(capped)
}

// ── Gate ──────────────────────────────────────────────────────────────────────

struct CachedRobots {
    rules: RobotsTxt,
    fetched_at: Instant,
}

#[derive(Default)]
struct OriginState {
    last_request: Option<Instant>,
    consecutive_failures: u32,
}

pub struct PolitenessGate {
    client: reqwest::Client,
    config: PolitenessConfig,
    user_agents: Vec<String>,
    robots: Mutex<HashMap<String, CachedRobots>>,
    origins: Mutex<HashMap<String, OriginState>>,
}

impl PolitenessGate {
    pub fn new(config: &PolitenessConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build robots.txt client")?;

        let user_agents = if config.user_agents.is_empty() {
            USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            config.user_agents.clone()
        };

        Ok(Self {
            client,
            config: config.clone(),
            user_agents,
            robots: Mutex::new(HashMap::new()),
            origins: Mutex::new(HashMap::new()),
        })
    }

    /// Draw user-agent, language and encoding independently.
    pub fn random_headers(&self) -> RequestHeaders {
        let mut rng = rand::rng();
        let pick = |pool: &[&str], rng: &mut rand::rngs::ThreadRng| {
            pool.choose(rng).map(|s| s.to_string()).unwrap_or_default()
        };
        RequestHeaders {
            user_agent: self
                .user_agents
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| USER_AGENTS[0].to_string()),
            accept_language: pick(ACCEPT_LANGUAGES, &mut rng),
            accept_encoding: pick(ACCEPT_ENCODINGS, &mut rng),
        }
    }

    /// robots.txt check; fails open when the file can't be fetched or read.
    pub async fn can_fetch(&self, url: &Url) -> bool {
        let Some(authority) = authority_of(url) else {
            return true;
        };

        let ttl = Duration::from_secs(self.config.robots_ttl_secs);
        {
            let cache = self.robots.lock().await;
            if let Some(cached) = cache.get(&authority) {
                if cached.fetched_at.elapsed() < ttl {
                    return cached.rules.is_allowed(url.as_str());
                }
            }
        }

        let rules = self.fetch_robots(&authority).await;
        let allowed = rules.is_allowed(url.as_str());
        self.robots.lock().await.insert(
            authority,
            CachedRobots {
                rules,
                fetched_at: Instant::now(),
            },
        );
        allowed
    }

    async fn fetch_robots(&self, authority: &str) -> RobotsTxt {
        let robots_url = format!("{}/robots.txt", authority);
        debug!("Fetching {}", robots_url);

        match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => RobotsTxt::parse(&self.config.robots_agent, &body),
                Err(e) => {
                    warn!("Unreadable {} ({}), allowing", robots_url, e);
                    RobotsTxt::allow_all()
                }
            },
            Ok(resp) => {
                debug!("{} returned {}, allowing", robots_url, resp.status());
                RobotsTxt::allow_all()
            }
            Err(e) => {
                warn!("Could not fetch {} ({}), allowing", robots_url, e);
                RobotsTxt::allow_all()
            }
        }
    }

    async fn crawl_delay(&self, url: &Url) -> Option<Duration> {
        let authority = authority_of(url)?;
        let cache = self.robots.lock().await;
        cache
            .get(&authority)
            .and_then(|c| c.rules.crawl_delay())
    }

    fn sample_delay(&self) -> Duration {
        let min = self.config.min_delay_ms;
        let max = self.config.max_delay_ms.max(min);
        let ms = if max == min {
            min
        } else {
            rand::rng().random_range(min..=max)
        };
        Duration::from_millis(ms)
    }

    /// Sleep before a request so consecutive requests to one origin are
    /// spaced by a random delay, stretched after failures.
    pub async fn pace(&self, url: &Url) {
        let origin = url.origin().ascii_serialization();
        let crawl_delay = self.crawl_delay(url).await;

        let wait = {
            let origins = self.origins.lock().await;
            match origins.get(&origin) {
                Some(OriginState {
                    last_request: Some(last),
                    consecutive_failures,
                }) => {
                    let mut delay = adaptive_delay(
                        self.sample_delay(),
                        *consecutive_failures,
                        self.config.backoff_factor,
                        Duration::from_millis(self.config.max_backoff_ms),
                    );
                    if let Some(cd) = crawl_delay {
                        delay = delay.max(cd);
                    }
                    delay.saturating_sub(last.elapsed())
                }
                _ => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            debug!("Polite delay {:.2?} before {}", wait, origin);
            sleep(wait).await;
        }

        self.origins
            .lock()
            .await
            .entry(origin)
            .or_default()
            .last_request = Some(Instant::now());
    }

    pub async fn record_success(&self, url: &Url) {
        let origin = url.origin().ascii_serialization();
        if let Some(state) = self.origins.lock().await.get_mut(&origin) {
            state.consecutive_failures = 0;
        }
    }

    pub async fn record_failure(&self, url: &Url) {
        let origin = url.origin().ascii_serialization();
        let mut origins = self.origins.lock().await;
        let state = origins.entry(origin).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
    }

    #[cfg(test)]
    async fn seed_robots(&self, authority: &str, rules: RobotsTxt) {
        self.robots.lock().await.insert(
            authority.to_string(),
            CachedRobots {
                rules,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// `{scheme}://{host}[:port]`, the key robots rules are cached under.
fn authority_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

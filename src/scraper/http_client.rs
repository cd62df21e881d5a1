use crate::config::PolitenessConfig;
use crate::error::{FetchError, FetchResult};
use crate::scraper::politeness::PolitenessGate;
use crate::scraper::rate_limit::SlidingWindowLimiter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};
use url::Url;

/// Anything that can turn a URL into a response body.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get_text(&self, url: &str) -> FetchResult<String>;
}

pub struct HttpClient {
    inner: reqwest::Client,
    gate: Arc<PolitenessGate>,
}

impl HttpClient {
    pub fn new(config: &PolitenessConfig, gate: Arc<PolitenessGate>) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { inner, gate })
    }

    /// One polite GET: robots check, pacing, randomized headers. No retry.
    async fn fetch_once(&self, raw: &str) -> FetchResult<String> {
        let url = Url::parse(raw).map_err(|_| FetchError::InvalidUrl {
            url: raw.to_string(),
        })?;

        if !self.gate.can_fetch(&url).await {
            return Err(FetchError::RobotsDisallowed {
                url: raw.to_string(),
            });
        }

        self.gate.pace(&url).await;
        debug!("GET {}", url);

        let headers = self.gate.random_headers().to_header_map();
        let resp = match self.inner.get(url.clone()).headers(headers).send().await {
            Ok(resp) => resp,
            Err(source) => {
                self.gate.record_failure(&url).await;
                return Err(FetchError::Network {
                    url: raw.to_string(),
                    source,
                });
            }
        };

        let status = resp.status();
        if !status.is_success() {
            self.gate.record_failure(&url).await;
            return Err(FetchError::Status {
                url: raw.to_string(),
                status: status.as_u16(),
            });
        }

        match resp.text().await {
            Ok(body) => {
                self.gate.record_success(&url).await;
                Ok(body)
            }
            Err(source) => {
                self.gate.record_failure(&url).await;
                Err(FetchError::Network {
                    url: raw.to_string(),
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpClient {
    async fn get_text(&self, url: &str) -> FetchResult<String> {
        self.fetch_once(url).await
    }
}

// ── API fetches ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    /// base, 2×base, 4×base … with jitter, capped at one minute.
    fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor((self.base_delay_ms / 2).max(1))
            .max_delay(Duration::from_secs(60))
            .map(jitter)
            .take(self.max_retries)
    }
}

/// API-style access: a shared call limiter in front, transient failures
/// retried with exponential backoff.
pub struct ApiClient<S: PageSource + ?Sized> {
    source: Arc<S>,
    limiter: Arc<SlidingWindowLimiter>,
    policy: RetryPolicy,
}

impl<S: PageSource + ?Sized> ApiClient<S> {
    pub fn new(source: Arc<S>, limiter: Arc<SlidingWindowLimiter>, policy: RetryPolicy) -> Self {
        Self {
            source,
            limiter,
            policy,
        }
    }

    pub async fn get_text(&self, url: &str) -> FetchResult<String> {
        let source = &self.source;
        let limiter = &self.limiter;
        RetryIf::start(
            self.policy.delays(),
            move || async move {
                limiter.until_ready().await;
                source.get_text(url).await
            },
            |e: &FetchError| {
                let retry = e.is_transient();
                if retry {
                    warn!("Transient failure, retrying: {}", e);
                }
                retry
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the given status a number of times, then succeeds.
    struct Flaky {
        failures: usize,
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageSource for Flaky {
        async fn get_text(&self, url: &str) -> FetchResult<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(FetchError::Status {
                    url: url.to_string(),
                    status: self.status,
                })
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn client(source: Arc<Flaky>, retries: usize) -> ApiClient<Flaky> {
        ApiClient::new(
            source,
            Arc::new(SlidingWindowLimiter::per_minute(100)),
            RetryPolicy {
                max_retries: retries,
                base_delay_ms: 10,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_throttled_responses() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            status: 429,
            calls: AtomicUsize::new(0),
        });
        let api = client(Arc::clone(&flaky), 3);
        assert_eq!(api.get_text("https://api.example/news").await.unwrap(), "ok");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_passes_the_limiter() {
        let flaky = Arc::new(Flaky {
            failures: 1,
            status: 503,
            calls: AtomicUsize::new(0),
        });
        let limiter = Arc::new(SlidingWindowLimiter::per_minute(100));
        let api = ApiClient::new(
            Arc::clone(&flaky),
            Arc::clone(&limiter),
            RetryPolicy {
                max_retries: 3,
                base_delay_ms: 10,
            },
        );
        assert_eq!(api.get_text("https://api.example/news").await.unwrap(), "ok");
        assert_eq!(limiter.in_window().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_cap() {
        let flaky = Arc::new(Flaky {
            failures: 10,
            status: 503,
            calls: AtomicUsize::new(0),
        });
        let api = client(Arc::clone(&flaky), 2);
        assert!(api.get_text("https://api.example/news").await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let flaky = Arc::new(Flaky {
            failures: 1,
            status: 404,
            calls: AtomicUsize::new(0),
        });
        let api = client(Arc::clone(&flaky), 3);
        assert!(matches!(
            api.get_text("https://api.example/news").await,
            Err(FetchError::Status { status: 404, .. })
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1_000,
        };
        let raw: Vec<Duration> = ExponentialBackoff::from_millis(2)
            .factor(policy.base_delay_ms / 2)
            .take(3)
            .collect();
        assert_eq!(
            raw,
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000)
            ]
        );
        assert_eq!(policy.delays().count(), 3);
    }
}

//! Pipeline orchestrator: one fetch cycle per source.
//!
//! ## Cycle
//!
//! 1. Ask the state store for a fetch window.
//! 2. Walk the source's units (Hegnar threads, listing pages, announcement
//!    feeds) one URL at a time, parse, resolve tickers, drop records older
//!    than the window, hand the rest to the batch sink.
//! 3. Final flush, close the browser session, then move the watermark.
//!
//! Paging stops as soon as a page yields no record not already seen this
//! cycle. Cancellation is honoured between URLs.

pub mod sink;

use crate::config::AppConfig;
use crate::loader::load_universe;
use crate::models::{CycleStats, FetchWindow, Forum};
use crate::scraper::fetch::FetchStrategy;
use crate::scraper::http_client::{ApiClient, PageSource, RetryPolicy};
use crate::scraper::parsers::{hegnar, nasdaq, newsweb, paged_url, ParseContext, Site};
use crate::scraper::rate_limit::SlidingWindowLimiter;
use crate::scraper::{polite_client, renderer};
use crate::state::IncrementalStateStore;
use crate::storage::Repository;
use crate::ticker::TickerResolver;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::sink::BatchUpsertSink;

/// Records seen on one fetched page.
#[derive(Debug, Default, Clone, Copy)]
struct PageYield {
    in_window: usize,
    new: usize,
}

/// How far a crawl got.
#[derive(Debug, Default)]
struct Crawl {
    found: usize,
    cancelled: bool,
}

pub struct Pipeline {
    config: AppConfig,
    repo: Arc<Repository>,
    state: IncrementalStateStore,
    http: Arc<dyn PageSource>,
    api: ApiClient<dyn PageSource>,
    resolver: TickerResolver,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: AppConfig, repo: Arc<Repository>, cancel: CancellationToken) -> Result<Self> {
        let http: Arc<dyn PageSource> = Arc::new(
            polite_client(&config.politeness).context("Failed to build HTTP client")?,
        );
        let mut resolver = TickerResolver::new();
        if let Some(path) = &config.sources.ticker_universe {
            let entries = load_universe(path)?;
            resolver = resolver.with_universe(entries.into_iter().map(|e| e.symbol));
        }
        Ok(Self::with_parts(config, repo, http, resolver, cancel))
    }

    pub fn with_parts(
        config: AppConfig,
        repo: Arc<Repository>,
        http: Arc<dyn PageSource>,
        resolver: TickerResolver,
        cancel: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(SlidingWindowLimiter::per_minute(
            config.pipeline.api_calls_per_minute,
        ));
        let policy = RetryPolicy {
            max_retries: config.pipeline.api_max_retries,
            base_delay_ms: config.pipeline.api_retry_base_ms,
        };
        Self {
            state: IncrementalStateStore::new(Arc::clone(&repo)),
            api: ApiClient::new(Arc::clone(&http), limiter, policy),
            config,
            repo,
            http,
            resolver,
            cancel,
        }
    }

    /// Incremental cycle for one source.
    pub async fn run_cycle(&self, site: Site) -> Result<CycleStats> {
        self.cycle(site, None).await
    }

    /// Non-incremental cycle over the last `days` days.
    pub async fn backfill(&self, site: Site, days: i64) -> Result<CycleStats> {
        self.cycle(site, Some(days)).await
    }

    /// Every site in `sites` as its own task, at most `concurrency` at once.
    pub async fn run_all(self: Arc<Self>, sites: Vec<Site>) -> Vec<(Site, Result<CycleStats>)> {
        let sem = Arc::new(Semaphore::new(self.config.pipeline.concurrency.max(1)));
        let mut handles = Vec::new();

        for site in sites {
            let pipeline = Arc::clone(&self);
            let sem = Arc::clone(&sem);
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire().await?;
                pipeline.run_cycle(site).await
            });
            handles.push((site, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (site, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => {
                    error!("Task panic for {}: {}", site.name(), e);
                    Err(anyhow::anyhow!("task for {} panicked", site.name()))
                }
            };
            if let Err(e) = &result {
                warn!("{}: {:#}", site.name(), e);
            }
            results.push((site, result));
        }
        results
    }

    async fn cycle(&self, site: Site, forced_days: Option<i64>) -> Result<CycleStats> {
        let source = site.name();
        let now = Utc::now();
        let window = match forced_days {
            Some(days) => FetchWindow {
                days_back: days.max(1),
                is_incremental: false,
                reference_ts: None,
            },
            None => self.state.get_fetch_window(
                source,
                self.config.pipeline.default_days_back,
                now,
            )?,
        };
        let since = window.since(now);
        info!(
            source,
            "=== Cycle start: {} days back (incremental={}) ===",
            window.days_back,
            window.is_incremental
        );

        let fetcher = FetchStrategy::new(Arc::clone(&self.http), renderer(&self.config.browser)?);
        let run_id = match self.repo.begin_scrape_run(source) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(source, "Could not log scrape run: {:#}", e);
                None
            }
        };
        let mut sink = BatchUpsertSink::new(
            self.repo.clone(),
            self.config.pipeline.batch_size_posts,
            self.config.pipeline.batch_size_units,
        );

        let crawled = self.crawl(site, &fetcher, &mut sink, since).await;
        fetcher.close().await;
        // Pending records are valid whatever happened to the crawl.
        debug!(source, "Final flush of {} pending records", sink.pending());
        let flushed = sink.finish();

        let outcome = match (crawled, flushed) {
            (Ok(crawl), Ok(sink_stats)) => Ok((crawl, sink_stats)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };

        match outcome {
            Ok((crawl, sink_stats)) => {
                let stats = CycleStats {
                    records_found: crawl.found,
                    records_stored: sink_stats.stored,
                };
                if crawl.cancelled {
                    warn!(source, "Cycle cancelled, watermark left unchanged");
                    self.close_run(run_id, &stats, Some("cancelled"));
                    return Ok(stats);
                }

                self.state.update_fetch(source, now)?;
                if !window.is_incremental {
                    self.state.update_backfill(source, now)?;
                }
                self.close_run(run_id, &stats, None);
                info!(
                    source,
                    "=== Cycle done: {} found | {} new ===",
                    stats.records_found,
                    stats.records_stored
                );
                Ok(stats)
            }
            Err(e) => {
                error!(source, "Cycle failed: {:#}", e);
                self.close_run(run_id, &CycleStats::default(), Some(&format!("{:#}", e)));
                Err(e)
            }
        }
    }

    fn close_run(&self, run_id: Option<i64>, stats: &CycleStats, error: Option<&str>) {
        let Some(id) = run_id else { return };
        if let Err(e) =
            self.repo
                .finish_scrape_run(id, stats.records_found, stats.records_stored, error)
        {
            warn!("Could not close scrape run {}: {:#}", id, e);
        }
    }

    async fn crawl(
        &self,
        site: Site,
        fetcher: &FetchStrategy,
        sink: &mut BatchUpsertSink,
        since: DateTime<Utc>,
    ) -> Result<Crawl> {
        match site {
            Site::Hegnar => self.crawl_threads(fetcher, sink, since).await,
            Site::Placera | Site::Nordnet => self.crawl_listing(site, fetcher, sink, since).await,
            Site::OsloBors => {
                let api = self.config.sources.newsweb_api_url.as_str();
                let feeds = self
                    .config
                    .sources
                    .newsweb_issuers
                    .iter()
                    .map(|issuer| -> Result<(String, String)> {
                        Ok((issuer.clone(), newsweb::feed_url(api, issuer, since.date_naive())?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.crawl_feeds(site, feeds, sink, since).await
            }
            Site::Nasdaq => {
                let rss = self.config.sources.nasdaq_rss_url.as_str();
                let feeds = self
                    .config
                    .sources
                    .nasdaq_instruments
                    .iter()
                    .map(|ric| -> Result<(String, String)> {
                        Ok((ric.clone(), nasdaq::feed_url(rss, ric)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.crawl_feeds(site, feeds, sink, since).await
            }
        }
    }

    fn forum(&self, site: Site) -> Result<&Forum> {
        self.config
            .forum(site.name())
            .with_context(|| format!("no forum configured for {}", site.name()))
    }

    fn cancelled(&self, source: &str) -> bool {
        let c = self.cancel.is_cancelled();
        if c {
            info!(source, "Cancellation requested, stopping at page boundary");
        }
        c
    }

    /// Parse a document, resolve tickers and queue what falls in the window.
    fn ingest(
        &self,
        site: Site,
        document: &str,
        ctx: &ParseContext,
        sink: &mut BatchUpsertSink,
        since: DateTime<Utc>,
    ) -> Result<PageYield> {
        let candidates = site.parse(document, ctx);
        let records = self.resolver.apply(candidates, ctx, site.ticker_required());
        let mut out = PageYield::default();
        for record in records {
            if record.timestamp() < since {
                continue;
            }
            out.in_window += 1;
            if sink.accumulate(record)? {
                out.new += 1;
            }
        }
        Ok(out)
    }

    /// Placera and Nordnet: each listing page is one unit.
    async fn crawl_listing(
        &self,
        site: Site,
        fetcher: &FetchStrategy,
        sink: &mut BatchUpsertSink,
        since: DateTime<Utc>,
    ) -> Result<Crawl> {
        let source = site.name();
        let forum = self.forum(site)?;
        let hints = site.render_hints();
        let mut crawl = Crawl::default();

        for page in 1..=self.config.pipeline.max_listing_pages {
            if self.cancelled(source) {
                crawl.cancelled = true;
                break;
            }
            let Some(url) = site.listing_url(&forum.base_url, page) else {
                break;
            };
            let Some(html) = fetcher.fetch(&url, &hints).await? else {
                break;
            };

            let ctx = ParseContext::new(forum.id, url.as_str(), Utc::now());
            let got = self.ingest(site, &html, &ctx, sink, since)?;
            sink.end_unit()?;
            crawl.found += got.in_window;
            info!(source, "Page {}: {} in window, {} new", page, got.in_window, got.new);
            if got.new == 0 {
                break;
            }
        }
        Ok(crawl)
    }

    /// Hegnar: index pages list threads; every thread is paged on its own
    /// and is one unit.
    async fn crawl_threads(
        &self,
        fetcher: &FetchStrategy,
        sink: &mut BatchUpsertSink,
        since: DateTime<Utc>,
    ) -> Result<Crawl> {
        let site = Site::Hegnar;
        let source = site.name();
        let forum = self.forum(site)?;
        let hints = site.render_hints();
        let mut crawl = Crawl::default();

        let mut threads = Vec::new();
        let mut known = HashSet::new();
        for page in 1..=self.config.pipeline.max_listing_pages {
            if self.cancelled(source) {
                crawl.cancelled = true;
                return Ok(crawl);
            }
            let Some(url) = site.listing_url(&forum.base_url, page) else {
                break;
            };
            let Some(html) = fetcher.fetch(&url, &hints).await? else {
                break;
            };
            let ctx = ParseContext::new(forum.id, url.as_str(), Utc::now());
            let before = threads.len();
            for t in hegnar::parse_index(&html, &ctx)? {
                if known.insert(t.id.clone()) {
                    threads.push(t);
                }
            }
            info!(source, "Index page {}: {} new threads", page, threads.len() - before);
            if threads.len() == before {
                break;
            }
        }

        for thread in &threads {
            for page in 1..=self.config.pipeline.max_thread_pages {
                if self.cancelled(source) {
                    crawl.cancelled = true;
                    return Ok(crawl);
                }
                let url = paged_url(&thread.url, page);
                let Some(html) = fetcher.fetch(&url, &hints).await? else {
                    break;
                };
                let ctx = ParseContext::new(forum.id, url.as_str(), Utc::now())
                    .with_hint(thread.ticker_hint.clone());
                let got = self.ingest(site, &html, &ctx, sink, since)?;
                crawl.found += got.in_window;
                if got.new == 0 {
                    break;
                }
            }
            sink.end_unit()?;
        }
        Ok(crawl)
    }

    /// Announcement feeds: one API call per issuer or instrument.
    async fn crawl_feeds(
        &self,
        site: Site,
        feeds: Vec<(String, String)>,
        sink: &mut BatchUpsertSink,
        since: DateTime<Utc>,
    ) -> Result<Crawl> {
        let source = site.name();
        let mut crawl = Crawl::default();

        for (symbol, url) in feeds {
            if self.cancelled(source) {
                crawl.cancelled = true;
                break;
            }
            let body = match self.api.get_text(&url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(source, "{}: {}", symbol, e);
                    continue;
                }
            };
            let ctx = ParseContext::new(0, url.as_str(), Utc::now()).with_hint(Some(symbol.clone()));
            let got = self.ingest(site, &body, &ctx, sink, since)?;
            sink.end_unit()?;
            crawl.found += got.in_window;
            info!(source, "{}: {} in window, {} new", symbol, got.in_window, got.new);
        }
        Ok(crawl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, FetchResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned responses by URL; anything else is a 404.
    #[derive(Default)]
    struct Pages {
        bodies: HashMap<String, String>,
        hits: Mutex<Vec<String>>,
    }

    impl Pages {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.bodies.insert(url.to_string(), body.to_string());
            self
        }

        fn hits(&self) -> Vec<String> {
            self.hits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for Pages {
        async fn get_text(&self, url: &str) -> FetchResult<String> {
            self.hits.lock().unwrap().push(url.to_string());
            self.bodies.get(url).cloned().ok_or(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.browser.enabled = false;
        cfg.pipeline.api_retry_base_ms = 1;
        cfg.pipeline.api_max_retries = 1;
        cfg.sources.newsweb_api_url = "https://api.test/v1".into();
        cfg.sources.newsweb_issuers = vec!["EQNR".into(), "TEL".into()];
        cfg
    }

    fn pipeline(pages: Arc<Pages>) -> (Pipeline, Arc<Repository>) {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        let repo = Arc::new(repo);
        let p = Pipeline::with_parts(
            config(),
            repo.clone(),
            pages,
            TickerResolver::new(),
            CancellationToken::new(),
        );
        (p, repo)
    }

    const HEGNAR_INDEX: &str = r#"<table>
      <tr><td><a href="/forum/thread/901/view">AKER - kvartal</a></td>
          <td><a href="/forum/ticker/AKER">AKER</a></td></tr>
    </table>"#;

    const HEGNAR_THREAD: &str = r#"<h1>AKER - kvartal</h1>
      <div id="post_1"><a href="/forum/user/1/view">ola</a><span>2 timer siden</span>
        <div class="post content">Sterke tall i dag, holder videre.</div></div>
      <div id="post_2"><a href="/forum/user/2/view">kari</a><span>1 time siden</span>
        <div class="post content">Enig, dette ser lovende ut for Aker.</div></div>"#;

    fn hegnar_pages() -> Pages {
        Pages::default()
            .with("https://www.finansavisen.no/forum/", HEGNAR_INDEX)
            .with("https://www.finansavisen.no/forum/?page=2", HEGNAR_INDEX)
            .with("https://www.finansavisen.no/forum/thread/901/view", HEGNAR_THREAD)
            .with("https://www.finansavisen.no/forum/thread/901/view?page=2", HEGNAR_THREAD)
    }

    #[tokio::test]
    async fn hegnar_cycle_then_incremental_rerun() {
        let pages = Arc::new(hegnar_pages());
        let (p, repo) = pipeline(pages.clone());

        let stats = p.run_cycle(Site::Hegnar).await.unwrap();
        assert_eq!(stats, CycleStats { records_found: 4, records_stored: 2 });
        assert_eq!(repo.post_count().unwrap(), 2);

        // Repeated index and thread pages stop paging.
        let hits = pages.hits();
        assert_eq!(hits.len(), 4);

        let state = repo.fetch_state("hegnar").unwrap().unwrap();
        assert!(state.last_fetch_ts.is_some());
        assert!(state.last_backfill_ts.is_some());

        let w = p.state.get_fetch_window("hegnar", 1, Utc::now()).unwrap();
        assert!(w.is_incremental);

        let again = p.run_cycle(Site::Hegnar).await.unwrap();
        assert_eq!(again.records_stored, 0);
        assert_eq!(repo.post_count().unwrap(), 2);
        assert_eq!(repo.fetch_state("hegnar").unwrap().unwrap().total_fetch_count, 2);
    }

    #[tokio::test]
    async fn placera_drops_posts_without_ticker() {
        let feed = r#"<div class="post-list">
          <article class="post-card"><a data-testid="author-name">a</a><p><span>för 5 minuter sedan</span></p>
            <div class="post-body">Köper mer VOLV idag, stark rapport.</div></article>
          <article class="post-card"><a data-testid="author-name">b</a><p><span>för 7 minuter sedan</span></p>
            <div class="post-body">vad tycker ni om marknaden just nu?</div></article>
        </div>"#;
        let pages = Arc::new(Pages::default().with("https://forum.placera.se/", feed));
        let (p, repo) = pipeline(pages.clone());

        let stats = p.run_cycle(Site::Placera).await.unwrap();
        assert_eq!(stats.records_stored, 1);
        assert_eq!(repo.post_count().unwrap(), 1);
        // Page 2 is a 404: paging ends without failing the cycle.
        assert_eq!(pages.hits().len(), 2);
    }

    #[tokio::test]
    async fn feed_failures_skip_only_that_issuer() {
        let json = r#"{"news":[{"headline":"Q1 results","publishDate":"2099-01-01T07:00:00Z"}]}"#;
        let since = (Utc::now() - chrono::Duration::days(1)).date_naive();
        let eqnr = newsweb::feed_url("https://api.test/v1", "EQNR", since).unwrap();
        let pages = Arc::new(Pages::default().with(&eqnr, json));
        let (p, repo) = pipeline(pages);

        let stats = p.run_cycle(Site::OsloBors).await.unwrap();
        assert_eq!(stats.records_stored, 1);
        assert_eq!(repo.announcement_count().unwrap(), 1);
        assert!(repo.fetch_state("oslobors").unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelled_cycle_keeps_watermark() {
        let pages = Arc::new(hegnar_pages());
        let (p, repo) = pipeline(pages.clone());
        p.cancel.cancel();

        let stats = p.run_cycle(Site::Hegnar).await.unwrap();
        assert_eq!(stats.records_found, 0);
        assert!(pages.hits().is_empty());
        assert!(repo.fetch_state("hegnar").unwrap().is_none());
    }

    #[tokio::test]
    async fn backfill_forces_a_full_window() {
        let pages = Arc::new(hegnar_pages());
        let (p, repo) = pipeline(pages);
        p.run_cycle(Site::Hegnar).await.unwrap();
        let stats = p.backfill(Site::Hegnar, 7).await.unwrap();
        assert_eq!(stats.records_stored, 0);
        let state = repo.fetch_state("hegnar").unwrap().unwrap();
        assert_eq!(state.total_fetch_count, 2);
        assert_eq!(state.last_backfill_ts, state.last_fetch_ts);
    }

    #[tokio::test]
    async fn run_all_reports_every_site() {
        let pages = Arc::new(hegnar_pages());
        let (p, _repo) = pipeline(pages);
        let results = Arc::new(p).run_all(vec![Site::Hegnar, Site::Nordnet]).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, Site::Hegnar);
        tokio_test::assert_ok!(results[0].1.as_ref());
        // Nordnet's listing is a 404: no records but not an error.
        let nordnet = tokio_test::assert_ok!(results[1].1.as_ref());
        assert_eq!(nordnet.records_found, 0);
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::Forum;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub politeness: PolitenessConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Outbound request etiquette
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolitenessConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied per consecutive failure against an origin.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_robots_ttl_secs")]
    pub robots_ttl_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Agent name matched against robots.txt groups.
    #[serde(default = "default_robots_agent")]
    pub robots_agent: String,

    /// Replaces the built-in user-agent pool when non-empty.
    #[serde(default)]
    pub user_agents: Vec<String>,
}

/// Headless browser (WebDriver) settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    #[serde(default = "default_page_load_timeout_secs")]
    pub page_load_timeout_secs: u64,

    /// Extra wait after navigation so client-side scripts can settle.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_true")]
    pub headless: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size_posts")]
    pub batch_size_posts: usize,

    /// Logical units (threads, listing pages, feeds) between flushes.
    #[serde(default = "default_batch_size_units")]
    pub batch_size_units: usize,

    #[serde(default = "default_days_back")]
    pub default_days_back: i64,

    #[serde(default = "default_max_pages")]
    pub max_listing_pages: u32,

    #[serde(default = "default_max_pages")]
    pub max_thread_pages: u32,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_api_calls_per_minute")]
    pub api_calls_per_minute: usize,

    #[serde(default = "default_max_retries")]
    pub api_max_retries: usize,

    #[serde(default = "default_retry_base_ms")]
    pub api_retry_base_ms: u64,
}

/// Reference data supplied for each source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    #[serde(default = "default_forums")]
    pub forums: Vec<Forum>,

    #[serde(default = "default_newsweb_url")]
    pub newsweb_api_url: String,

    /// Oslo Børs issuers polled for announcements (ticker symbols).
    #[serde(default = "default_newsweb_issuers")]
    pub newsweb_issuers: Vec<String>,

    #[serde(default = "default_nasdaq_rss_url")]
    pub nasdaq_rss_url: String,

    /// Nasdaq Nordic instruments as RICs, e.g. `VOLV-B.ST`.
    #[serde(default = "default_nasdaq_instruments")]
    pub nasdaq_instruments: Vec<String>,

    /// Optional CSV of known symbols (`symbol,name,exchange`).
    #[serde(default)]
    pub ticker_universe: Option<PathBuf>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_min_delay_ms() -> u64 {
    3_000
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_max_backoff_ms() -> u64 {
    15_000
}
fn default_robots_ttl_secs() -> u64 {
    3_600
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_robots_agent() -> String {
    "*".to_string()
}
fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}
fn default_page_load_timeout_secs() -> u64 {
    30
}
fn default_settle_ms() -> u64 {
    2_000
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/ingest.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_batch_size_posts() -> usize {
    100
}
fn default_batch_size_units() -> usize {
    10
}
fn default_days_back() -> i64 {
    1
}
fn default_max_pages() -> u32 {
    5
}
fn default_concurrency() -> usize {
    3
}
fn default_api_calls_per_minute() -> usize {
    60
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_forums() -> Vec<Forum> {
    vec![
        Forum {
            id: 1,
            name: "hegnar".to_string(),
            base_url: "https://www.finansavisen.no".to_string(),
        },
        Forum {
            id: 2,
            name: "placera".to_string(),
            base_url: "https://forum.placera.se".to_string(),
        },
        Forum {
            id: 3,
            name: "nordnet".to_string(),
            base_url: "https://www.nordnet.no".to_string(),
        },
    ]
}
fn default_newsweb_url() -> String {
    "https://api3.oslo.oslobors.no/v1/newsreader".to_string()
}
fn default_newsweb_issuers() -> Vec<String> {
    ["EQNR", "TEL", "DNB"].iter().map(|s| s.to_string()).collect()
}
fn default_nasdaq_rss_url() -> String {
    "https://www.nasdaqomxnordic.com/news/rss".to_string()
}
fn default_nasdaq_instruments() -> Vec<String> {
    ["VOLV-B.ST", "ERIC-B.ST", "NOVO-B.CO", "NOKIA.HE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            robots_ttl_secs: default_robots_ttl_secs(),
            timeout_secs: default_timeout_secs(),
            robots_agent: default_robots_agent(),
            user_agents: Vec::new(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webdriver_url: default_webdriver_url(),
            page_load_timeout_secs: default_page_load_timeout_secs(),
            settle_ms: default_settle_ms(),
            headless: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size_posts: default_batch_size_posts(),
            batch_size_units: default_batch_size_units(),
            default_days_back: default_days_back(),
            max_listing_pages: default_max_pages(),
            max_thread_pages: default_max_pages(),
            concurrency: default_concurrency(),
            api_calls_per_minute: default_api_calls_per_minute(),
            api_max_retries: default_max_retries(),
            api_retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            forums: default_forums(),
            newsweb_api_url: default_newsweb_url(),
            newsweb_issuers: default_newsweb_issuers(),
            nasdaq_rss_url: default_nasdaq_rss_url(),
            nasdaq_instruments: default_nasdaq_instruments(),
            ticker_universe: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            politeness: PolitenessConfig::default(),
            browser: BrowserConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("INGEST").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize()?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    fn validate(&self) -> Result<()> {
        let p = &self.politeness;
        if p.min_delay_ms > p.max_delay_ms {
            anyhow::bail!(
                "politeness.min_delay_ms ({}) exceeds max_delay_ms ({})",
                p.min_delay_ms,
                p.max_delay_ms
            );
        }
        if self.pipeline.batch_size_posts == 0 || self.pipeline.batch_size_units == 0 {
            anyhow::bail!("pipeline batch thresholds must be > 0");
        }
        if self.pipeline.api_calls_per_minute == 0 {
            anyhow::bail!("pipeline.api_calls_per_minute must be > 0");
        }
        Ok(())
    }

    pub fn forum(&self, name: &str) -> Option<&Forum> {
        self.sources.forums.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.pipeline.batch_size_posts, 100);
        assert_eq!(cfg.politeness.min_delay_ms, 3_000);
        assert_eq!(cfg.politeness.max_delay_ms, 8_000);
        assert!(cfg.forum("hegnar").is_some());
    }

    #[test]
    fn inverted_delay_window_rejected() {
        let mut cfg = AppConfig::default();
        cfg.politeness.min_delay_ms = 9_000;
        assert!(cfg.validate().is_err());
    }
}

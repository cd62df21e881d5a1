pub mod browser;
pub mod cleaner;
pub mod fetch;
pub mod http_client;
pub mod parsers;
pub mod politeness;
pub mod rate_limit;
pub mod robots;

use crate::config::{BrowserConfig, PolitenessConfig};
use anyhow::{Context, Result};
use std::sync::Arc;

use self::browser::{Renderer, WebDriverRenderer};
use self::http_client::HttpClient;
use self::politeness::PolitenessGate;

/// HTTP client with its own robots cache and per-origin pacing.
pub fn polite_client(config: &PolitenessConfig) -> Result<HttpClient> {
    let gate = Arc::new(PolitenessGate::new(config).context("Failed to build politeness gate")?);
    HttpClient::new(config, gate)
}

/// A fresh browser handle, or `None` when rendering is switched off. No
/// session is opened until the first render.
pub fn renderer(config: &BrowserConfig) -> Result<Option<Arc<dyn Renderer>>> {
    if !config.enabled {
        return Ok(None);
    }
    let r = WebDriverRenderer::new(config).context("Failed to build WebDriver client")?;
    Ok(Some(Arc::new(r)))
}

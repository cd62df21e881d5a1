//! Headless rendering over the W3C WebDriver protocol.
//!
//! Talks to a running chromedriver (or any WebDriver endpoint) with plain
//! JSON over HTTP. The session is created on first use, reused for the rest
//! of the run and deleted by [`Renderer::close`].

use crate::config::BrowserConfig;
use crate::error::{FetchError, FetchResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Load `url`, let scripts run, return the rendered DOM as HTML.
    async fn render(&self, url: &str) -> FetchResult<String>;

    /// Release the browser session. Safe to call when none was opened.
    async fn close(&self);
}

pub struct WebDriverRenderer {
    client: reqwest::Client,
    config: BrowserConfig,
    session: Mutex<Option<String>>,
}

impl WebDriverRenderer {
    pub fn new(config: &BrowserConfig) -> FetchResult<Self> {
        // Navigation blocks until page load, so leave headroom over it.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.page_load_timeout_secs + 10))
            .build()
            .map_err(|e| FetchError::BrowserUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            config: config.clone(),
            session: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.webdriver_url.trim_end_matches('/'), path)
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            "--window-size=1920,1080",
            "--disable-blink-features=AutomationControlled",
        ];
        if self.config.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                    "timeouts": { "pageLoad": self.config.page_load_timeout_secs * 1000 }
                }
            }
        })
    }

    async fn session_id(&self) -> FetchResult<String> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }

        info!("Starting browser session at {}", self.config.webdriver_url);
        let resp = self
            .client
            .post(self.endpoint("session"))
            .json(&self.capabilities())
            .send()
            .await
            .map_err(|e| FetchError::BrowserUnavailable(e.to_string()))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::BrowserUnavailable(e.to_string()))?;

        let id = session_id_from(&body).ok_or_else(|| {
            FetchError::BrowserUnavailable(format!("no session in response: {}", body))
        })?;
        *session = Some(id.clone());
        Ok(id)
    }

    async fn command(&self, req: reqwest::RequestBuilder, url: &str) -> FetchResult<Value> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::RenderTimeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Browser(e.to_string())
            }
        })?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;

        match protocol_error(&body, url) {
            Some(err) => Err(err),
            None => Ok(body),
        }
    }
}

#[async_trait]
impl Renderer for WebDriverRenderer {
    async fn render(&self, url: &str) -> FetchResult<String> {
        let id = self.session_id().await?;
        debug!("Rendering {}", url);

        let nav = self
            .client
            .post(self.endpoint(&format!("session/{}/url", id)))
            .json(&json!({ "url": url }));
        self.command(nav, url).await?;

        if self.config.settle_ms > 0 {
            sleep(Duration::from_millis(self.config.settle_ms)).await;
        }

        let source = self
            .client
            .get(self.endpoint(&format!("session/{}/source", id)));
        let body = self.command(source, url).await?;
        body.get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FetchError::Browser("page source missing".to_string()))
    }

    async fn close(&self) {
        let Some(id) = self.session.lock().await.take() else {
            return;
        };
        match self
            .client
            .delete(self.endpoint(&format!("session/{}", id)))
            .send()
            .await
        {
            Ok(_) => info!("Browser session closed"),
            Err(e) => warn!("Failed to close browser session {}: {}", id, e),
        }
    }
}

impl Drop for WebDriverRenderer {
    fn drop(&mut self) {
        // Last resort for paths that skipped close().
        let Some(id) = self.session.get_mut().take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Browser session {} leaked: no runtime to close it", id);
            return;
        };
        let req = self
            .client
            .delete(self.endpoint(&format!("session/{}", id)));
        handle.spawn(async move {
            let _ = req.send().await;
        });
    }
}

/// Session id from a new-session response; legacy drivers put it top-level.
fn session_id_from(body: &Value) -> Option<String> {
    body.pointer("/value/sessionId")
        .or_else(|| body.get("sessionId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// WebDriver reports failures as `{"value": {"error": "...", "message": "..."}}`.
fn protocol_error(body: &Value, url: &str) -> Option<FetchError> {
    let error = body.pointer("/value/error")?.as_str()?;
    let message = body
        .pointer("/value/message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(match error {
        "timeout" | "script timeout" => FetchError::RenderTimeout {
            url: url.to_string(),
        },
        "session not created" => FetchError::BrowserUnavailable(message.to_string()),
        _ => FetchError::Browser(format!("{}: {}", error, message)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_session_id() {
        let w3c = json!({"value": {"sessionId": "abc", "capabilities": {}}});
        assert_eq!(session_id_from(&w3c).as_deref(), Some("abc"));
        let legacy = json!({"sessionId": "def", "status": 0});
        assert_eq!(session_id_from(&legacy).as_deref(), Some("def"));
        assert!(session_id_from(&json!({"value": null})).is_none());
    }

    #[test]
    fn maps_protocol_errors() {
        let timeout = json!({"value": {"error": "timeout", "message": "page load"}});
        assert!(matches!(
            protocol_error(&timeout, "u"),
            Some(FetchError::RenderTimeout { .. })
        ));
        let other = json!({"value": {"error": "no such window", "message": "gone"}});
        assert!(matches!(protocol_error(&other, "u"), Some(FetchError::Browser(_))));
        let ok = json!({"value": "<html></html>"});
        assert!(protocol_error(&ok, "u").is_none());
    }

    #[test]
    fn headless_flag_controls_args() {
        let mut cfg = BrowserConfig::default();
        cfg.headless = false;
        let r = WebDriverRenderer::new(&cfg).unwrap();
        let caps = r.capabilities().to_string();
        assert!(!caps.contains("--headless"));
    }

    #[tokio::test]
    async fn missing_driver_is_a_hard_failure() {
        let cfg = BrowserConfig {
            webdriver_url: "http://127.0.0.1:9".to_string(),
            ..BrowserConfig::default()
        };
        let r = WebDriverRenderer::new(&cfg).unwrap();
        let err = r.render("https://forum.example/").await.unwrap_err();
        assert!(matches!(err, FetchError::BrowserUnavailable(_)));
        // Nothing was opened, so close is a no-op.
        r.close().await;
    }
}

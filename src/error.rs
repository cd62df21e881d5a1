//! Typed errors for the fetch layer and storage.

use thiserror::Error;

/// Why a URL could not be turned into a document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("robots.txt disallows {url}")]
    RobotsDisallowed { url: String },

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("browser timed out rendering {url}")]
    RenderTimeout { url: String },

    /// The headless browser runtime could not be started at all.
    #[error("headless browser unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("browser protocol error: {0}")]
    Browser(String),
}

impl FetchError {
    /// 429/503 and transport failures are worth another attempt on API sources.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { .. } => true,
            FetchError::Status { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] duckdb::Error),

    #[error("metadata encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_statuses_are_transient() {
        let e = FetchError::Status { url: "u".into(), status: 429 };
        assert!(e.is_transient());
        let e = FetchError::Status { url: "u".into(), status: 404 };
        assert!(!e.is_transient());
        let e = FetchError::RenderTimeout { url: "u".into() };
        assert!(!e.is_transient());
    }
}

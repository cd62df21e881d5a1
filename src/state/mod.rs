//! Per-source fetch watermarks and the window computed from them.
//!
//! The watermark is a separate write from the batches stored during a cycle,
//! not part of their transactions. Callers that move it before the last batch
//! is durable can lose that batch on a crash with the window already marked
//! as fetched; the next cycle will not revisit it. The pipeline writes it only
//! after the final flush, so a crash there re-fetches the window instead.

use crate::models::{FetchWindow, SourceFetchState};
use crate::storage::Repository;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// A last fetch older than this starts a backfill instead of an increment.
pub const STALE_AFTER_HOURS: i64 = 48;
/// Longest backfill a stale source gets.
pub const MAX_BACKFILL_DAYS: i64 = 30;

/// Pure window computation from the last fetch time.
pub fn compute_window(
    last_fetch: Option<DateTime<Utc>>,
    default_days: i64,
    now: DateTime<Utc>,
) -> FetchWindow {
    let Some(last) = last_fetch else {
        return FetchWindow {
            days_back: default_days.max(1),
            is_incremental: false,
            reference_ts: None,
        };
    };

    let elapsed = (now - last).max(Duration::zero());
    let days = elapsed.num_days();
    if elapsed > Duration::hours(STALE_AFTER_HOURS) {
        FetchWindow {
            days_back: days.clamp(1, MAX_BACKFILL_DAYS),
            is_incremental: false,
            reference_ts: Some(last),
        }
    } else {
        FetchWindow {
            days_back: days.max(1),
            is_incremental: true,
            reference_ts: Some(last),
        }
    }
}

pub struct IncrementalStateStore {
    repo: Arc<Repository>,
}

impl IncrementalStateStore {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    pub fn get_fetch_window(
        &self,
        source: &str,
        default_days: i64,
        now: DateTime<Utc>,
    ) -> Result<FetchWindow> {
        let last = self.repo.fetch_state(source)?.and_then(|s| s.last_fetch_ts);
        let window = compute_window(last, default_days, now);
        debug!(
            source,
            "Window: {} days back, incremental={}",
            window.days_back,
            window.is_incremental
        );
        Ok(window)
    }

    pub fn update_fetch(&self, source: &str, ts: DateTime<Utc>) -> Result<()> {
        self.repo.record_fetch(source, ts)
    }

    pub fn update_backfill(&self, source: &str, ts: DateTime<Utc>) -> Result<()> {
        self.repo.record_backfill(source, ts)
    }

    pub fn state(&self, source: &str) -> Result<SourceFetchState> {
        Ok(self
            .repo
            .fetch_state(source)?
            .unwrap_or_else(|| SourceFetchState::empty(source)))
    }

    pub fn states(&self) -> Result<Vec<SourceFetchState>> {
        self.repo.fetch_states()
    }

    pub fn reset(&self, source: &str) -> Result<bool> {
        let removed = self.repo.delete_fetch_state(source)? > 0;
        info!(source, "Fetch state reset (existed: {})", removed);
        Ok(removed)
    }

    pub fn reset_all(&self) -> Result<usize> {
        let n = self.repo.delete_all_fetch_states()?;
        info!("Fetch state reset for {} sources", n);
        Ok(n)
    }
}

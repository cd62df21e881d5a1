//! Sliding-window call limiter for API-style sources.
//!
//! Independent of the per-origin politeness delay: this caps the number of
//! calls inside any rolling window. Shared between tasks through `Arc`.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    /// Block until a call slot is free, then claim it.
    pub async fn until_ready(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = calls.front() {
                    if now.duration_since(oldest) >= self.window {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }

                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }

                // Full: wait for the oldest call to leave the window.
                match calls.front() {
                    Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            debug!("Rate limit reached, sleeping {:.2?}", wait);
            sleep(wait).await;
        }
    }

    #[cfg(test)]
    pub async fn in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn blocks_until_oldest_call_leaves_window() {
        let limiter = SlidingWindowLimiter::per_minute(2);
        let start = Instant::now();

        limiter.until_ready().await;
        limiter.until_ready().await;
        assert!(start.elapsed() < Duration::from_secs(1));

        limiter.until_ready().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_between_tasks() {
        let limiter = Arc::new(SlidingWindowLimiter::new(3, Duration::from_secs(10)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.until_ready().await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Six calls at three per ten seconds need one full window.
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn no_rolling_minute_exceeds_the_cap() {
        let limiter = SlidingWindowLimiter::per_minute(4);
        let mut calls = Vec::new();
        for i in 0..20u64 {
            limiter.until_ready().await;
            calls.push(Instant::now());
            // Uneven spacing between calls.
            tokio::time::advance(Duration::from_secs(i % 3 * 7)).await;
        }
        for pair in calls.windows(5) {
            assert!(pair[4].duration_since(pair[0]) >= Duration::from_secs(60));
        }
    }
}

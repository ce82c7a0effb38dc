//! Sliding-window request limiter.
//!
//! One timestamp window per caller key. On each check the window's expired
//! entries are dropped; if the remainder is at the limit the request is
//! denied with the time until the oldest entry leaves the window. A
//! periodic sweep evicts keys whose windows have emptied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied; retry after this many milliseconds
    Denied { retry_after_ms: u64 },
}

struct LimiterState {
    windows: HashMap<String, VecDeque<Instant>>,
}

/// Sliding-window limiter keyed by caller identity.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    state: Arc<Mutex<LimiterState>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            state: Arc::new(Mutex::new(LimiterState {
                windows: HashMap::new(),
            })),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the periodic sweep that evicts fully expired keys.
    pub async fn start_sweeper(&self, interval: Duration) {
        let state = Arc::clone(&self.state);
        let window = self.window;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let handle = tokio::spawn(async move {
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cutoff) = Instant::now().checked_sub(window) else {
                    continue;
                };
                let mut state = state.lock().await;
                state.windows.retain(|_, timestamps| {
                    while timestamps.front().is_some_and(|t| *t < cutoff) {
                        timestamps.pop_front();
                    }
                    !timestamps.is_empty()
                });
            }
        });
        *self.sweeper.lock().await = Some(handle);
    }

    /// Check and record one request for `key`.
    pub async fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window);

        let mut state = self.state.lock().await;
        let timestamps = state.windows.entry(key.to_string()).or_default();

        while timestamps
            .front()
            .is_some_and(|t| cutoff.is_some_and(|cutoff| *t < cutoff))
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= self.limit {
            // The request becomes admissible when the oldest entry ages out
            let retry_after = timestamps
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            debug!("Rate limit hit for {}", key);
            return RateDecision::Denied {
                retry_after_ms: retry_after.as_millis() as u64,
            };
        }

        timestamps.push_back(now);
        RateDecision::Allowed
    }

    /// Stop the sweep task.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(limiter.check("caller").await, RateDecision::Allowed);
        }
        assert!(matches!(
            limiter.check("caller").await,
            RateDecision::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert_eq!(limiter.check("a").await, RateDecision::Allowed);
        assert_eq!(limiter.check("b").await, RateDecision::Allowed);
        assert!(matches!(limiter.check("a").await, RateDecision::Denied { .. }));
    }

    #[tokio::test]
    async fn test_denial_carries_retry_hint() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.check("caller").await;
        let RateDecision::Denied { retry_after_ms } = limiter.check("caller").await else {
            panic!("expected denial");
        };
        assert!(retry_after_ms <= 60_000);
        assert!(retry_after_ms > 55_000);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));
        assert_eq!(limiter.check("caller").await, RateDecision::Allowed);
        assert!(matches!(limiter.check("caller").await, RateDecision::Denied { .. }));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(limiter.check("caller").await, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_keys() {
        let limiter = RateLimiter::new(5, Duration::from_millis(20));
        limiter.check("transient").await;
        limiter.start_sweeper(Duration::from_millis(30)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = limiter.state.lock().await;
        assert!(state.windows.is_empty());
        drop(state);

        limiter.shutdown().await;
    }
}

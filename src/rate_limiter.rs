//! Adaptive delay governor for auxiliary REST calls.
//!
//! The delay between calls grows by `backoff_factor` on every HTTP 429 and
//! shrinks by `recovery_factor` on every success, bounded by
//! `[min_delay, max_delay]`. The WebSocket stream does not go through here.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{FeedError, Result};

/// Limiter parameters
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub recovery_factor: f64,
}

impl RateLimiterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_delay: Duration::from_millis(config.rest_min_delay_ms),
            max_delay: Duration::from_millis(config.rest_max_delay_ms),
            backoff_factor: config.rest_backoff_factor,
            recovery_factor: config.rest_recovery_factor,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            recovery_factor: 0.8,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    current_delay: Duration,
    last_request: Option<Instant>,
}

/// Adaptive rate limiter shared by every REST caller.
///
/// Each caller claims a slot `current_delay` after the previous one and
/// sleeps without holding the state lock, so 429 and success reports apply
/// to the very next claim.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        if config.backoff_factor <= 1.0 {
            return Err(FeedError::ConfigError(format!(
                "backoff_factor must be > 1, got {}",
                config.backoff_factor
            )));
        }
        if !(config.recovery_factor > 0.0 && config.recovery_factor < 1.0) {
            return Err(FeedError::ConfigError(format!(
                "recovery_factor must be within (0, 1), got {}",
                config.recovery_factor
            )));
        }
        if config.max_delay < config.min_delay {
            return Err(FeedError::ConfigError(
                "max_delay must not be below min_delay".to_string(),
            ));
        }

        Ok(Self {
            config,
            state: Mutex::new(LimiterState {
                current_delay: config.min_delay,
                last_request: None,
            }),
        })
    }

    /// Claim the next call slot, then wait for it outside the lock
    pub async fn acquire(&self) {
        let slot = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let slot = match state.last_request {
                Some(last) => (last + state.current_delay).max(now),
                None => now,
            };
            state.last_request = Some(slot);
            slot
        };

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter delaying request");
            sleep_until(slot).await;
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.current_delay = state
            .current_delay
            .mul_f64(self.config.recovery_factor)
            .max(self.config.min_delay);
    }

    /// Record an HTTP 429
    pub async fn record_rate_limited(&self) {
        let mut state = self.state.lock().await;
        state.current_delay = state
            .current_delay
            .mul_f64(self.config.backoff_factor)
            .min(self.config.max_delay);
        warn!(
            delay_ms = state.current_delay.as_millis() as u64,
            "REST rate limited, increasing request delay"
        );
    }

    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimiterConfig {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            backoff_factor: 1.5,
            recovery_factor: 0.8,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_multiplies_delay() {
        let limiter = limiter();
        assert_eq!(limiter.current_delay().await, Duration::from_millis(1000));

        limiter.record_rate_limited().await;
        assert_eq!(limiter.current_delay().await, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_delay_capped_at_max() {
        let limiter = limiter();
        for _ in 0..20 {
            limiter.record_rate_limited().await;
        }
        assert_eq!(limiter.current_delay().await, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_successes_converge_to_min() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.record_rate_limited().await;
        }
        assert!(limiter.current_delay().await > Duration::from_millis(1000));

        for _ in 0..20 {
            limiter.record_success().await;
        }
        assert_eq!(limiter.current_delay().await, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spaces_calls() {
        let limiter = limiter();
        let start = Instant::now();

        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));

        limiter.record_rate_limited().await;
        let before = Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_not_blocked_by_waiting_caller() {
        let limiter = std::sync::Arc::new(limiter());
        limiter.acquire().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;

        let start = Instant::now();
        tokio::time::timeout(Duration::from_millis(10), limiter.record_rate_limited())
            .await
            .expect("record_rate_limited waited on a sleeping caller");
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(limiter.current_delay().await, Duration::from_millis(1500));

        waiter.await.unwrap();
        // The next claim is spaced by the raised delay
        let before = Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_millis(1500));
    }

    #[test]
    fn test_rejects_invalid_factors() {
        let bad = RateLimiterConfig {
            backoff_factor: 0.9,
            ..RateLimiterConfig::default()
        };
        assert!(AdaptiveRateLimiter::new(bad).is_err());

        let bad = RateLimiterConfig {
            recovery_factor: 1.0,
            ..RateLimiterConfig::default()
        };
        assert!(AdaptiveRateLimiter::new(bad).is_err());
    }
}

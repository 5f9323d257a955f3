//! Reconnect backoff with jitter

use rand::Rng;
use std::time::Duration;

const MAX_JITTER: Duration = Duration::from_secs(1);

/// Exponential reconnect delay: `min(cap, base * 2^attempt + jitter)`.
///
/// Jitter is drawn from `[0, min(base, 1s))`, which is smaller than the gap
/// between consecutive exponential steps, so successive delays never shrink.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    /// Delay for the current attempt, then advance the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;

        let exponential = base_ms.saturating_mul(1u64 << self.attempt.min(20));
        let jitter_bound = self.base.min(MAX_JITTER).as_millis() as u64;
        let jitter = if jitter_bound > 0 {
            rand::thread_rng().gen_range(0..jitter_bound)
        } else {
            0
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(exponential.saturating_add(jitter).min(cap_ms))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_non_decreasing_and_capped() {
        let cap = Duration::from_secs(30);
        let mut backoff = Backoff::new(Duration::from_secs(1), cap);

        let delays: Vec<Duration> = (0..12).map(|_| backoff.next_delay()).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= cap));
        assert_eq!(*delays.last().unwrap(), cap);
    }

    #[test]
    fn test_first_delay_within_jitter_of_base() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(500));
        assert!(first < Duration::from_millis(1000));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() < Duration::from_secs(2));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}

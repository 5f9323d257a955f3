//! Prometheus metrics for the feed
//!
//! Metrics live in an owned registry so several services (or tests) in one
//! process never collide.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{FeedError, Result};

pub struct FeedMetrics {
    registry: Registry,
    pub frames_received: IntCounter,
    pub frames_dropped: IntCounter,
    pub events_applied: IntCounter,
    pub crossed_rejections: IntCounter,
    pub reconnects: IntCounter,
    pub rate_limit_cooldowns: IntCounter,
    pub persistence_failures: IntCounter,
    pub persistence_dropped: IntCounter,
    pub connection_generation: IntGauge,
    pub live: IntGauge,
}

impl FeedMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("clob_feed".to_string()), None)?;

        let frames_received = IntCounter::new("frames_received_total", "Inbound frames read")?;
        let frames_dropped = IntCounter::new("frames_dropped_total", "Frames dropped as malformed")?;
        let events_applied = IntCounter::new("events_applied_total", "Events that changed a book")?;
        let crossed_rejections =
            IntCounter::new("crossed_rejections_total", "Updates rejected as crossing the book")?;
        let reconnects = IntCounter::new("reconnects_total", "Reconnect attempts after backoff")?;
        let rate_limit_cooldowns =
            IntCounter::new("rate_limit_cooldowns_total", "Rate-limit cooldowns entered")?;
        let persistence_failures = IntCounter::new(
            "persistence_failures_total",
            "Writes abandoned after exhausting retries",
        )?;
        let persistence_dropped = IntCounter::new(
            "persistence_dropped_total",
            "Writes dropped because the queue was saturated",
        )?;
        let connection_generation =
            IntGauge::new("connection_generation", "Current transport generation")?;
        let live = IntGauge::new("live", "1 while the feed is live")?;

        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(events_applied.clone()))?;
        registry.register(Box::new(crossed_rejections.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(rate_limit_cooldowns.clone()))?;
        registry.register(Box::new(persistence_failures.clone()))?;
        registry.register(Box::new(persistence_dropped.clone()))?;
        registry.register(Box::new(connection_generation.clone()))?;
        registry.register(Box::new(live.clone()))?;

        Ok(Self {
            registry,
            frames_received,
            frames_dropped,
            events_applied,
            crossed_rejections,
            reconnects,
            rate_limit_cooldowns,
            persistence_failures,
            persistence_dropped,
            connection_generation,
            live,
        })
    }

    /// Render in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| FeedError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_prefixed_names() {
        let metrics = FeedMetrics::new().unwrap();
        metrics.frames_received.inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("clob_feed_frames_received_total 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = FeedMetrics::new().unwrap();
        let b = FeedMetrics::new().unwrap();
        a.reconnects.inc();
        assert_eq!(b.reconnects.get(), 0);
    }
}

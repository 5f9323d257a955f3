//! Configuration module for the feed client

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FeedError, Result};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Instrument (asset) ids to subscribe to at startup
    pub asset_ids: Vec<String>,

    /// Discover instruments through the REST catalog at startup
    pub discover_catalog: bool,

    /// WebSocket endpoint for the market channel
    pub ws_endpoint: String,

    /// REST API endpoint for catalog discovery
    pub rest_endpoint: String,

    /// Ids per subscribe frame
    pub subscribe_batch_size: usize,

    /// Keep-alive settings
    pub heartbeat_interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub ping_payload: String,

    /// Reconnection settings
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub rate_limit_cooldown_secs: u64,

    /// Fan-out settings
    pub history_capacity: usize,
    pub push_channel_capacity: usize,

    /// Persistence settings
    pub persistence_path: Option<String>,
    pub persistence_queue_capacity: usize,
    pub persistence_handoff_timeout_ms: u64,
    pub persistence_workers: usize,
    pub persistence_max_attempts: u32,
    pub persistence_flush_interval_ms: u64,

    /// REST rate limiter settings
    pub rest_min_delay_ms: u64,
    pub rest_max_delay_ms: u64,
    pub rest_backoff_factor: f64,
    pub rest_recovery_factor: f64,

    /// Market expiry sweep interval in seconds
    pub expiry_sweep_interval_secs: u64,

    /// Overall shutdown deadline in seconds
    pub shutdown_timeout_secs: u64,

    /// Health check server port
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let asset_ids: Vec<String> = env::var("ASSET_IDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            asset_ids,
            discover_catalog: env_or("DISCOVER_CATALOG", defaults.discover_catalog),
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            subscribe_batch_size: env_or("SUBSCRIBE_BATCH_SIZE", defaults.subscribe_batch_size),
            heartbeat_interval_secs: env_or(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            ),
            liveness_timeout_secs: env_or("LIVENESS_TIMEOUT_SECS", defaults.liveness_timeout_secs),
            ping_payload: env::var("PING_PAYLOAD").unwrap_or(defaults.ping_payload),
            reconnect_base_delay_ms: env_or(
                "RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            ),
            reconnect_max_delay_ms: env_or("RECONNECT_MAX_DELAY_MS", defaults.reconnect_max_delay_ms),
            rate_limit_cooldown_secs: env_or(
                "RATE_LIMIT_COOLDOWN_SECS",
                defaults.rate_limit_cooldown_secs,
            ),
            history_capacity: env_or("HISTORY_CAPACITY", defaults.history_capacity),
            push_channel_capacity: env_or("PUSH_CHANNEL_CAPACITY", defaults.push_channel_capacity),
            persistence_path: env::var("PERSISTENCE_PATH").ok().filter(|p| !p.is_empty()),
            persistence_queue_capacity: env_or(
                "PERSISTENCE_QUEUE_CAPACITY",
                defaults.persistence_queue_capacity,
            ),
            persistence_handoff_timeout_ms: env_or(
                "PERSISTENCE_HANDOFF_TIMEOUT_MS",
                defaults.persistence_handoff_timeout_ms,
            ),
            persistence_workers: env_or("PERSISTENCE_WORKERS", defaults.persistence_workers),
            persistence_max_attempts: env_or(
                "PERSISTENCE_MAX_ATTEMPTS",
                defaults.persistence_max_attempts,
            ),
            persistence_flush_interval_ms: env_or(
                "PERSISTENCE_FLUSH_INTERVAL_MS",
                defaults.persistence_flush_interval_ms,
            ),
            rest_min_delay_ms: env_or("REST_MIN_DELAY_MS", defaults.rest_min_delay_ms),
            rest_max_delay_ms: env_or("REST_MAX_DELAY_MS", defaults.rest_max_delay_ms),
            rest_backoff_factor: env_or("REST_BACKOFF_FACTOR", defaults.rest_backoff_factor),
            rest_recovery_factor: env_or("REST_RECOVERY_FACTOR", defaults.rest_recovery_factor),
            expiry_sweep_interval_secs: env_or(
                "EXPIRY_SWEEP_INTERVAL_SECS",
                defaults.expiry_sweep_interval_secs,
            ),
            shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout_secs),
            health_port: env_or("HEALTH_PORT", defaults.health_port),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.subscribe_batch_size == 0 {
            return Err(FeedError::ConfigError(
                "SUBSCRIBE_BATCH_SIZE must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.liveness_timeout_secs == 0 {
            return Err(FeedError::ConfigError(
                "heartbeat interval and liveness timeout must be positive".to_string(),
            ));
        }
        if self.liveness_timeout_secs <= self.heartbeat_interval_secs {
            return Err(FeedError::ConfigError(format!(
                "LIVENESS_TIMEOUT_SECS ({}) must exceed HEARTBEAT_INTERVAL_SECS ({})",
                self.liveness_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.reconnect_base_delay_ms == 0
            || self.reconnect_max_delay_ms < self.reconnect_base_delay_ms
        {
            return Err(FeedError::ConfigError(format!(
                "invalid reconnect delays: base={}ms cap={}ms",
                self.reconnect_base_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        if self.history_capacity == 0 || self.push_channel_capacity == 0 {
            return Err(FeedError::ConfigError(
                "fan-out capacities must be positive".to_string(),
            ));
        }
        if self.persistence_queue_capacity == 0
            || self.persistence_workers == 0
            || self.persistence_max_attempts == 0
            || self.persistence_flush_interval_ms == 0
        {
            return Err(FeedError::ConfigError(
                "persistence queue, workers, attempts and flush interval must be positive"
                    .to_string(),
            ));
        }
        if self.rest_max_delay_ms < self.rest_min_delay_ms {
            return Err(FeedError::ConfigError(
                "REST_MAX_DELAY_MS must not be below REST_MIN_DELAY_MS".to_string(),
            ));
        }
        if self.rest_backoff_factor <= 1.0 {
            return Err(FeedError::ConfigError(
                "REST_BACKOFF_FACTOR must be greater than 1".to_string(),
            ));
        }
        if !(self.rest_recovery_factor > 0.0 && self.rest_recovery_factor < 1.0) {
            return Err(FeedError::ConfigError(
                "REST_RECOVERY_FACTOR must be within (0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn persistence_handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_handoff_timeout_ms)
    }

    pub fn persistence_flush_interval(&self) -> Duration {
        Duration::from_millis(self.persistence_flush_interval_ms)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            asset_ids: Vec::new(),
            discover_catalog: true,
            ws_endpoint: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            rest_endpoint: "https://clob.polymarket.com".to_string(),
            subscribe_batch_size: 100,
            heartbeat_interval_secs: 15,
            liveness_timeout_secs: 30,
            ping_payload: "PING".to_string(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            rate_limit_cooldown_secs: 60,
            history_capacity: 100,
            push_channel_capacity: 64,
            persistence_path: None,
            persistence_queue_capacity: 1024,
            persistence_handoff_timeout_ms: 50,
            persistence_workers: 1,
            persistence_max_attempts: 3,
            persistence_flush_interval_ms: 500,
            rest_min_delay_ms: 1000,
            rest_max_delay_ms: 5000,
            rest_backoff_factor: 1.5,
            rest_recovery_factor: 0.8,
            expiry_sweep_interval_secs: 60,
            shutdown_timeout_secs: 10,
            health_port: 9090,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.subscribe_batch_size, 100);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_bad_limiter_factors() {
        let config = Config {
            rest_backoff_factor: 1.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            rest_recovery_factor: 1.2,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch() {
        let config = Config {
            subscribe_batch_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(FeedError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_liveness_not_above_heartbeat() {
        let config = Config {
            heartbeat_interval_secs: 30,
            liveness_timeout_secs: 20,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(FeedError::ConfigError(_))));

        let config = Config {
            heartbeat_interval_secs: 20,
            liveness_timeout_secs: 20,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}

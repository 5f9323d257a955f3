//! CLOB Feed - Market Data Library
//!
//! This crate maintains a live top-of-book for prediction-market instruments
//! from a streaming WebSocket feed: connection lifecycle, subscription
//! management, event decoding, order-book state, persistence and delivery to
//! consumers.

use std::sync::Arc;
use tokio::sync::RwLock;

pub mod catalog;
pub mod config;
pub mod error;
pub mod fanout;
pub mod orderbook;
pub mod parser;
pub mod persistence;
pub mod rate_limiter;
pub mod service;
pub mod subscription;
pub mod telemetry;
pub mod websocket;

pub use catalog::{CatalogClient, CatalogRegistry, Instrument, Market};
pub use config::Config;
pub use error::{FeedError, Result};
pub use fanout::{EventRecord, UpdateFanout};
pub use orderbook::{OrderBookManager, OrderBookMetrics, TopOfBook, TopOfBookState};
pub use parser::{NormalizedEvent, ParsedMessage};
pub use persistence::{JsonFileSink, MemorySink, TopOfBookSink, TopOfBookUpdate};
pub use rate_limiter::AdaptiveRateLimiter;
pub use service::{FeedHandle, FeedService};
pub use subscription::SubscriptionRegistry;
pub use telemetry::FeedMetrics;
pub use websocket::{ConnectionManager, ConnectionState};

/// Application state shared across components
pub struct AppState {
    pub orderbook_manager: Arc<RwLock<OrderBookManager>>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub fanout: Arc<UpdateFanout>,
    pub catalog: Arc<CatalogRegistry>,
    pub metrics: Arc<FeedMetrics>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build empty state; seed ids from the config are added to the
    /// desired subscription set
    pub fn new(config: Config) -> Result<Self> {
        let subscriptions = SubscriptionRegistry::new(config.subscribe_batch_size);
        subscriptions.add(config.asset_ids.iter().cloned());

        Ok(Self {
            orderbook_manager: Arc::new(RwLock::new(OrderBookManager::new())),
            subscriptions: Arc::new(subscriptions),
            fanout: Arc::new(UpdateFanout::new(
                config.history_capacity,
                config.push_channel_capacity,
            )),
            catalog: Arc::new(CatalogRegistry::new()),
            metrics: Arc::new(FeedMetrics::new()?),
            config: Arc::new(config),
        })
    }
}

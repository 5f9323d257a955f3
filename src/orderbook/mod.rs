//! Order book module
//!
//! Maintains per-instrument top-of-book state from feed snapshots and deltas.

mod book;
mod manager;
mod metrics;

pub use book::{ApplyOutcome, TopOfBook};
pub use manager::OrderBookManager;
pub use metrics::OrderBookMetrics;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "buy", alias = "Buy")]
    Buy,
    #[serde(rename = "SELL", alias = "sell", alias = "Sell")]
    Sell,
}

/// A single price level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

/// A single level change carried by a delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelChange {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Top-of-book state handed to consumers and the persistence sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopOfBookState {
    pub instrument_id: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub tick_size: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
    pub metrics: OrderBookMetrics,
}

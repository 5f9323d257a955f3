//! Top-of-book metrics calculation

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Computed metrics for a top-of-book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Absolute spread (ask - bid)
    pub spread: Option<Decimal>,

    /// Spread in basis points of the mid
    pub spread_bps: Option<Decimal>,
}

impl OrderBookMetrics {
    pub fn from_quotes(bid: Option<Decimal>, ask: Option<Decimal>) -> Self {
        match (bid, ask) {
            (Some(bid), Some(ask)) => {
                let mid = (bid + ask) / Decimal::from(2);
                let spread = ask - bid;
                let spread_bps = if mid > Decimal::ZERO {
                    Some(spread / mid * Decimal::from(10000))
                } else {
                    None
                };
                Self {
                    mid_price: Some(mid),
                    spread: Some(spread),
                    spread_bps,
                }
            }
            _ => Self::default(),
        }
    }

    /// Both sides are known
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some() && self.spread.is_some()
    }
}

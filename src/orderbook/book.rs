//! Top-of-book merge for a single instrument
//!
//! Only the best bid and best ask are tracked. Depth below the top is never
//! reconstructed, so removing the best level leaves that side unknown until a
//! snapshot or a qualifying delta arrives.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{Level, LevelChange, OrderBookMetrics, Side, TopOfBookState};

/// Result of applying one event to a book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed and a notification should go out
    Updated,
    /// Event was valid but moved nothing
    Unchanged,
    /// Event would cross the book and was discarded
    Crossed { bid: Decimal, ask: Decimal },
}

/// Top-of-book for a single instrument
#[derive(Debug, Clone)]
pub struct TopOfBook {
    instrument_id: String,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    tick_size: Option<Decimal>,
    /// Local time of the last accepted mutation, never moves backwards
    updated_at: DateTime<Utc>,
}

impl TopOfBook {
    pub fn new(instrument_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            best_bid: None,
            best_ask: None,
            tick_size: None,
            updated_at: created_at,
        }
    }

    /// Replace both sides from a full snapshot.
    ///
    /// Levels are scanned for max/min rather than trusting wire ordering.
    /// Zero-size levels carry no liquidity and are skipped.
    pub fn apply_snapshot(
        &mut self,
        bids: &[Level],
        asks: &[Level],
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        let bid = bids
            .iter()
            .filter(|l| l.size > Decimal::ZERO)
            .map(|l| l.price)
            .max();
        let ask = asks
            .iter()
            .filter(|l| l.size > Decimal::ZERO)
            .map(|l| l.price)
            .min();

        if let Some(outcome) = crossed(bid, ask) {
            return outcome;
        }

        self.best_bid = bid;
        self.best_ask = ask;
        self.stamp(now);
        ApplyOutcome::Updated
    }

    /// Apply a batch of level changes as one unit.
    ///
    /// Either every change lands or, if the result would be crossed, none do.
    pub fn apply_delta(&mut self, changes: &[LevelChange], now: DateTime<Utc>) -> ApplyOutcome {
        let mut bid = self.best_bid;
        let mut ask = self.best_ask;

        for change in changes {
            match change.side {
                Side::Buy => bid = merge_level(bid, change, |price, best| price > best),
                Side::Sell => ask = merge_level(ask, change, |price, best| price < best),
            }
        }

        if let Some(outcome) = crossed(bid, ask) {
            return outcome;
        }

        if bid == self.best_bid && ask == self.best_ask {
            return ApplyOutcome::Unchanged;
        }

        self.best_bid = bid;
        self.best_ask = ask;
        self.stamp(now);
        ApplyOutcome::Updated
    }

    /// Record a new minimum tick size
    pub fn apply_tick_size(&mut self, new_tick: Decimal, now: DateTime<Utc>) -> ApplyOutcome {
        if self.tick_size == Some(new_tick) {
            return ApplyOutcome::Unchanged;
        }
        self.tick_size = Some(new_tick);
        self.stamp(now);
        ApplyOutcome::Updated
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.best_bid
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.best_ask
    }

    pub fn tick_size(&self) -> Option<Decimal> {
        self.tick_size
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Get current state for publishing
    pub fn state(&self) -> TopOfBookState {
        TopOfBookState {
            instrument_id: self.instrument_id.clone(),
            bid: self.best_bid,
            ask: self.best_ask,
            tick_size: self.tick_size,
            updated_at: self.updated_at,
            metrics: OrderBookMetrics::from_quotes(self.best_bid, self.best_ask),
        }
    }
}

/// Fold one change into the current best of its side.
///
/// `more_aggressive(price, best)` decides whether a resting level improves the best.
fn merge_level(
    best: Option<Decimal>,
    change: &LevelChange,
    more_aggressive: impl Fn(Decimal, Decimal) -> bool,
) -> Option<Decimal> {
    if change.size.is_zero() {
        return match best {
            Some(current) if current == change.price => None,
            other => other,
        };
    }

    match best {
        Some(current) if !more_aggressive(change.price, current) => Some(current),
        _ => Some(change.price),
    }
}

fn crossed(bid: Option<Decimal>, ask: Option<Decimal>) -> Option<ApplyOutcome> {
    match (bid, ask) {
        (Some(bid), Some(ask)) if bid >= ask => Some(ApplyOutcome::Crossed { bid, ask }),
        _ => None,
    }
}

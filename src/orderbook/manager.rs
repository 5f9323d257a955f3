//! Order book manager
//!
//! Routes normalized events to the per-instrument top-of-book.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::warn;

use super::{ApplyOutcome, TopOfBook, TopOfBookState};
use crate::parser::NormalizedEvent;

/// Manages top-of-book state for multiple instruments
#[derive(Debug, Default)]
pub struct OrderBookManager {
    books: HashMap<String, TopOfBook>,
}

impl OrderBookManager {
    /// Create a new order book manager
    pub fn new() -> Self {
        Self {
            books: HashMap::new(),
        }
    }

    /// Apply an event, creating the book on first sight of the instrument.
    ///
    /// Crossed updates are logged and leave the prior state in place.
    pub fn apply(&mut self, event: &NormalizedEvent, now: DateTime<Utc>) -> ApplyOutcome {
        let instrument_id = event.instrument_id();
        let book = self
            .books
            .entry(instrument_id.to_string())
            .or_insert_with(|| TopOfBook::new(instrument_id, now));

        let outcome = match event {
            NormalizedEvent::Snapshot { bids, asks, .. } => book.apply_snapshot(bids, asks, now),
            NormalizedEvent::Delta { changes, .. } => book.apply_delta(changes, now),
            NormalizedEvent::TickSizeChange { new, .. } => book.apply_tick_size(*new, now),
        };

        if let ApplyOutcome::Crossed { bid, ask } = outcome {
            warn!(
                instrument_id = %instrument_id,
                event = event.kind(),
                rejected_bid = %bid,
                rejected_ask = %ask,
                current_bid = ?book.best_bid(),
                current_ask = ?book.best_ask(),
                "Rejected update that would cross the book"
            );
        }

        outcome
    }

    /// Get the state of a specific book
    pub fn get_state(&self, instrument_id: &str) -> Option<TopOfBookState> {
        self.books.get(instrument_id).map(|book| book.state())
    }

    /// Drop an instrument's book, returning whether it existed
    pub fn remove(&mut self, instrument_id: &str) -> bool {
        self.books.remove(instrument_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{Level, LevelChange, Side};
    use rust_decimal_macros::dec;

    fn snapshot(id: &str) -> NormalizedEvent {
        NormalizedEvent::Snapshot {
            instrument_id: id.to_string(),
            market: None,
            timestamp: None,
            bids: vec![Level {
                price: dec!(0.40),
                size: dec!(10),
            }],
            asks: vec![Level {
                price: dec!(0.60),
                size: dec!(10),
            }],
        }
    }

    #[test]
    fn test_books_are_independent() {
        let mut manager = OrderBookManager::new();
        manager.apply(&snapshot("a"), Utc::now());
        manager.apply(&snapshot("b"), Utc::now());

        let delta = NormalizedEvent::Delta {
            instrument_id: "a".to_string(),
            market: None,
            timestamp: None,
            changes: vec![LevelChange {
                side: Side::Buy,
                price: dec!(0.45),
                size: dec!(1),
            }],
        };
        assert_eq!(manager.apply(&delta, Utc::now()), ApplyOutcome::Updated);

        assert_eq!(manager.get_state("a").unwrap().bid, Some(dec!(0.45)));
        assert_eq!(manager.get_state("b").unwrap().bid, Some(dec!(0.40)));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_crossed_update_keeps_state() {
        let mut manager = OrderBookManager::new();
        manager.apply(&snapshot("a"), Utc::now());

        let delta = NormalizedEvent::Delta {
            instrument_id: "a".to_string(),
            market: None,
            timestamp: None,
            changes: vec![LevelChange {
                side: Side::Sell,
                price: dec!(0.35),
                size: dec!(1),
            }],
        };
        assert!(matches!(
            manager.apply(&delta, Utc::now()),
            ApplyOutcome::Crossed { .. }
        ));
        let state = manager.get_state("a").unwrap();
        assert_eq!(state.bid, Some(dec!(0.40)));
        assert_eq!(state.ask, Some(dec!(0.60)));
    }

    #[test]
    fn test_remove_instrument() {
        let mut manager = OrderBookManager::new();
        manager.apply(&snapshot("a"), Utc::now());
        assert!(manager.remove("a"));
        assert!(manager.get_state("a").is_none());
        assert!(!manager.remove("a"));
    }
}

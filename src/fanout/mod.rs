//! Fan-out module for consumer delivery
//!
//! Keeps a bounded per-instrument history for polling consumers and a
//! broadcast channel per instrument for streaming consumers. Publishing never
//! waits on a subscriber: a receiver that falls behind loses the oldest events.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tracing::debug;

use crate::orderbook::TopOfBookState;
use crate::parser::NormalizedEvent;

/// One delivered event with the top-of-book it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub instrument_id: String,
    pub received_at: DateTime<Utc>,
    pub event: NormalizedEvent,
    /// State after the event; `None` when the event was rejected
    pub top_of_book: Option<TopOfBookState>,
}

struct InstrumentFeed {
    history: VecDeque<EventRecord>,
    sender: broadcast::Sender<EventRecord>,
}

impl InstrumentFeed {
    fn new(history_capacity: usize, channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            history: VecDeque::with_capacity(history_capacity),
            sender,
        }
    }
}

/// Per-instrument history and push channels
pub struct UpdateFanout {
    history_capacity: usize,
    channel_capacity: usize,
    feeds: RwLock<HashMap<String, InstrumentFeed>>,
}

impl UpdateFanout {
    pub fn new(history_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            history_capacity: history_capacity.max(1),
            channel_capacity: channel_capacity.max(1),
            feeds: RwLock::new(HashMap::new()),
        }
    }

    /// Append to history and push to live subscribers
    pub fn publish(&self, record: EventRecord) {
        let mut feeds = self.feeds.write();
        let feed = feeds
            .entry(record.instrument_id.clone())
            .or_insert_with(|| InstrumentFeed::new(self.history_capacity, self.channel_capacity));

        if feed.history.len() == self.history_capacity {
            feed.history.pop_front();
        }
        feed.history.push_back(record.clone());

        // No receivers is the common case for polled instruments
        if feed.sender.send(record).is_err() {
            debug!("No live subscribers for instrument");
        }
    }

    /// Live receiver for an instrument; lagging receivers see `RecvError::Lagged`
    pub fn subscribe(&self, instrument_id: &str) -> broadcast::Receiver<EventRecord> {
        let mut feeds = self.feeds.write();
        feeds
            .entry(instrument_id.to_string())
            .or_insert_with(|| InstrumentFeed::new(self.history_capacity, self.channel_capacity))
            .sender
            .subscribe()
    }

    /// Most recent `limit` events, oldest first
    pub fn recent_events(&self, instrument_id: &str, limit: usize) -> Vec<EventRecord> {
        let feeds = self.feeds.read();
        match feeds.get(instrument_id) {
            Some(feed) => {
                let skip = feed.history.len().saturating_sub(limit);
                feed.history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Forget an instrument; open receivers observe `RecvError::Closed`
    pub fn remove(&self, instrument_id: &str) -> bool {
        self.feeds.write().remove(instrument_id).is_some()
    }

    pub fn subscriber_count(&self, instrument_id: &str) -> usize {
        self.feeds
            .read()
            .get(instrument_id)
            .map(|feed| feed.sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{LevelChange, Side};
    use rust_decimal::Decimal;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn record(id: &str, price: i64) -> EventRecord {
        EventRecord {
            instrument_id: id.to_string(),
            received_at: Utc::now(),
            event: NormalizedEvent::Delta {
                instrument_id: id.to_string(),
                market: None,
                timestamp: None,
                changes: vec![LevelChange {
                    side: Side::Buy,
                    price: Decimal::new(price, 2),
                    size: Decimal::ONE,
                }],
            },
            top_of_book: None,
        }
    }

    fn price_of(record: &EventRecord) -> Decimal {
        match &record.event {
            NormalizedEvent::Delta { changes, .. } => changes[0].price,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let fanout = UpdateFanout::new(3, 8);
        for p in 1..=5 {
            fanout.publish(record("a", p));
        }

        let recent = fanout.recent_events("a", 10);
        let prices: Vec<Decimal> = recent.iter().map(price_of).collect();
        assert_eq!(
            prices,
            vec![Decimal::new(3, 2), Decimal::new(4, 2), Decimal::new(5, 2)]
        );

        let last_two = fanout.recent_events("a", 2);
        assert_eq!(price_of(&last_two[0]), Decimal::new(4, 2));
        assert_eq!(price_of(&last_two[1]), Decimal::new(5, 2));
        assert!(fanout.recent_events("missing", 5).is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let fanout = UpdateFanout::new(10, 8);
        let mut rx = fanout.subscribe("a");
        fanout.publish(record("a", 1));
        fanout.publish(record("b", 2));
        fanout.publish(record("a", 3));

        assert_eq!(price_of(&rx.recv().await.unwrap()), Decimal::new(1, 2));
        assert_eq!(price_of(&rx.recv().await.unwrap()), Decimal::new(3, 2));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking() {
        let fanout = UpdateFanout::new(100, 2);
        let mut rx = fanout.subscribe("a");
        for p in 1..=10 {
            fanout.publish(record("a", p));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
        assert_eq!(price_of(&rx.recv().await.unwrap()), Decimal::new(9, 2));
        assert_eq!(fanout.recent_events("a", 100).len(), 10);
    }

    #[tokio::test]
    async fn test_remove_closes_receivers() {
        let fanout = UpdateFanout::new(10, 4);
        let mut rx = fanout.subscribe("a");
        assert_eq!(fanout.subscriber_count("a"), 1);
        assert!(fanout.remove("a"));
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }
}

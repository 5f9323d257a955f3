//! Persistence of top-of-book state
//!
//! The feed carries no sequence numbers, so sinks resolve conflicting writes
//! by local timestamp: a row is only replaced by an update with an equal or
//! newer `updated_at`. The in-memory store stays authoritative whatever the
//! sink does.

mod file;
mod memory;
mod worker;

pub use file::JsonFileSink;
pub use memory::MemorySink;
pub use worker::{PersistenceQueue, PersistenceWorkers};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::{Instrument, Market};
use crate::error::Result;
use crate::orderbook::TopOfBookState;

/// Top-of-book write handed to a sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopOfBookUpdate {
    pub instrument_id: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TopOfBookState> for TopOfBookUpdate {
    fn from(state: &TopOfBookState) -> Self {
        Self {
            instrument_id: state.instrument_id.clone(),
            bid: state.bid,
            ask: state.ask,
            updated_at: state.updated_at,
        }
    }
}

/// Persisted instrument row: `instrument(id, market_id, name, bid, ask)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRow {
    pub id: String,
    pub market_id: Option<String>,
    pub name: Option<String>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InstrumentRow {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            market_id: None,
            name: None,
            bid: None,
            ask: None,
            updated_at: None,
        }
    }

    /// Apply a quote write unless the row already holds a newer one
    fn apply_quote(&mut self, update: &TopOfBookUpdate) -> bool {
        if self.updated_at.is_some_and(|current| current > update.updated_at) {
            return false;
        }
        self.bid = update.bid;
        self.ask = update.ask;
        self.updated_at = Some(update.updated_at);
        true
    }

    fn apply_instrument(&mut self, instrument: &Instrument) {
        self.market_id = Some(instrument.market_id.clone());
        self.name = Some(instrument.name.clone());
    }
}

/// Durable storage for markets and top-of-book quotes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopOfBookSink: Send + Sync {
    /// Insert or replace a market and its instruments' static fields
    async fn upsert_market(&self, market: &Market, instruments: &[Instrument]) -> Result<()>;

    /// Idempotent last-write-wins quote upsert
    async fn upsert_top_of_book(&self, update: &TopOfBookUpdate) -> Result<()>;

    /// Push out writes the sink has buffered
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

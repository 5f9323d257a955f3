//! In-process sink

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{InstrumentRow, TopOfBookSink, TopOfBookUpdate};
use crate::catalog::{Instrument, Market};
use crate::error::Result;

/// Sink holding both tables in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    markets: RwLock<HashMap<String, Market>>,
    instruments: RwLock<HashMap<String, InstrumentRow>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn market(&self, id: &str) -> Option<Market> {
        self.markets.read().get(id).cloned()
    }

    pub fn instrument(&self, id: &str) -> Option<InstrumentRow> {
        self.instruments.read().get(id).cloned()
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.read().len()
    }
}

#[async_trait]
impl TopOfBookSink for MemorySink {
    async fn upsert_market(&self, market: &Market, instruments: &[Instrument]) -> Result<()> {
        self.markets.write().insert(market.id.clone(), market.clone());
        let mut rows = self.instruments.write();
        for instrument in instruments {
            rows.entry(instrument.id.clone())
                .or_insert_with(|| InstrumentRow::empty(&instrument.id))
                .apply_instrument(instrument);
        }
        Ok(())
    }

    async fn upsert_top_of_book(&self, update: &TopOfBookUpdate) -> Result<()> {
        self.instruments
            .write()
            .entry(update.instrument_id.clone())
            .or_insert_with(|| InstrumentRow::empty(&update.instrument_id))
            .apply_quote(update);
        Ok(())
    }
}

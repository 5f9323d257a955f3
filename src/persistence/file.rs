//! JSON file sink
//!
//! Both tables are kept in memory and the whole document is rewritten
//! through a temp file and rename, so a crash leaves either the old or the
//! new document on disk, never a torn one. Quote writes arriving within
//! `flush_interval` of the previous write only mark the document dirty; the
//! persistence workers flush it on a timer and at shutdown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{InstrumentRow, TopOfBookSink, TopOfBookUpdate};
use crate::catalog::{Instrument, Market};
use crate::error::{FeedError, Result};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    market: BTreeMap<String, Market>,
    instrument: BTreeMap<String, InstrumentRow>,
}

#[derive(Debug)]
struct Store {
    document: Document,
    dirty: bool,
    last_write: Option<Instant>,
}

/// Sink persisting `market` and `instrument` tables to one JSON file
pub struct JsonFileSink {
    path: PathBuf,
    flush_interval: Duration,
    store: Mutex<Store>,
}

impl JsonFileSink {
    /// Open the sink, loading an existing document if present
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let document: Document = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                FeedError::PersistenceError(format!("corrupt store {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            markets = document.market.len(),
            instruments = document.instrument.len(),
            "Opened JSON store"
        );

        Ok(Self {
            path,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            store: Mutex::new(Store {
                document,
                dirty: false,
                last_write: None,
            }),
        })
    }

    /// Minimum spacing between quote-driven rewrites
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub async fn instrument(&self, id: &str) -> Option<InstrumentRow> {
        self.store.lock().await.document.instrument.get(id).cloned()
    }

    pub async fn market(&self, id: &str) -> Option<Market> {
        self.store.lock().await.document.market.get(id).cloned()
    }

    /// Whether accepted writes are waiting for a flush
    pub async fn is_dirty(&self) -> bool {
        self.store.lock().await.dirty
    }

    async fn write_store(&self, store: &mut Store) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&store.document)
            .map_err(|e| FeedError::SerializationError(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        store.dirty = false;
        store.last_write = Some(Instant::now());
        debug!(path = %self.path.display(), bytes = bytes.len(), "JSON store written");
        Ok(())
    }
}

#[async_trait]
impl TopOfBookSink for JsonFileSink {
    async fn upsert_market(&self, market: &Market, instruments: &[Instrument]) -> Result<()> {
        let mut store = self.store.lock().await;
        store.document.market.insert(market.id.clone(), market.clone());
        for instrument in instruments {
            store
                .document
                .instrument
                .entry(instrument.id.clone())
                .or_insert_with(|| InstrumentRow::empty(&instrument.id))
                .apply_instrument(instrument);
        }
        self.write_store(&mut store).await
    }

    async fn upsert_top_of_book(&self, update: &TopOfBookUpdate) -> Result<()> {
        let mut store = self.store.lock().await;
        let changed = store
            .document
            .instrument
            .entry(update.instrument_id.clone())
            .or_insert_with(|| InstrumentRow::empty(&update.instrument_id))
            .apply_quote(update);
        if !changed {
            debug!(instrument_id = %update.instrument_id, "Skipping stale quote write");
            return Ok(());
        }

        store.dirty = true;
        let due = store
            .last_write
            .map_or(true, |last| last.elapsed() >= self.flush_interval);
        if due {
            self.write_store(&mut store).await
        } else {
            Ok(())
        }
    }

    async fn flush(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        if !store.dirty {
            return Ok(());
        }
        self.write_store(&mut store).await
    }
}

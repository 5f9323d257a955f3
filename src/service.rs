//! Feed service wiring and the consumer-facing handle
//!
//! `FeedService` starts the connection manager, the persistence workers and
//! the market expiry sweep, and tears them down in one bounded sequence.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, Result};
use crate::fanout::EventRecord;
use crate::orderbook::TopOfBookState;
use crate::persistence::{PersistenceWorkers, TopOfBookSink};
use crate::telemetry::FeedMetrics;
use crate::websocket::{ConnectionManager, ConnectionState, Control};
use crate::AppState;

/// Cloneable query and subscription surface for consumers
#[derive(Clone)]
pub struct FeedHandle {
    state: Arc<AppState>,
    control: mpsc::Sender<Control>,
    connection: watch::Receiver<ConnectionState>,
    persistence_degraded: Arc<AtomicBool>,
}

impl FeedHandle {
    /// Current best bid/ask for an instrument
    pub async fn top_of_book(&self, instrument_id: &str) -> Option<TopOfBookState> {
        self.state.orderbook_manager.read().await.get_state(instrument_id)
    }

    /// Add an instrument to the desired set and return a live receiver.
    ///
    /// While the feed is live the new id is subscribed on the current
    /// connection; otherwise the next connect includes it and the queued
    /// command is discarded. Never waits on the connection manager.
    pub async fn subscribe(&self, instrument_id: &str) -> broadcast::Receiver<EventRecord> {
        let receiver = self.state.fanout.subscribe(instrument_id);
        let added = self.state.subscriptions.add([instrument_id]);
        if added.is_empty() {
            return receiver;
        }

        match self.control.try_send(Control::Subscribe(added)) {
            Ok(()) => {}
            // The desired set already holds the id, so the next full resend covers it
            Err(TrySendError::Full(_)) => {
                debug!(instrument_id = %instrument_id, "Control channel full, deferring to next resend");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(instrument_id = %instrument_id, "Connection manager stopped, subscribe not sent");
            }
        }
        receiver
    }

    /// Remove instruments from the desired set and drop their state.
    ///
    /// Returns the ids that were subscribed.
    pub async fn unsubscribe<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = self.state.subscriptions.remove(ids);
        if removed.is_empty() {
            return removed;
        }

        let mut books = self.state.orderbook_manager.write().await;
        for id in &removed {
            books.remove(id);
            self.state.fanout.remove(id);
        }
        removed
    }

    /// Up to `limit` most recent events, oldest first
    pub fn recent_events(&self, instrument_id: &str, limit: usize) -> Vec<EventRecord> {
        self.state.fanout.recent_events(instrument_id, limit)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    /// Watch connection state transitions
    pub fn connection_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn persistence_degraded(&self) -> bool {
        self.persistence_degraded.load(Ordering::Relaxed)
    }

    /// Instruments with a book in the state store
    pub async fn book_count(&self) -> usize {
        self.state.orderbook_manager.read().await.len()
    }

    pub fn subscribed_count(&self) -> usize {
        self.state.subscriptions.len()
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.state.metrics
    }
}

/// Running feed and its background tasks
pub struct FeedService {
    state: Arc<AppState>,
    handle: FeedHandle,
    shutdown: CancellationToken,
    manager_task: JoinHandle<Result<()>>,
    sweep_task: JoinHandle<()>,
    workers: PersistenceWorkers,
}

impl FeedService {
    /// Start every background task against `sink`
    pub fn start(state: Arc<AppState>, sink: Arc<dyn TopOfBookSink>) -> Self {
        let config = state.config.clone();
        let shutdown = CancellationToken::new();

        let (queue, workers) = PersistenceWorkers::spawn(
            sink,
            config.persistence_queue_capacity,
            config.persistence_workers,
            config.persistence_max_attempts,
            config.persistence_handoff_timeout(),
            config.persistence_flush_interval(),
            state.metrics.clone(),
        );

        let manager = ConnectionManager::new(state.clone(), queue, shutdown.clone());
        let handle = FeedHandle {
            state: state.clone(),
            control: manager.control(),
            connection: manager.state_watch(),
            persistence_degraded: workers.degraded_flag(),
        };

        let manager_task = tokio::spawn(manager.run());
        let sweep_task = tokio::spawn(run_expiry_sweep(handle.clone(), shutdown.clone()));

        info!(
            instruments = state.subscriptions.len(),
            persistence_workers = config.persistence_workers,
            "Feed service started"
        );

        Self {
            state,
            handle,
            shutdown,
            manager_task,
            sweep_task,
            workers,
        }
    }

    pub fn handle(&self) -> FeedHandle {
        self.handle.clone()
    }

    /// Stop heartbeat and transport, halt reconnects, then drain persistence,
    /// all under the configured deadline. Tasks still running at the deadline
    /// are aborted.
    pub async fn shutdown(self) -> Result<()> {
        let deadline = Instant::now() + self.state.config.shutdown_timeout();
        info!(
            timeout_secs = self.state.config.shutdown_timeout_secs,
            "Shutting down feed service"
        );
        self.shutdown.cancel();

        let mut timed_out = false;

        let mut manager_task = self.manager_task;
        match timeout_at(deadline, &mut manager_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Connection manager failed"),
            Ok(Err(e)) => error!(error = %e, "Connection manager task panicked"),
            Err(_) => {
                warn!("Connection manager did not stop before deadline, aborting");
                manager_task.abort();
                timed_out = true;
            }
        }

        let mut sweep_task = self.sweep_task;
        if timeout_at(deadline, &mut sweep_task).await.is_err() {
            sweep_task.abort();
            timed_out = true;
        }

        // The manager owned the last queue sender, so workers now drain and exit
        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.workers.join(remaining).await.is_err() {
            timed_out = true;
        }

        if timed_out {
            return Err(FeedError::ShutdownTimeout);
        }
        info!("Feed service stopped");
        Ok(())
    }
}

/// Periodically drop instruments whose market has expired
async fn run_expiry_sweep(handle: FeedHandle, shutdown: CancellationToken) {
    let mut ticker = interval(handle.state.config.expiry_sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = handle.state.catalog.expire(Utc::now());
                if expired.is_empty() {
                    continue;
                }
                let removed = handle.unsubscribe(&expired).await;
                info!(
                    expired = expired.len(),
                    unsubscribed = removed.len(),
                    "Expired instruments removed"
                );
            }
        }
    }
    debug!("Expiry sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Instrument, Market};
    use crate::config::Config;
    use crate::parser::NormalizedEvent;
    use crate::persistence::MemorySink;
    use crate::websocket::CONTROL_CHANNEL_CAPACITY;
    use chrono::Duration as ChronoDuration;

    fn offline_config() -> Config {
        Config {
            // Nothing listens here; the manager stays in its reconnect loop
            ws_endpoint: "ws://127.0.0.1:9/ws/market".to_string(),
            asset_ids: vec!["t1".to_string()],
            expiry_sweep_interval_secs: 1,
            shutdown_timeout_secs: 5,
            ..Config::default()
        }
    }

    fn snapshot(id: &str) -> NormalizedEvent {
        NormalizedEvent::Snapshot {
            instrument_id: id.to_string(),
            market: None,
            timestamp: None,
            bids: vec![],
            asks: vec![],
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_state() {
        let state = Arc::new(AppState::new(offline_config()).unwrap());
        let service = FeedService::start(state.clone(), Arc::new(MemorySink::new()));
        let handle = service.handle();

        state
            .orderbook_manager
            .write()
            .await
            .apply(&snapshot("t1"), Utc::now());
        assert!(handle.top_of_book("t1").await.is_some());
        assert_eq!(handle.book_count().await, 1);

        let removed = handle.unsubscribe(["t1", "unknown"]).await;
        assert_eq!(removed, vec!["t1".to_string()]);
        assert!(handle.top_of_book("t1").await.is_none());
        assert_eq!(handle.book_count().await, 0);
        assert_eq!(handle.subscribed_count(), 0);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_while_offline_grows_desired_set() {
        let state = Arc::new(AppState::new(offline_config()).unwrap());
        let service = FeedService::start(state.clone(), Arc::new(MemorySink::new()));
        let handle = service.handle();

        let _rx = handle.subscribe("t2").await;
        assert!(state.subscriptions.contains("t2"));
        assert_eq!(state.fanout.subscriber_count("t2"), 1);
        assert!(!handle.connection_state().is_live());

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_subscribes_never_block() {
        let state = Arc::new(AppState::new(offline_config()).unwrap());
        let service = FeedService::start(state.clone(), Arc::new(MemorySink::new()));
        let handle = service.handle();

        let count = CONTROL_CHANNEL_CAPACITY * 2;
        let mut receivers = Vec::with_capacity(count);
        for i in 0..count {
            let id = format!("x{}", i);
            let rx = tokio::time::timeout(std::time::Duration::from_secs(1), handle.subscribe(&id))
                .await
                .expect("subscribe must not wait for a connection");
            receivers.push(rx);
        }

        assert_eq!(handle.subscribed_count(), count + 1);
        assert!(state.subscriptions.contains(&format!("x{}", count - 1)));
        assert!(!handle.connection_state().is_live());

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_expiry_sweep_unsubscribes() {
        let state = Arc::new(AppState::new(offline_config()).unwrap());
        state.catalog.upsert_market(
            Market {
                id: "m1".to_string(),
                title: "Expired question".to_string(),
                expiry: Some(Utc::now() - ChronoDuration::minutes(1)),
            },
            vec![Instrument {
                id: "t1".to_string(),
                market_id: "m1".to_string(),
                name: "Yes".to_string(),
            }],
        );

        let service = FeedService::start(state.clone(), Arc::new(MemorySink::new()));
        // The first tick fires immediately
        for _ in 0..50 {
            if !state.subscriptions.contains("t1") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!state.subscriptions.contains("t1"));
        assert_eq!(state.catalog.market_count(), 0);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_while_reconnecting() {
        let state = Arc::new(AppState::new(offline_config()).unwrap());
        let service = FeedService::start(state, Arc::new(MemorySink::new()));
        let started = std::time::Instant::now();
        service.shutdown().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}

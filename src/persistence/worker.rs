//! Bounded persistence queue and its workers
//!
//! The read loop hands updates over with a short timeout and drops them when
//! the queue stays full, so a slow sink can never stall ingestion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TopOfBookSink, TopOfBookUpdate};
use crate::error::{FeedError, Result};
use crate::telemetry::FeedMetrics;

/// Delay before the first retry; later retries wait proportionally longer
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Producer side of the persistence queue
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<TopOfBookUpdate>,
    handoff_timeout: Duration,
    metrics: Arc<FeedMetrics>,
}

impl PersistenceQueue {
    /// Hand an update to the workers, returning whether it was accepted
    pub async fn offer(&self, update: TopOfBookUpdate) -> bool {
        match self.tx.send_timeout(update, self.handoff_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(update)) => {
                self.metrics.persistence_dropped.inc();
                warn!(
                    instrument_id = %update.instrument_id,
                    timeout_ms = self.handoff_timeout.as_millis() as u64,
                    "Persistence queue saturated, dropping update"
                );
                false
            }
            Err(SendTimeoutError::Closed(update)) => {
                self.metrics.persistence_dropped.inc();
                warn!(
                    instrument_id = %update.instrument_id,
                    "Persistence queue closed, dropping update"
                );
                false
            }
        }
    }
}

/// Handles of the running workers and the periodic flusher
pub struct PersistenceWorkers {
    handles: Vec<JoinHandle<()>>,
    flusher: JoinHandle<()>,
    flusher_stop: CancellationToken,
    sink: Arc<dyn TopOfBookSink>,
    degraded: Arc<AtomicBool>,
    metrics: Arc<FeedMetrics>,
}

impl PersistenceWorkers {
    /// Start `workers` tasks draining a queue of `capacity` updates, plus a
    /// task flushing the sink every `flush_interval`
    pub fn spawn(
        sink: Arc<dyn TopOfBookSink>,
        capacity: usize,
        workers: usize,
        max_attempts: u32,
        handoff_timeout: Duration,
        flush_interval: Duration,
        metrics: Arc<FeedMetrics>,
    ) -> (PersistenceQueue, PersistenceWorkers) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let degraded = Arc::new(AtomicBool::new(false));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    sink: sink.clone(),
                    rx: rx.clone(),
                    max_attempts: max_attempts.max(1),
                    degraded: degraded.clone(),
                    metrics: metrics.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let flusher_stop = CancellationToken::new();
        let flusher = tokio::spawn(run_flusher(
            sink.clone(),
            flush_interval,
            flusher_stop.clone(),
            degraded.clone(),
            metrics.clone(),
        ));

        let queue = PersistenceQueue {
            tx,
            handoff_timeout,
            metrics: metrics.clone(),
        };
        let workers = PersistenceWorkers {
            handles,
            flusher,
            flusher_stop,
            sink,
            degraded,
            metrics,
        };
        (queue, workers)
    }

    pub fn degraded_flag(&self) -> Arc<AtomicBool> {
        self.degraded.clone()
    }

    /// Wait for workers to drain the queue, then flush the sink once more.
    ///
    /// Workers finish once every [`PersistenceQueue`] clone is dropped. Any
    /// worker still running at the deadline is aborted.
    pub async fn join(self, deadline: Duration) -> Result<()> {
        let mut handles = self.handles;
        let mut flusher = self.flusher;
        let sink = self.sink;
        let stop = self.flusher_stop;

        let drained = timeout(deadline, async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Persistence worker ended abnormally");
                }
            }
            stop.cancel();
            if let Err(e) = (&mut flusher).await {
                warn!(error = %e, "Persistence flusher ended abnormally");
            }
            sink.flush().await
        })
        .await;

        match drained {
            Ok(Ok(())) => {
                info!("Persistence workers drained");
                Ok(())
            }
            Ok(Err(e)) => {
                self.metrics.persistence_failures.inc();
                self.degraded.store(true, Ordering::Relaxed);
                warn!(error = %e, "Final persistence flush failed");
                Ok(())
            }
            Err(_) => {
                for handle in &handles {
                    handle.abort();
                }
                flusher.abort();
                warn!("Persistence workers aborted at shutdown deadline");
                Err(FeedError::ShutdownTimeout)
            }
        }
    }
}

/// Flush buffered sink writes every `period` until stopped
async fn run_flusher(
    sink: Arc<dyn TopOfBookSink>,
    period: Duration,
    stop: CancellationToken,
    degraded: Arc<AtomicBool>,
    metrics: Arc<FeedMetrics>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sink.flush().await {
                    metrics.persistence_failures.inc();
                    degraded.store(true, Ordering::Relaxed);
                    warn!(error = %e, "Periodic persistence flush failed");
                }
            }
        }
    }
    debug!("Persistence flusher stopped");
}

struct Worker {
    worker_id: usize,
    sink: Arc<dyn TopOfBookSink>,
    rx: Arc<Mutex<mpsc::Receiver<TopOfBookUpdate>>>,
    max_attempts: u32,
    degraded: Arc<AtomicBool>,
    metrics: Arc<FeedMetrics>,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = self.worker_id, "Persistence worker started");
        loop {
            let next = self.rx.lock().await.recv().await;
            match next {
                Some(update) => self.write(&update).await,
                None => break,
            }
        }
        debug!(worker_id = self.worker_id, "Persistence worker stopped");
    }

    async fn write(&self, update: &TopOfBookUpdate) {
        for attempt in 1..=self.max_attempts {
            match self.sink.upsert_top_of_book(update).await {
                Ok(()) => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        info!(instrument_id = %update.instrument_id, "Persistence recovered");
                    }
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    debug!(
                        instrument_id = %update.instrument_id,
                        attempt,
                        error = %e,
                        "Persistence write failed, retrying"
                    );
                    sleep(RETRY_BASE_DELAY * attempt).await;
                }
                Err(e) => {
                    self.metrics.persistence_failures.inc();
                    self.degraded.store(true, Ordering::Relaxed);
                    warn!(
                        instrument_id = %update.instrument_id,
                        attempts = attempt,
                        error = %e,
                        "Persistence degraded, write abandoned; in-memory state remains authoritative"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemorySink, MockTopOfBookSink};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn update(id: &str) -> TopOfBookUpdate {
        TopOfBookUpdate {
            instrument_id: id.to_string(),
            bid: Some(dec!(0.5)),
            ask: None,
            updated_at: Utc::now(),
        }
    }

    const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

    fn metrics() -> Arc<FeedMetrics> {
        Arc::new(FeedMetrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_updates_reach_sink_and_drain() {
        let sink = Arc::new(MemorySink::new());
        let (queue, workers) = PersistenceWorkers::spawn(
            sink.clone(),
            16,
            2,
            3,
            Duration::from_millis(50),
            FLUSH_INTERVAL,
            metrics(),
        );

        for id in ["a", "b", "c"] {
            assert!(queue.offer(update(id)).await);
        }
        drop(queue);

        workers.join(Duration::from_secs(5)).await.unwrap();
        assert_eq!(sink.instrument_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let mut mock = MockTopOfBookSink::new();
        let mut calls = 0;
        mock.expect_flush().returning(|| Ok(()));
        mock.expect_upsert_top_of_book()
            .times(3)
            .returning(move |_| {
                calls += 1;
                if calls < 3 {
                    Err(FeedError::PersistenceError("db down".to_string()))
                } else {
                    Ok(())
                }
            });

        let (queue, workers) = PersistenceWorkers::spawn(
            Arc::new(mock),
            4,
            1,
            3,
            Duration::from_millis(50),
            FLUSH_INTERVAL,
            metrics(),
        );
        assert!(queue.offer(update("a")).await);
        drop(queue);

        let degraded = workers.degraded_flag();
        workers.join(Duration::from_secs(5)).await.unwrap();
        assert!(!degraded.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_mark_degraded() {
        let mut mock = MockTopOfBookSink::new();
        mock.expect_flush().returning(|| Ok(()));
        mock.expect_upsert_top_of_book()
            .times(2)
            .returning(|_| Err(FeedError::PersistenceError("db down".to_string())));

        let metrics = metrics();
        let (queue, workers) = PersistenceWorkers::spawn(
            Arc::new(mock),
            4,
            1,
            2,
            Duration::from_millis(50),
            FLUSH_INTERVAL,
            metrics.clone(),
        );
        assert!(queue.offer(update("a")).await);
        drop(queue);

        let degraded = workers.degraded_flag();
        workers.join(Duration::from_secs(5)).await.unwrap();
        assert!(degraded.load(Ordering::Relaxed));
        assert_eq!(metrics.persistence_failures.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_timer_and_at_join() {
        let flushes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut mock = MockTopOfBookSink::new();
        let counter = flushes.clone();
        mock.expect_flush().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (queue, workers) = PersistenceWorkers::spawn(
            Arc::new(mock),
            4,
            1,
            1,
            Duration::from_millis(50),
            FLUSH_INTERVAL,
            metrics(),
        );

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 2);

        drop(queue);
        workers.join(Duration::from_secs(5)).await.unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_flush_marks_degraded() {
        let mut mock = MockTopOfBookSink::new();
        mock.expect_flush()
            .times(1)
            .returning(|| Err(FeedError::PersistenceError("disk full".to_string())));

        let metrics = metrics();
        let (queue, workers) = PersistenceWorkers::spawn(
            Arc::new(mock),
            4,
            1,
            1,
            Duration::from_millis(50),
            FLUSH_INTERVAL,
            metrics.clone(),
        );
        drop(queue);

        let degraded = workers.degraded_flag();
        workers.join(Duration::from_secs(5)).await.unwrap();
        assert!(degraded.load(Ordering::Relaxed));
        assert_eq!(metrics.persistence_failures.get(), 1);
    }

    struct StalledSink;

    #[async_trait::async_trait]
    impl TopOfBookSink for StalledSink {
        async fn upsert_market(
            &self,
            _market: &crate::catalog::Market,
            _instruments: &[crate::catalog::Instrument],
        ) -> Result<()> {
            Ok(())
        }

        async fn upsert_top_of_book(&self, _update: &TopOfBookUpdate) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_queue_drops_instead_of_blocking() {
        let metrics = metrics();
        let (queue, workers) = PersistenceWorkers::spawn(
            Arc::new(StalledSink),
            1,
            1,
            1,
            Duration::from_millis(10),
            FLUSH_INTERVAL,
            metrics.clone(),
        );

        // One update is held by the stalled worker and one fills the slot.
        assert!(queue.offer(update("a")).await);
        assert!(queue.offer(update("b")).await);
        assert!(!queue.offer(update("c")).await);
        assert_eq!(metrics.persistence_dropped.get(), 1);

        drop(queue);
        assert!(workers.join(Duration::from_millis(100)).await.is_err());
    }
}

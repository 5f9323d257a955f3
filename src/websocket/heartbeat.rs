//! Keep-alive and liveness tracking for one connection.
//!
//! The session loop records inbound activity; a timer task per connection
//! generation inspects it and asks the loop to ping or to give up. The task
//! never touches the socket itself.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Control;

const MIN_CHECK_PERIOD: Duration = Duration::from_millis(10);

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCheck {
    Healthy,
    SendPing,
    Expired,
}

#[derive(Debug)]
struct Timers {
    last_inbound: Instant,
    last_ping: Option<Instant>,
}

/// Heartbeat state shared between the session loop and its timer task
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    timers: Mutex<Timers>,
}

impl Heartbeat {
    /// `interval` is the idle time before a ping, `timeout` the silence
    /// after which the connection is considered dead
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            timers: Mutex::new(Timers {
                last_inbound: Instant::now(),
                last_ping: None,
            }),
        }
    }

    /// Restart timers for a fresh connection
    pub fn reset(&self) {
        let mut timers = self.timers.lock();
        timers.last_inbound = Instant::now();
        timers.last_ping = None;
    }

    /// Any inbound frame counts as a liveness signal
    pub fn record_inbound(&self) {
        self.timers.lock().last_inbound = Instant::now();
    }

    pub fn record_ping(&self) {
        self.timers.lock().last_ping = Some(Instant::now());
    }

    /// Time since the last liveness signal
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timers.lock().last_inbound)
    }

    pub fn check(&self, now: Instant) -> HeartbeatCheck {
        let timers = self.timers.lock();
        if now.saturating_duration_since(timers.last_inbound) >= self.timeout {
            return HeartbeatCheck::Expired;
        }

        let last_activity = match timers.last_ping {
            Some(ping) => ping.max(timers.last_inbound),
            None => timers.last_inbound,
        };
        if now.saturating_duration_since(last_activity) >= self.interval {
            HeartbeatCheck::SendPing
        } else {
            HeartbeatCheck::Healthy
        }
    }

    fn check_period(&self) -> Duration {
        (self.interval.min(self.timeout) / 2).max(MIN_CHECK_PERIOD)
    }

    /// Spawn the timer task for one connection generation.
    ///
    /// The task ends when `token` is cancelled, when it reports expiry, or
    /// when the session loop stops listening.
    pub fn spawn(
        self: Arc<Self>,
        generation: u64,
        control: mpsc::Sender<Control>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let heartbeat = self;
        tokio::spawn(async move {
            let period = heartbeat.check_period();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let command = match heartbeat.check(Instant::now()) {
                            HeartbeatCheck::Healthy => continue,
                            HeartbeatCheck::SendPing => Control::Ping { generation },
                            HeartbeatCheck::Expired => Control::Expire { generation },
                        };
                        let expired = matches!(command, Control::Expire { .. });
                        match control.try_send(command) {
                            Ok(()) if expired => break,
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                debug!(generation, "Control channel full, retrying on next tick");
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
            debug!(generation, "Heartbeat task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ping_when_idle_then_expire() {
        let hb = Heartbeat::new(Duration::from_secs(15), Duration::from_secs(30));
        let start = Instant::now();

        assert_eq!(hb.check(start + Duration::from_secs(5)), HeartbeatCheck::Healthy);
        assert_eq!(hb.check(start + Duration::from_secs(15)), HeartbeatCheck::SendPing);

        tokio::time::advance(Duration::from_secs(15)).await;
        hb.record_ping();
        assert_eq!(hb.check(Instant::now()), HeartbeatCheck::Healthy);
        assert_eq!(hb.check(start + Duration::from_secs(30)), HeartbeatCheck::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_resets_idle() {
        let hb = Heartbeat::new(Duration::from_secs(15), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(hb.check(Instant::now()), HeartbeatCheck::SendPing);

        hb.record_inbound();
        assert_eq!(hb.idle(Instant::now()), Duration::ZERO);
        assert_eq!(hb.check(Instant::now()), HeartbeatCheck::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_sends_generation_tagged_commands() {
        let hb = Arc::new(Heartbeat::new(Duration::from_secs(15), Duration::from_secs(30)));
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let task = hb.clone().spawn(7, tx, token.clone());

        assert_eq!(rx.recv().await, Some(Control::Ping { generation: 7 }));
        hb.record_ping();
        assert_eq!(rx.recv().await, Some(Control::Expire { generation: 7 }));

        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_on_cancel() {
        let hb = Arc::new(Heartbeat::new(Duration::from_secs(15), Duration::from_secs(30)));
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let task = hb.spawn(1, tx, token.clone());

        token.cancel();
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }
}

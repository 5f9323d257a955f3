//! WebSocket connection manager
//!
//! Owns one connection generation at a time and handles the subscribe,
//! read, dispatch and reconnect cycle.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Backoff, ConnectionState, Control, DisconnectReason, Heartbeat, Inbound, WebSocketClient,
};
use crate::error::Result;
use crate::fanout::EventRecord;
use crate::orderbook::ApplyOutcome;
use crate::parser::{payload_prefix, ParsedMessage};
use crate::persistence::{PersistenceQueue, TopOfBookUpdate};
use crate::AppState;

pub const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// Manages the market channel connection with automatic reconnection
pub struct ConnectionManager {
    state: Arc<AppState>,
    persistence: PersistenceQueue,
    heartbeat: Arc<Heartbeat>,
    backoff: Backoff,
    generation: u64,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        state: Arc<AppState>,
        persistence: PersistenceQueue,
        shutdown: CancellationToken,
    ) -> Self {
        let config = &state.config;
        let heartbeat = Arc::new(Heartbeat::new(
            config.heartbeat_interval(),
            config.liveness_timeout(),
        ));
        let backoff = Backoff::new(config.reconnect_base_delay(), config.reconnect_max_delay());
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            state,
            persistence,
            heartbeat,
            backoff,
            generation: 0,
            control_tx,
            control_rx,
            state_tx,
            shutdown,
        }
    }

    /// Sender for runtime commands (incremental subscribes)
    pub fn control(&self) -> mpsc::Sender<Control> {
        self.control_tx.clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Run until shutdown, reconnecting after every disconnect
    pub async fn run(mut self) -> Result<()> {
        info!(
            endpoint = %self.state.config.ws_endpoint,
            instruments = self.state.subscriptions.len(),
            "Starting connection manager"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.generation += 1;
            let generation = self.generation;
            self.state.metrics.connection_generation.set(generation as i64);

            let reason = self.connect_and_process(generation).await;
            self.state.metrics.live.set(0);

            if reason == DisconnectReason::Shutdown || self.shutdown.is_cancelled() {
                break;
            }

            let wait = if reason.is_rate_limited() {
                let cooldown = self.state.config.rate_limit_cooldown();
                let until = Utc::now()
                    + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
                self.backoff.reset();
                self.state.metrics.rate_limit_cooldowns.inc();
                warn!(
                    generation,
                    reason = %reason,
                    cooldown_secs = cooldown.as_secs(),
                    until = %until,
                    "Rate limited by feed, cooling down before reconnect"
                );
                self.set_state(ConnectionState::RateLimited { until });
                cooldown
            } else {
                let delay = self.backoff.next_delay();
                let attempt = self.backoff.attempt();
                warn!(
                    generation,
                    reason = %reason,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost, reconnecting"
                );
                self.set_state(ConnectionState::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                delay
            };

            tokio::select! {
                () = sleep(wait) => {
                    self.state.metrics.reconnects.inc();
                }
                () = self.shutdown.cancelled() => {
                    info!("Shutdown requested during reconnect wait");
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(generations = self.generation, "Connection manager stopped");
        Ok(())
    }

    /// Connect, resend the full subscription set, then read until the
    /// connection ends
    async fn connect_and_process(&mut self, generation: u64) -> DisconnectReason {
        self.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            result = WebSocketClient::connect(&self.state.config.ws_endpoint) => result,
            () = self.shutdown.cancelled() => return DisconnectReason::Shutdown,
        };
        let mut client = match connected {
            Ok(client) => client,
            Err(e) => {
                debug!(generation, error = %e, "Connect failed");
                return e.into();
            }
        };

        self.set_state(ConnectionState::Subscribing);
        self.discard_pending_subscribes();
        if let Err(reason) = self.send_full_subscription(&mut client, generation).await {
            client.close().await;
            return reason;
        }

        self.heartbeat.reset();
        let heartbeat_token = self.shutdown.child_token();
        let heartbeat_task = Arc::clone(&self.heartbeat).spawn(
            generation,
            self.control_tx.clone(),
            heartbeat_token.clone(),
        );

        self.set_state(ConnectionState::Live);
        self.state.metrics.live.set(1);
        info!(generation, instruments = self.state.subscriptions.len(), "Feed live");

        let reason = self.read_loop(&mut client, generation).await;

        heartbeat_token.cancel();
        if let Err(e) = heartbeat_task.await {
            warn!(generation, error = %e, "Heartbeat task ended abnormally");
        }
        client.close().await;
        reason
    }

    async fn send_full_subscription(
        &self,
        client: &mut WebSocketClient,
        generation: u64,
    ) -> std::result::Result<(), DisconnectReason> {
        let frames = self
            .state
            .subscriptions
            .subscribe_frames()
            .map_err(DisconnectReason::from)?;
        let batches = frames.len();
        for frame in frames {
            client.send_text(frame).await.map_err(DisconnectReason::from)?;
        }
        info!(
            generation,
            instruments = self.state.subscriptions.len(),
            batches,
            "Subscription set sent"
        );
        Ok(())
    }

    /// Subscribes queued while offline are already covered by the full resend
    fn discard_pending_subscribes(&mut self) {
        while let Ok(command) = self.control_rx.try_recv() {
            debug!(command = ?command, "Discarding command queued before connect");
        }
    }

    async fn read_loop(&mut self, client: &mut WebSocketClient, generation: u64) -> DisconnectReason {
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    info!(generation, "Shutdown signal received in read loop");
                    return DisconnectReason::Shutdown;
                }

                Some(command) = self.control_rx.recv() => {
                    if let Err(reason) = self.handle_control(client, generation, command).await {
                        return reason;
                    }
                }

                inbound = client.recv() => match inbound {
                    Inbound::Text(text) => {
                        self.record_inbound();
                        self.state.metrics.frames_received.inc();
                        self.dispatch(&text).await;
                    }
                    Inbound::Liveness => self.record_inbound(),
                    Inbound::Closed { code, reason } => {
                        return DisconnectReason::Closed { code, reason };
                    }
                    Inbound::Error(message) => return DisconnectReason::Error(message),
                    Inbound::Ended => return DisconnectReason::StreamEnded,
                },
            }
        }
    }

    async fn handle_control(
        &mut self,
        client: &mut WebSocketClient,
        generation: u64,
        command: Control,
    ) -> std::result::Result<(), DisconnectReason> {
        match command {
            Control::Ping { generation: g } if g == generation => {
                client
                    .send_text(self.state.config.ping_payload.clone())
                    .await
                    .map_err(DisconnectReason::from)?;
                self.heartbeat.record_ping();
                debug!(generation, "Sent keep-alive");
            }
            Control::Expire { generation: g } if g == generation => {
                let idle = self.heartbeat.idle(tokio::time::Instant::now());
                error!(
                    generation,
                    idle_ms = idle.as_millis() as u64,
                    "No liveness signal within timeout, closing connection"
                );
                return Err(DisconnectReason::HeartbeatTimeout);
            }
            Control::Ping { generation: g } | Control::Expire { generation: g } => {
                debug!(
                    stale_generation = g,
                    generation, "Ignoring heartbeat command from superseded connection"
                );
            }
            Control::Subscribe(ids) => {
                let frames = self.state.subscriptions.frames_for(&ids).map_err(DisconnectReason::from)?;
                for frame in frames {
                    client.send_text(frame).await.map_err(DisconnectReason::from)?;
                }
                info!(generation, added = ids.len(), "Incremental subscription sent");
            }
        }
        Ok(())
    }

    fn record_inbound(&mut self) {
        self.heartbeat.record_inbound();
        if self.backoff.attempt() > 0 {
            debug!(previous_attempts = self.backoff.attempt(), "Inbound traffic, resetting backoff");
            self.backoff.reset();
        }
    }

    /// Decode a frame and route its events through the state store
    async fn dispatch(&self, text: &str) {
        let events = match ParsedMessage::parse(text) {
            Ok(ParsedMessage::Pong) => {
                debug!("Received PONG");
                return;
            }
            Ok(ParsedMessage::Events(events)) => events,
            Err(e) => {
                self.state.metrics.frames_dropped.inc();
                warn!(error = %e, payload = %payload_prefix(text), "Dropping malformed frame");
                return;
            }
        };

        let received_at = Utc::now();
        for event in events {
            let instrument_id = event.instrument_id().to_string();

            // Membership is checked under the store lock so a concurrent
            // unsubscribe cannot be undone by an in-flight event
            let persisted = {
                let mut books = self.state.orderbook_manager.write().await;
                if !self.state.subscriptions.contains(&instrument_id) {
                    debug!(instrument_id = %instrument_id, "Dropping event for unsubscribed instrument");
                    continue;
                }

                let outcome = books.apply(&event, received_at);
                let top_of_book = match outcome {
                    ApplyOutcome::Updated => {
                        self.state.metrics.events_applied.inc();
                        books.get_state(&instrument_id)
                    }
                    ApplyOutcome::Unchanged => books.get_state(&instrument_id),
                    ApplyOutcome::Crossed { .. } => {
                        self.state.metrics.crossed_rejections.inc();
                        None
                    }
                };

                let persisted = match (&outcome, &top_of_book) {
                    (ApplyOutcome::Updated, Some(state)) => Some(TopOfBookUpdate::from(state)),
                    _ => None,
                };

                self.state.fanout.publish(EventRecord {
                    instrument_id,
                    received_at,
                    event,
                    top_of_book,
                });
                persisted
            };

            if let Some(update) = persisted {
                self.persistence.offer(update).await;
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "Connection state change");
            *current = next;
            true
        });
    }
}

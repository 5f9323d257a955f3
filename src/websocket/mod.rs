//! WebSocket module for the market channel connection

mod backoff;
mod client;
mod heartbeat;
mod manager;

pub use backoff::Backoff;
pub use client::{Inbound, WebSocketClient};
pub use heartbeat::{Heartbeat, HeartbeatCheck};
pub use manager::{ConnectionManager, CONTROL_CHANNEL_CAPACITY};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::FeedError;

/// Connection lifecycle as seen by consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Live,
    RateLimited { until: DateTime<Utc> },
    Reconnecting { attempt: u32, delay_ms: u64 },
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Live)
    }
}

/// Commands delivered to the session loop.
///
/// Heartbeat commands carry the generation of the connection they were
/// issued for and are ignored once that connection is superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Ping { generation: u64 },
    Expire { generation: u64 },
    Subscribe(Vec<String>),
}

const RATE_LIMIT_MARKERS: [&str; 3] = ["429", "rate limit", "too many requests"];

/// Why a connection generation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed { code: u16, reason: String },
    HandshakeRejected { status: u16 },
    Error(String),
    HeartbeatTimeout,
    StreamEnded,
    Shutdown,
}

impl DisconnectReason {
    /// Whether the server signalled a rate limit
    pub fn is_rate_limited(&self) -> bool {
        match self {
            DisconnectReason::HandshakeRejected { status } => *status == 429,
            DisconnectReason::Closed { reason, .. } => contains_rate_limit_marker(reason),
            DisconnectReason::Error(message) => contains_rate_limit_marker(message),
            _ => false,
        }
    }
}

fn contains_rate_limit_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
}

impl From<FeedError> for DisconnectReason {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::HandshakeRejected { status } => DisconnectReason::HandshakeRejected { status },
            other => DisconnectReason::Error(other.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed { code, reason } => {
                write!(f, "closed by server (code {}, reason {:?})", code, reason)
            }
            DisconnectReason::HandshakeRejected { status } => {
                write!(f, "handshake rejected with HTTP {}", status)
            }
            DisconnectReason::Error(message) => write!(f, "transport error: {}", message),
            DisconnectReason::HeartbeatTimeout => write!(f, "liveness timeout"),
            DisconnectReason::StreamEnded => write!(f, "stream ended"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

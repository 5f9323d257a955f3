//! Error types for the feed client

use thiserror::Error;

/// Feed client errors
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("WebSocket handshake rejected with HTTP {status}")]
    HandshakeRejected { status: u16 },

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("REST API rate limited: {0}")]
    RateLimited(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Shutdown deadline exceeded")]
    ShutdownTimeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => FeedError::HandshakeRejected {
                status: response.status().as_u16(),
            },
            other => FeedError::WebSocketConnection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        FeedError::PersistenceError(err.to_string())
    }
}

impl From<prometheus::Error> for FeedError {
    fn from(err: prometheus::Error) -> Self {
        FeedError::ConfigError(format!("metrics registration failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

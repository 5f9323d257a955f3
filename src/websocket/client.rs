//! WebSocket client for the market channel
//!
//! Handles connection, outbound text frames and message reception.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One inbound item as seen by the session loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text payload (binary frames are decoded lossily)
    Text(String),
    /// Protocol ping/pong: proves liveness, carries no data
    Liveness,
    Closed { code: u16, reason: String },
    Error(String),
    Ended,
}

/// WebSocket client for a single connection generation
pub struct WebSocketClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl WebSocketClient {
    /// Connect to the WebSocket endpoint.
    ///
    /// A non-101 handshake response surfaces as
    /// [`FeedError::HandshakeRejected`] with the HTTP status.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        info!(url = %endpoint, "Connecting to market channel");

        let (ws_stream, response) = connect_async(endpoint).await?;
        info!(status = ?response.status(), "WebSocket connected");

        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::WebSocketMessage(e.to_string()))
    }

    /// Receive the next inbound item. Cancel safe.
    pub async fn recv(&mut self) -> Inbound {
        match self.read.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Inbound::Text(text)
            }
            Some(Ok(Message::Binary(data))) => {
                Inbound::Text(String::from_utf8_lossy(&data).into_owned())
            }
            // tungstenite queues the pong reply to a ping on its own
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Inbound::Liveness,
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((u16::from(CloseCode::Status), String::new()));
                debug!(code, %reason, "WebSocket closed by server");
                Inbound::Closed { code, reason }
            }
            Some(Ok(Message::Frame(_))) => Inbound::Liveness,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read error");
                Inbound::Error(e.to_string())
            }
            None => {
                warn!("WebSocket stream ended");
                Inbound::Ended
            }
        }
    }

    /// Close the connection, ignoring errors from an already-dead socket
    pub async fn close(mut self) {
        if let Err(e) = self.write.send(Message::Close(None)).await {
            debug!(error = %e, "Close frame not sent");
        }
        let _ = self.write.close().await;
    }
}

//! WebSocket transport
//!
//! The engine never touches a socket directly. A [`Connector`] opens a
//! session and hands back a [`TransportLink`]: an ordered, lossless pair of
//! channels to a pump task that owns the socket. Optimized for:
//! - Disabled Nagle (TCP_NODELAY) on the upgraded stream
//! - Bounded connect time
//! - No logging per message

use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session, nothing scheduled
    Idle,
    /// Connect in progress
    Connecting,
    /// Session open, subscriptions replayed
    Open,
    /// Explicit shutdown in progress
    Closing,
    /// Waiting for the backoff timer
    Reconnecting,
    /// Reconnect budget exhausted; terminal until `connect()`
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Errors that can occur with WebSocket connections
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timeout")]
    Timeout,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Engine → socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Send a close frame and stop the pump
    Close,
}

/// Socket → engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// Protocol-level pong frame
    Pong,
    /// Non-fatal transport error; a `Closed` follows if the session died
    Error(String),
    Closed,
}

/// Channels to one live session
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    /// Pump task; awaited before the next session opens
    pub pump: Option<JoinHandle<()>>,
}

/// Opens transport sessions
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str) -> impl Future<Output = Result<TransportLink>> + Send;
}

/// tokio-tungstenite connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str) -> impl Future<Output = Result<TransportLink>> + Send {
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;
        async move {
            // disable_nagle = true sets TCP_NODELAY for plain and TLS streams
            let (ws_stream, _) = timeout(
                connect_timeout,
                connect_async_with_config(url.as_str(), None, true),
            )
            .await
            .map_err(|_| WebSocketError::Timeout)?
            .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let pump = tokio::spawn(pump(ws_stream, outbound_rx, inbound_tx));

            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
                pump: Some(pump),
            })
        }
    }
}

/// Bridge one socket to the engine's channels until either side closes
async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        let _ = inbound.send(TransportEvent::Error(e.to_string()));
                        let _ = inbound.send(TransportEvent::Closed);
                        break;
                    }
                }
                // Engine dropped the link or asked to close
                Some(OutboundFrame::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            message = source.next() => {
                let event = match message {
                    Some(Ok(Message::Text(text))) => TransportEvent::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => TransportEvent::Text(text),
                        Err(e) => TransportEvent::Error(format!("non-utf8 binary frame: {}", e)),
                    },
                    Some(Ok(Message::Pong(_))) => TransportEvent::Pong,
                    // tungstenite queues the pong reply itself
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(target: "ws", ?frame, "Server closed session");
                        let _ = inbound.send(TransportEvent::Closed);
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = inbound.send(TransportEvent::Error(e.to_string()));
                        let _ = inbound.send(TransportEvent::Closed);
                        break;
                    }
                    None => {
                        let _ = inbound.send(TransportEvent::Closed);
                        break;
                    }
                };
                if inbound.send(event).is_err() {
                    // Engine is gone
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }
}

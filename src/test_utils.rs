//! Test utilities: an in-memory transport
//!
//! `MockConnector` hands every opened session to the test as a
//! [`MockSession`], which sees what the engine sent and can feed events back.

use crate::infrastructure::config::Config;
use crate::ws::connection::{
    Connector, OutboundFrame, Result, TransportEvent, TransportLink, WebSocketError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Transport lifecycle event seen by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    Opened,
    PumpClosed,
}

#[derive(Debug, Default)]
struct MockInner {
    attempts: u32,
    refuse_next: u32,
    /// How long a session's pump keeps running after the engine lets go of it
    pump_linger: Option<Duration>,
    events: Vec<(MockEvent, Instant)>,
}

/// Connector that opens in-memory sessions
#[derive(Debug, Clone)]
pub struct MockConnector {
    inner: Arc<Mutex<MockInner>>,
    sessions: mpsc::UnboundedSender<MockSession>,
}

/// Test side of one opened session
#[derive(Debug)]
pub struct MockSession {
    pub sent: mpsc::UnboundedReceiver<OutboundFrame>,
    pub feed: mpsc::UnboundedSender<TransportEvent>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            inner: Arc::new(Mutex::new(MockInner::default())),
            sessions: tx,
        };
        (connector, rx)
    }

    /// Fail the next `n` open attempts
    pub fn refuse_next(&self, n: u32) {
        self.inner.lock().refuse_next = n;
    }

    /// Give every later session a pump that takes `linger` to finish closing
    pub fn with_pump_linger(&self, linger: Duration) {
        self.inner.lock().pump_linger = Some(linger);
    }

    /// Opens and pump shutdowns, in order
    pub fn events(&self) -> Vec<(MockEvent, Instant)> {
        self.inner.lock().events.clone()
    }

    /// Open attempts so far, refused ones included
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }
}

impl Connector for MockConnector {
    fn open(&self, _url: &str) -> impl Future<Output = Result<TransportLink>> + Send {
        let inner = self.inner.clone();
        let sessions = self.sessions.clone();
        async move {
            let linger = {
                let mut inner = inner.lock();
                inner.attempts += 1;
                if inner.refuse_next > 0 {
                    inner.refuse_next -= 1;
                    return Err(WebSocketError::ConnectionFailed(
                        "connection refused".to_string(),
                    ));
                }
                inner.events.push((MockEvent::Opened, Instant::now()));
                inner.pump_linger
            };

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

            let (sent, pump) = match linger {
                Some(linger) => {
                    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
                    let pump = tokio::spawn(lingering_pump(outbound_rx, sent_tx, linger, inner));
                    (sent_rx, Some(pump))
                }
                None => (outbound_rx, None),
            };

            let _ = sessions.send(MockSession {
                sent,
                feed: inbound_tx,
            });
            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
                pump,
            })
        }
    }
}

/// Forwards engine frames to the test, then lingers once the engine lets go
async fn lingering_pump(
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    sent: mpsc::UnboundedSender<OutboundFrame>,
    linger: Duration,
    inner: Arc<Mutex<MockInner>>,
) {
    while let Some(frame) = outbound.recv().await {
        let close = frame == OutboundFrame::Close;
        let _ = sent.send(frame);
        if close {
            break;
        }
    }
    tokio::time::sleep(linger).await;
    inner.lock().events.push((MockEvent::PumpClosed, Instant::now()));
}

impl MockSession {
    /// Next text frame the engine sent, parsed. Skips nothing.
    pub async fn next_json(&mut self) -> Option<Value> {
        match self.sent.recv().await? {
            OutboundFrame::Text(text) => serde_json::from_str(&text).ok(),
            OutboundFrame::Close => None,
        }
    }

    /// Next non-ping text frame, parsed
    pub async fn next_control(&mut self) -> Option<Value> {
        loop {
            let frame = self.next_json().await?;
            if frame["method"] != "ping" {
                return Some(frame);
            }
        }
    }

    /// Wait until the engine closes this session
    pub async fn wait_closed(&mut self) {
        while let Some(frame) = self.sent.recv().await {
            if frame == OutboundFrame::Close {
                return;
            }
        }
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.feed.send(TransportEvent::Text(text.to_string()));
    }

    pub fn pong(&self) {
        self.push_text(r#"{"type":"pong"}"#);
    }

    /// Simulate the server dropping the session
    pub fn drop_connection(&self) {
        let _ = self.feed.send(TransportEvent::Closed);
    }
}

/// Config with deterministic timings for engine tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.stream.throttle_window_ms = 0;
    config.heartbeat.ping_interval_ms = Some(3_000);
    config.heartbeat.pong_timeout_ms = Some(10_000);
    config.reconnect.base_delay_ms = 1_000;
    config.reconnect.max_delay_ms = 30_000;
    config.reconnect.max_attempts = 5;
    config
}

/// Params of a control frame as strings
pub fn params(frame: &Value) -> Vec<String> {
    frame["params"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

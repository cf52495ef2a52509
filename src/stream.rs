//! Public client handle
//!
//! Every `MarketStream` owns its own engine task, timers and socket. Clones
//! share that engine; dropping the last clone shuts it down like `close()`.

use crate::core::StreamId;
use crate::engine::{Command, ConnectionManager};
use crate::infrastructure::config::Config;
use crate::infrastructure::metrics::{MetricsSnapshot, StreamMetrics};
use crate::ws::connection::{ConnectionState, Connector, WsConnector};
use crate::{Result, StreamError};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

/// Handle to one streaming client
#[derive(Clone)]
pub struct MarketStream {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    metrics: Arc<StreamMetrics>,
}

impl MarketStream {
    /// Client backed by a real websocket. Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let connector = WsConnector::new(config.stream.connect_timeout());
        Self::with_connector(config, connector)
    }

    /// Client backed by any transport. Must be called inside a tokio runtime.
    pub fn with_connector<C: Connector>(config: Config, connector: C) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let metrics = Arc::new(StreamMetrics::new());

        let engine =
            ConnectionManager::new(&config, connector, commands_rx, state_tx, metrics.clone());
        let span = tracing::info_span!("market_stream", client = %id);
        tokio::spawn(engine.run().instrument(span));

        tracing::info!(target: "ws", client = %id, endpoint = %config.stream.endpoint, "Client created");

        Ok(Self {
            id,
            commands: commands_tx,
            state: state_rx,
            metrics,
        })
    }

    /// Candlesticks for `symbol` at `interval` (e.g. "1m"). The handler gets the `k` object.
    pub fn subscribe_candles<F>(&self, symbol: &str, interval: &str, handler: F) -> Result<StreamId>
    where
        F: FnMut(Value) + Send + 'static,
    {
        let stream = StreamId::kline(symbol, interval).ok_or_else(|| {
            StreamError::InvalidStream(format!("kline {:?}/{:?}", symbol, interval))
        })?;
        self.subscribe(stream, handler)
    }

    /// 24h rolling ticker for `symbol`
    pub fn subscribe_ticker<F>(&self, symbol: &str, handler: F) -> Result<StreamId>
    where
        F: FnMut(Value) + Send + 'static,
    {
        let stream = StreamId::ticker(symbol)
            .ok_or_else(|| StreamError::InvalidStream(format!("ticker {:?}", symbol)))?;
        self.subscribe(stream, handler)
    }

    /// Market-wide ticker array
    pub fn subscribe_all_tickers<F>(&self, handler: F) -> Result<StreamId>
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.subscribe(StreamId::all_tickers(), handler)
    }

    /// Register `handler` for `stream`, replacing any previous one
    pub fn subscribe<F>(&self, stream: StreamId, handler: F) -> Result<StreamId>
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.send(Command::Subscribe {
            stream: stream.clone(),
            handler: Box::new(handler),
        })?;
        Ok(stream)
    }

    /// Remove the handler for `stream`. Unknown streams are ignored.
    pub fn unsubscribe(&self, stream: &StreamId) -> Result<()> {
        self.send(Command::Unsubscribe {
            stream: stream.clone(),
        })
    }

    /// Open a session, replacing any live one, and reset the backoff budget
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Shut down and drop every subscription
    ///
    /// Returns once the engine has quiesced: no timer is armed and no handler
    /// runs afterwards. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Close { done: done_tx })?;
        done_rx.await.map_err(|_| StreamError::EngineStopped)
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the client reaches `target`
    pub async fn wait_for(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| StreamError::EngineStopped)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Client instance id, as it appears in log spans
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::EngineStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{params, test_config, MockConnector, MockEvent, MockSession};
    use serde_json::json;
    use std::time::Duration;

    fn spawn_client() -> (MarketStream, MockConnector, mpsc::UnboundedReceiver<MockSession>) {
        let (connector, sessions) = MockConnector::new();
        let stream = MarketStream::with_connector(test_config(), connector.clone()).unwrap();
        (stream, connector, sessions)
    }

    fn ticker_frame(symbol: &str, close: &str) -> String {
        format!(r#"{{"e":"24hrTicker","s":"{}","c":"{}"}}"#, symbol, close)
    }

    /// Yield to the engine until `done` holds
    async fn settle(stream: &MarketStream, done: impl Fn(&MetricsSnapshot) -> bool) {
        while !done(&stream.metrics()) {
            tokio::task::yield_now().await;
        }
    }

    fn channel_handler(tx: mpsc::UnboundedSender<Value>) -> impl FnMut(Value) + Send + 'static {
        move |payload| {
            let _ = tx.send(payload);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_registry_after_forced_close() {
        let (stream, _connector, mut sessions) = spawn_client();
        stream.subscribe_candles("BTCUSDT", "1m", |_| {}).unwrap();
        let eth = stream.subscribe_ticker("ethusdt", |_| {}).unwrap();
        stream.connect().unwrap();

        let mut first = sessions.recv().await.unwrap();
        let replay = first.next_control().await.unwrap();
        assert_eq!(replay["method"], "SUBSCRIBE");
        assert_eq!(params(&replay), vec!["btcusdt@kline_1m", "ethusdt@ticker"]);

        stream.unsubscribe(&eth).unwrap();
        let unsub = first.next_control().await.unwrap();
        assert_eq!(unsub["method"], "UNSUBSCRIBE");
        assert_eq!(params(&unsub), vec!["ethusdt@ticker"]);

        first.drop_connection();

        // Reconnect fires after the first backoff step
        let mut second = sessions.recv().await.unwrap();
        let replay = second.next_control().await.unwrap();
        assert_eq!(replay["method"], "SUBSCRIBE");
        assert_eq!(params(&replay), vec!["btcusdt@kline_1m"]);
        assert_eq!(stream.state(), ConnectionState::Open);

        let metrics = stream.metrics();
        assert_eq!(metrics.sessions_opened, 2);
        assert_eq!(metrics.reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_subscriptions_while_open() {
        let (stream, _connector, mut sessions) = spawn_client();
        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();

        let btc = stream.subscribe_ticker("btcusdt", |_| {}).unwrap();
        let sub = session.next_control().await.unwrap();
        assert_eq!(sub, json!({"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1}));

        // Same id: handler swap only, no traffic
        stream.subscribe_ticker("BTCUSDT", |_| {}).unwrap();
        stream.unsubscribe(&btc).unwrap();
        let unsub = session.next_control().await.unwrap();
        assert_eq!(unsub, json!({"method": "UNSUBSCRIBE", "params": ["btcusdt@ticker"], "id": 2}));

        // Not registered anymore: no traffic
        stream.unsubscribe(&btc).unwrap();
        stream.subscribe_all_tickers(|_| {}).unwrap();
        let sub = session.next_control().await.unwrap();
        assert_eq!(sub, json!({"method": "SUBSCRIBE", "params": ["!ticker@arr"], "id": 3}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pong_forces_reconnect_and_stray_pong_is_ignored() {
        let (stream, _connector, mut sessions) = spawn_client();
        stream.subscribe_ticker("btcusdt", |_| {}).unwrap();
        stream.connect().unwrap();

        let mut first = sessions.recv().await.unwrap();
        first.next_control().await.unwrap();

        // First ping at 3s arms the 10s deadline; later pings do not extend it
        let opened = tokio::time::Instant::now();
        first.wait_closed().await;
        assert_eq!(opened.elapsed(), Duration::from_secs(13));
        assert_eq!(stream.metrics().liveness_faults, 1);

        let mut second = sessions.recv().await.unwrap();
        second.next_control().await.unwrap();
        assert_eq!(stream.state(), ConnectionState::Open);

        // Pong before any ping: read by the engine, changes nothing
        let before = stream.metrics();
        second.pong();
        settle(&stream, |m| m.frames_received > before.frames_received).await;
        let after = stream.metrics();
        assert_eq!(stream.state(), ConnectionState::Open);
        assert_eq!(after.liveness_faults, before.liveness_faults);
        assert_eq!(after.sessions_opened, before.sessions_opened);
        assert_eq!(after.reconnect_attempts, before.reconnect_attempts);
        assert_eq!(after.frames_dropped, before.frames_dropped);

        // Answered pings keep the new session alive
        for _ in 0..5 {
            let ping = second.next_json().await.unwrap();
            assert_eq!(ping, json!({"method": "ping"}));
            second.pong();
        }
        let metrics = stream.metrics();
        assert_eq!(metrics.liveness_faults, 1);
        assert_eq!(metrics.sessions_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_close_is_noop() {
        let (stream, connector, mut sessions) = spawn_client();
        stream.subscribe_ticker("btcusdt", |_| {}).unwrap();
        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();
        session.next_control().await.unwrap();

        stream.close().await.unwrap();
        assert_eq!(stream.state(), ConnectionState::Idle);
        session.wait_closed().await;

        stream.close().await.unwrap();
        assert_eq!(stream.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(sessions.try_recv().is_err());
        assert!(session.sent.try_recv().is_err());
        assert_eq!(connector.attempts(), 1);
        assert_eq!(stream.metrics().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_registry() {
        let (stream, _connector, mut sessions) = spawn_client();
        stream.subscribe_ticker("btcusdt", |_| {}).unwrap();
        stream.close().await.unwrap();

        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();
        stream.subscribe_ticker("ethusdt", |_| {}).unwrap();

        // Only the post-close subscription goes out, with no replay before it
        let sub = session.next_control().await.unwrap();
        assert_eq!(params(&sub), vec!["ethusdt@ticker"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_fails_until_explicit_connect() {
        let (stream, connector, mut sessions) = spawn_client();
        connector.refuse_next(u32::MAX);
        stream.connect().unwrap();

        let started = tokio::time::Instant::now();
        stream.wait_for(ConnectionState::Failed).await.unwrap();
        // 2 + 4 + 8 + 16 + 30 seconds of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(connector.attempts(), 6);
        assert_eq!(stream.metrics().reconnect_attempts, 5);

        // Terminal: nothing else happens on its own
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.attempts(), 6);
        assert_eq!(stream.state(), ConnectionState::Failed);

        connector.refuse_next(0);
        stream.connect().unwrap();
        let _session = sessions.recv().await.unwrap();
        stream.wait_for(ConnectionState::Open).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_kline_payload_and_handler_panic_containment() {
        let (stream, _connector, mut sessions) = spawn_client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.subscribe_candles("btcusdt", "1m", channel_handler(tx)).unwrap();
        stream.subscribe_ticker("ethusdt", |_| panic!("consumer bug")).unwrap();
        stream.connect().unwrap();

        let mut session = sessions.recv().await.unwrap();
        session.next_control().await.unwrap();

        session.push_text(r#"{"e":"24hrTicker","E":1,"s":"ETHUSDT","c":"3000.1"}"#);
        session.push_text(
            r#"{"e":"kline","E":2,"s":"BTCUSDT","k":{"t":1,"i":"1m","o":"1.0","c":"2.0","x":false}}"#,
        );
        // Unsubscribed stream: dropped
        session.push_text(r#"{"e":"24hrTicker","E":3,"s":"BNBUSDT","c":"600"}"#);

        let k = rx.recv().await.unwrap();
        assert_eq!(k, json!({"t": 1, "i": "1m", "o": "1.0", "c": "2.0", "x": false}));

        let metrics = stream.metrics();
        assert_eq!(metrics.handler_faults, 1);
        assert_eq!(metrics.payloads_delivered, 1);
        assert_eq!(stream.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_open_replaces_session() {
        let (stream, _connector, mut sessions) = spawn_client();
        stream.connect().unwrap();
        let mut first = sessions.recv().await.unwrap();
        stream.wait_for(ConnectionState::Open).await.unwrap();

        stream.connect().unwrap();
        first.wait_closed().await;
        let _second = sessions.recv().await.unwrap();
        stream.wait_for(ConnectionState::Open).await.unwrap();

        let metrics = stream.metrics();
        assert_eq!(metrics.sessions_opened, 2);
        assert_eq!(metrics.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_tickers_coalesced_per_render_tick() {
        let (connector, mut sessions) = MockConnector::new();
        let mut config = test_config();
        config.stream.snapshot_render_tick_ms = Some(100);
        let stream = MarketStream::with_connector(config, connector).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.subscribe_all_tickers(channel_handler(tx)).unwrap();
        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();
        session.next_control().await.unwrap();

        session.push_text(r#"[{"e":"24hrTicker","s":"BTCUSDT","c":"1"},{"e":"24hrTicker","s":"ETHUSDT","c":"10"}]"#);
        session.push_text(r#"[{"e":"24hrTicker","s":"BTCUSDT","c":"2"}]"#);

        let batch = rx.recv().await.unwrap();
        assert_eq!(
            batch,
            json!([
                {"e": "24hrTicker", "s": "BTCUSDT", "c": "2"},
                {"e": "24hrTicker", "s": "ETHUSDT", "c": "10"}
            ])
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_pends_until_state_reached() {
        let (stream, _connector, mut sessions) = spawn_client();
        let mut wait = tokio_test::task::spawn(stream.wait_for(ConnectionState::Open));
        tokio_test::assert_pending!(wait.poll());

        stream.connect().unwrap();
        let _session = sessions.recv().await.unwrap();
        stream.wait_for(ConnectionState::Open).await.unwrap();

        assert!(wait.is_woken());
        tokio_test::assert_ready_ok!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_closes_session() {
        let (stream, _connector, mut sessions) = spawn_client();
        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();

        let clone = stream.clone();
        drop(stream);
        assert_eq!(clone.state(), ConnectionState::Open);
        drop(clone);

        session.wait_closed().await;
    }

    #[tokio::test]
    async fn test_rejects_empty_symbol() {
        let (stream, _connector, _sessions) = spawn_client();
        assert!(matches!(
            stream.subscribe_ticker("", |_| {}),
            Err(StreamError::InvalidStream(_))
        ));
        assert!(matches!(
            stream.subscribe_candles("btcusdt", "", |_| {}),
            Err(StreamError::InvalidStream(_))
        ));
    }

    #[tokio::test]
    async fn test_new_validates_config() {
        let mut config = Config::default();
        config.stream.endpoint = "http://example.com".to_string();
        assert!(matches!(MarketStream::new(config), Err(StreamError::Config(_))));
    }

    #[tokio::test]
    async fn test_with_connector_rejects_zero_ping_interval() {
        let (connector, _sessions) = MockConnector::new();
        let mut config = test_config();
        config.heartbeat.ping_interval_ms = Some(0);
        assert!(matches!(
            MarketStream::with_connector(config, connector),
            Err(StreamError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_closing_session() {
        let (connector, mut sessions) = MockConnector::new();
        connector.with_pump_linger(Duration::from_secs(10));
        let mut config = test_config();
        config.stream.close_timeout_ms = 30_000;
        let stream = MarketStream::with_connector(config, connector.clone()).unwrap();

        stream.connect().unwrap();
        let first = sessions.recv().await.unwrap();
        let t0 = tokio::time::Instant::now();
        first.drop_connection();

        // Backoff fired at 2s and is held back by the closing pump
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stream.state(), ConnectionState::Connecting);
        stream.connect().unwrap();

        let _second = sessions.recv().await.unwrap();
        let events: Vec<(MockEvent, Duration)> = connector
            .events()
            .into_iter()
            .map(|(event, at)| (event, at.duration_since(t0)))
            .collect();
        assert_eq!(
            events,
            vec![
                (MockEvent::Opened, Duration::ZERO),
                (MockEvent::PumpClosed, Duration::from_secs(10)),
                (MockEvent::Opened, Duration::from_secs(10)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_then_connect_waits_for_closing_session() {
        let (connector, mut sessions) = MockConnector::new();
        connector.with_pump_linger(Duration::from_secs(5));
        let mut config = test_config();
        config.stream.close_timeout_ms = 30_000;
        let stream = MarketStream::with_connector(config, connector.clone()).unwrap();

        stream.connect().unwrap();
        let mut first = sessions.recv().await.unwrap();
        let t0 = tokio::time::Instant::now();

        stream.close().await.unwrap();
        first.wait_closed().await;
        stream.connect().unwrap();

        let _second = sessions.recv().await.unwrap();
        let events: Vec<MockEvent> = connector.events().into_iter().map(|(e, _)| e).collect();
        assert_eq!(
            events,
            vec![MockEvent::Opened, MockEvent::PumpClosed, MockEvent::Opened]
        );
        assert_eq!(t0.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_teardown_bounded_by_close_timeout() {
        let (connector, mut sessions) = MockConnector::new();
        connector.with_pump_linger(Duration::from_secs(10));
        // close_timeout stays at 2s
        let stream = MarketStream::with_connector(test_config(), connector.clone()).unwrap();

        stream.connect().unwrap();
        let first = sessions.recv().await.unwrap();
        let t0 = tokio::time::Instant::now();
        first.drop_connection();

        // Reconnect due at 2s, pump aborted at 4s
        let _second = sessions.recv().await.unwrap();
        let events: Vec<(MockEvent, Duration)> = connector
            .events()
            .into_iter()
            .map(|(event, at)| (event, at.duration_since(t0)))
            .collect();
        assert_eq!(
            events,
            vec![
                (MockEvent::Opened, Duration::ZERO),
                (MockEvent::Opened, Duration::from_secs(4)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_throttled_backlog() {
        let (connector, mut sessions) = MockConnector::new();
        let mut config = test_config();
        config.stream.throttle_window_ms = 200;
        let stream = MarketStream::with_connector(config, connector).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.subscribe_ticker("btcusdt", channel_handler(tx)).unwrap();
        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();
        session.next_control().await.unwrap();

        session.push_text(&ticker_frame("BTCUSDT", "1"));
        assert_eq!(rx.recv().await.unwrap()["c"], "1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.push_text(&ticker_frame("BTCUSDT", "2"));
        settle(&stream, |m| m.payloads_buffered >= 1).await;

        stream.close().await.unwrap();
        // The handler went away with the registry; the backlog never reached it
        assert!(rx.recv().await.is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.subscribe_ticker("btcusdt", channel_handler(tx)).unwrap();
        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();
        session.next_control().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        session.push_text(&ticker_frame("BTCUSDT", "3"));
        assert_eq!(rx.recv().await.unwrap()["c"], "3");
        assert!(rx.try_recv().is_err());
        assert_eq!(stream.metrics().payloads_delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_discards_throttled_backlog() {
        let (connector, mut sessions) = MockConnector::new();
        let mut config = test_config();
        config.stream.throttle_window_ms = 200;
        let stream = MarketStream::with_connector(config, connector).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let btc = stream.subscribe_ticker("btcusdt", channel_handler(tx)).unwrap();
        stream.connect().unwrap();
        let mut session = sessions.recv().await.unwrap();
        session.next_control().await.unwrap();

        session.push_text(&ticker_frame("BTCUSDT", "1"));
        assert_eq!(rx.recv().await.unwrap()["c"], "1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.push_text(&ticker_frame("BTCUSDT", "2"));
        settle(&stream, |m| m.payloads_buffered >= 1).await;

        stream.unsubscribe(&btc).unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(session.next_control().await.unwrap()["method"], "UNSUBSCRIBE");

        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.subscribe_ticker("btcusdt", channel_handler(tx)).unwrap();
        assert_eq!(session.next_control().await.unwrap()["method"], "SUBSCRIBE");

        tokio::time::sleep(Duration::from_millis(300)).await;
        session.push_text(&ticker_frame("BTCUSDT", "3"));
        assert_eq!(rx.recv().await.unwrap()["c"], "3");
        assert!(rx.try_recv().is_err());
        assert_eq!(stream.metrics().payloads_delivered, 2);
    }
}

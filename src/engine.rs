//! Connection manager
//!
//! One engine task per client owns the transport session, the subscription
//! registry, the ingest buffer and every timer. Commands from handles,
//! transport events, connect results and timer expiries are multiplexed in a
//! single `select!` loop, so state is only ever mutated from one place.
//!
//! ```text
//! Idle -> Connecting -> Open -> Reconnecting -> Connecting -> ... -> Failed
//!                          \-> Closing -> Idle   (explicit close, any state)
//! ```

use crate::core::{decode, Frame, StreamId};
use crate::infrastructure::config::Config;
use crate::infrastructure::metrics::StreamMetrics;
use crate::ws::connection::{
    ConnectionState, Connector, OutboundFrame, TransportEvent, TransportLink, WebSocketError,
};
use crate::ws::dispatch::Dispatcher;
use crate::ws::ingest::IngestBuffer;
use crate::ws::ping::{HeartbeatMonitor, PING_FRAME};
use crate::ws::reconnect::ReconnectPolicy;
use crate::ws::subscription::{ControlRequest, Handler, RequestIds, SubscriptionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Requests from client handles
pub(crate) enum Command {
    Subscribe { stream: StreamId, handler: Handler },
    Unsubscribe { stream: StreamId },
    Connect,
    Close { done: oneshot::Sender<()> },
}

/// Live session owned by the engine
struct Session {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    pump: Option<JoinHandle<()>>,
}

type ConnectTask = JoinHandle<Result<TransportLink, WebSocketError>>;

/// Connection lifecycle state machine
pub(crate) struct ConnectionManager<C: Connector> {
    endpoint: String,
    close_timeout: Duration,
    connector: Arc<C>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    registry: SubscriptionRegistry,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectPolicy,
    buffer: IngestBuffer,
    dispatcher: Dispatcher,
    metrics: Arc<StreamMetrics>,
    request_ids: RequestIds,
    session: Option<Session>,
    pending_connect: Option<ConnectTask>,
    reconnect_at: Option<Instant>,
    /// Pumps of torn-down sessions that have not finished closing
    retired_pumps: Vec<JoinHandle<()>>,
    /// A connect is waiting for `retired_pumps` to drain
    open_requested: bool,
    /// Retired pumps still running at this instant are aborted
    teardown_deadline: Option<Instant>,
}

impl<C: Connector> ConnectionManager<C> {
    pub(crate) fn new(
        config: &Config,
        connector: C,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let mut buffer = IngestBuffer::new(config.stream.throttle_window());
        if let Some(tick) = config.stream.snapshot_render_tick() {
            buffer = buffer.with_snapshot_tick(tick);
        }

        Self {
            endpoint: config.stream.endpoint.clone(),
            close_timeout: config.stream.close_timeout(),
            connector: Arc::new(connector),
            commands,
            state_tx,
            state: ConnectionState::Idle,
            registry: SubscriptionRegistry::new(),
            heartbeat: HeartbeatMonitor::from_config(&config.heartbeat),
            reconnect: ReconnectPolicy::from_config(&config.reconnect),
            buffer,
            dispatcher: Dispatcher::new(metrics.clone()),
            metrics,
            request_ids: RequestIds::new(),
            session: None,
            pending_connect: None,
            reconnect_at: None,
            retired_pumps: Vec::new(),
            open_requested: false,
            teardown_deadline: None,
        }
    }

    /// Run until every client handle is dropped
    pub(crate) async fn run(mut self) {
        loop {
            let ping_at = self.heartbeat.next_ping_at();
            let pong_deadline = self.heartbeat.pong_deadline();
            let flush_at = self.buffer.next_flush_at();
            let reconnect_at = self.reconnect_at;
            let teardown_deadline = self.teardown_deadline;

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                result = join_connect(&mut self.pending_connect), if self.pending_connect.is_some() => {
                    self.pending_connect = None;
                    self.on_connect_result(result);
                }
                _ = join_first(&mut self.retired_pumps), if !self.retired_pumps.is_empty() => {
                    self.retired_pumps.remove(0);
                    self.open_if_drained();
                }
                event = next_event(&mut self.session), if self.session.is_some() => {
                    self.on_transport_event(event);
                }
                _ = sleep_until_opt(pong_deadline), if pong_deadline.is_some() => {
                    self.on_pong_deadline();
                }
                _ = sleep_until_opt(ping_at), if ping_at.is_some() => {
                    self.on_ping_tick();
                }
                _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                    self.on_render_tick();
                }
                _ = sleep_until_opt(teardown_deadline), if teardown_deadline.is_some() => {
                    self.on_teardown_deadline();
                }
                _ = sleep_until_opt(reconnect_at), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
            }
        }

        tracing::debug!(target: "ws", "Engine stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { stream, handler } => {
                let is_new = self.registry.subscribe(stream.clone(), handler);
                if !is_new {
                    tracing::debug!(target: "ws", stream = %stream, "Handler replaced");
                } else if self.state == ConnectionState::Open {
                    let id = self.request_ids.next_id();
                    self.send_control(ControlRequest::subscribe([&stream], id));
                } else {
                    tracing::debug!(target: "ws", stream = %stream, state = %self.state, "Queued for replay");
                }
            }
            Command::Unsubscribe { stream } => {
                if !self.registry.unsubscribe(&stream) {
                    return;
                }
                self.buffer.forget(&stream);
                if self.state == ConnectionState::Open {
                    let id = self.request_ids.next_id();
                    self.send_control(ControlRequest::unsubscribe([&stream], id));
                }
            }
            Command::Connect => {
                self.reconnect.reset();
                self.start_connect();
            }
            Command::Close { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    /// Begin a fresh connect, tearing down whatever session exists
    ///
    /// The transport is only opened once every retired pump has finished
    /// closing, or was aborted at the teardown deadline.
    fn start_connect(&mut self) {
        self.teardown_session();
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        self.open_requested = true;

        if !self.retired_pumps.is_empty() && self.teardown_deadline.is_none() {
            self.teardown_deadline = Some(Instant::now() + self.close_timeout);
        }
        self.open_if_drained();
    }

    fn open_if_drained(&mut self) {
        if !self.open_requested || !self.retired_pumps.is_empty() {
            return;
        }
        self.open_requested = false;
        self.teardown_deadline = None;

        let connector = self.connector.clone();
        let url = self.endpoint.clone();
        self.pending_connect = Some(tokio::spawn(async move { connector.open(&url).await }));
    }

    /// Previous sessions did not close in time: abort their pumps
    ///
    /// Aborted pumps stay in `retired_pumps` until they have actually stopped.
    fn on_teardown_deadline(&mut self) {
        self.teardown_deadline = None;
        tracing::warn!(
            target: "ws",
            count = self.retired_pumps.len(),
            "Previous session did not close in time"
        );
        for pump in &self.retired_pumps {
            pump.abort();
        }
    }

    fn on_connect_result(&mut self, result: Result<TransportLink, WebSocketError>) {
        match result {
            Ok(link) => self.on_open(link),
            Err(e) => {
                tracing::warn!(target: "ws", error = %e, "Connect failed");
                self.schedule_reconnect(Instant::now());
            }
        }
    }

    fn on_open(&mut self, link: TransportLink) {
        let now = Instant::now();
        self.session = Some(Session {
            outbound: link.outbound,
            inbound: link.inbound,
            pump: link.pump,
        });
        self.reconnect.reset();
        self.metrics.record_session_opened();
        self.set_state(ConnectionState::Open);

        let streams = self.registry.all();
        if !streams.is_empty() {
            let id = self.request_ids.next_id();
            self.send_control(ControlRequest::subscribe(&streams, id));
            tracing::info!(target: "ws", count = streams.len(), "Replayed subscriptions");
        }
        self.heartbeat.start(now);
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text(text) => self.on_text(&text),
            TransportEvent::Pong => self.on_pong(),
            TransportEvent::Error(e) => {
                // The close that follows drives recovery
                tracing::warn!(target: "ws", error = %e, "Transport error");
            }
            TransportEvent::Closed => {
                tracing::warn!(target: "ws", "Transport closed");
                self.on_session_closed();
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        self.metrics.record_frame();
        match decode(text) {
            Ok(Frame::Data { stream, payload }) => {
                self.dispatcher.dispatch(
                    &mut self.registry,
                    &mut self.buffer,
                    &stream,
                    payload,
                    Instant::now(),
                );
            }
            Ok(Frame::Pong) => self.on_pong(),
            Ok(Frame::Ack { id }) => {
                tracing::debug!(target: "ws", id, "Control request acknowledged");
            }
            Ok(Frame::Rejected { id, error }) => {
                tracing::warn!(target: "ws", ?id, %error, "Control request rejected");
            }
            Ok(Frame::Unknown) => {
                self.metrics.record_dropped();
            }
            Err(e) => {
                self.metrics.record_dropped();
                tracing::warn!(target: "ws", error = %e, "Undecodable frame");
            }
        }
    }

    fn on_pong(&mut self) {
        if !self.heartbeat.on_pong() {
            tracing::trace!(target: "ws", "Stray pong ignored");
        }
    }

    fn on_ping_tick(&mut self) {
        let open = self.state == ConnectionState::Open && self.session.is_some();
        if self.heartbeat.on_tick(Instant::now(), open) {
            self.send_text(PING_FRAME.to_string());
        }
    }

    /// Missed pong: force the session down and recover like any close
    fn on_pong_deadline(&mut self) {
        if !self.heartbeat.is_expired(Instant::now()) {
            return;
        }
        self.metrics.record_liveness_fault();
        tracing::warn!(target: "ws", "Pong timeout - forcing reconnect");

        if let Some(session) = self.session.take() {
            let _ = session.outbound.send(OutboundFrame::Close);
            self.retire_pump(session.pump);
        }
        self.on_session_closed();
    }

    fn on_session_closed(&mut self) {
        let closed_at = Instant::now();
        self.heartbeat.stop();
        if let Some(session) = self.session.take() {
            self.retire_pump(session.pump);
        }
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Idle) {
            return;
        }
        self.schedule_reconnect(closed_at);
    }

    /// Backoff is measured from when the previous session closed
    fn schedule_reconnect(&mut self, closed_at: Instant) {
        match self.reconnect.next_delay() {
            Some(delay) => {
                self.metrics.record_reconnect_attempt();
                self.reconnect_at = Some(closed_at + delay);
                self.set_state(ConnectionState::Reconnecting);
                tracing::info!(
                    target: "ws",
                    attempt = self.reconnect.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect scheduled"
                );
            }
            None => {
                self.reconnect_at = None;
                self.set_state(ConnectionState::Failed);
                tracing::error!(
                    target: "ws",
                    attempts = self.reconnect.attempt(),
                    "Reconnect attempts exhausted; call connect() to retry"
                );
            }
        }
    }

    fn on_render_tick(&mut self) {
        if let Some(batch) = self.buffer.flush_snapshot() {
            let stream = StreamId::all_tickers();
            self.dispatcher.deliver(&mut self.registry, &stream, vec![batch]);
        }
    }

    /// Explicit close; safe from any state and idempotent
    fn shutdown(&mut self) {
        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Closing);
        }
        self.teardown_session();
        self.open_requested = false;
        self.teardown_deadline = None;
        self.reconnect_at = None;
        self.reconnect.reset();
        self.registry.clear();
        self.buffer.clear();
        self.set_state(ConnectionState::Idle);
    }

    /// Drop the session and any in-flight connect without scheduling a reconnect
    fn teardown_session(&mut self) {
        self.heartbeat.stop();
        if let Some(task) = self.pending_connect.take() {
            task.abort();
        }
        if let Some(session) = self.session.take() {
            let _ = session.outbound.send(OutboundFrame::Close);
            self.retire_pump(session.pump);
        }
    }

    fn retire_pump(&mut self, pump: Option<JoinHandle<()>>) {
        if let Some(pump) = pump {
            self.retired_pumps.push(pump);
        }
    }

    fn send_control(&mut self, request: ControlRequest) {
        match request.to_json() {
            Ok(text) => self.send_text(text),
            Err(e) => tracing::error!(target: "ws", error = %e, "Failed to encode control request"),
        }
    }

    fn send_text(&mut self, text: String) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.outbound.send(OutboundFrame::Text(text)).is_err() {
            // Pump is gone; its Closed event (or channel end) drives recovery
            tracing::debug!(target: "ws", "Send on dead session");
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        tracing::info!(target: "ws", from = %self.state, to = %next, "State transition");
        self.state = next;
        self.state_tx.send_replace(next);
    }
}

async fn join_connect(
    pending: &mut Option<ConnectTask>,
) -> Result<TransportLink, WebSocketError> {
    match pending.as_mut() {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(WebSocketError::ConnectionFailed(format!("connect task: {}", e))),
        },
        None => std::future::pending().await,
    }
}

/// Resolves when the oldest retired pump has stopped
async fn join_first(pumps: &mut [JoinHandle<()>]) {
    match pumps.first_mut() {
        Some(pump) => {
            let _ = pump.await;
        }
        None => std::future::pending().await,
    }
}

async fn next_event(session: &mut Option<Session>) -> TransportEvent {
    match session.as_mut() {
        Some(session) => session.inbound.recv().await.unwrap_or(TransportEvent::Closed),
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

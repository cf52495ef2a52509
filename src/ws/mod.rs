//! WebSocket session plumbing for real-time market data

pub mod connection;
pub mod dispatch;
pub mod ingest;
pub mod ping;
pub mod reconnect;
pub mod subscription;

pub use connection::{ConnectionState, Connector, WebSocketError, WsConnector};
pub use dispatch::Dispatcher;
pub use ingest::{Admission, IngestBuffer};
pub use ping::HeartbeatMonitor;
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use subscription::{ControlRequest, Handler, SubscriptionRegistry};

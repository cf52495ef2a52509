//! Resilient real-time market data streaming client
//!
//! Subscribes to candlestick and ticker streams over one multiplexed
//! WebSocket session, keeps it alive with heartbeats, and transparently
//! reconnects and re-subscribes after faults.

pub mod core;
pub mod engine;
pub mod infrastructure;
pub mod stream;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use crate::core::{StreamId, StreamKind};
pub use infrastructure::config::{Config, ConfigError};
pub use infrastructure::metrics::MetricsSnapshot;
pub use stream::MarketStream;
pub use ws::connection::ConnectionState;

use thiserror::Error;

/// Main error type for the streaming client
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Engine stopped")]
    EngineStopped,

    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StreamError>;

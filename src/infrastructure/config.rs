//! Configuration management for the streaming client
//!
//! Loads configuration from config.toml at startup.
//! All timing values are configurable to avoid hardcoded constants.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default public spot stream endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://stream.binance.com:9443/ws";

/// Client configuration
///
/// Loaded from config.toml at startup. Every section falls back to defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Transport and ingest settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Liveness probing
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Backoff schedule
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Streams the demo binary subscribes to at startup
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSpec>,
}

/// Transport and ingest settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// WebSocket endpoint of the stream multiplexer
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Timeout for TCP + TLS + upgrade
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on waiting for a previous session's teardown
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Per-stream throttle window; 0 dispatches every frame immediately
    #[serde(default = "default_throttle_window_ms")]
    pub throttle_window_ms: u64,

    /// When set, `!ticker@arr` frames are coalesced per symbol and flushed
    /// once per render tick instead of going through the throttle
    #[serde(default)]
    pub snapshot_render_tick_ms: Option<u64>,
}

/// Named heartbeat presets observed on the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatProfile {
    /// 1s ping / 3s pong timeout
    Fast,
    /// 3s ping / 10s pong timeout
    Conservative,
}

/// Liveness probing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    /// Preset; explicit millisecond values below override it
    #[serde(default = "default_profile")]
    pub profile: HeartbeatProfile,

    #[serde(default)]
    pub ping_interval_ms: Option<u64>,

    #[serde(default)]
    pub pong_timeout_ms: Option<u64>,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Attempts allowed before the client gives up (state `Failed`)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Symmetric jitter as a fraction of the delay (0.0 - 1.0)
    #[serde(default)]
    pub jitter: f64,
}

/// One startup subscription for the demo binary
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionSpec {
    Candles { symbol: String, interval: String },
    Ticker { symbol: String },
    AllTickers,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            throttle_window_ms: default_throttle_window_ms(),
            snapshot_render_tick_ms: None,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            ping_interval_ms: None,
            pong_timeout_ms: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: 0.0,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

fn default_throttle_window_ms() -> u64 {
    200
}

fn default_profile() -> HeartbeatProfile {
    HeartbeatProfile::Conservative
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

impl HeartbeatProfile {
    /// (ping interval, pong timeout)
    pub fn intervals(&self) -> (Duration, Duration) {
        match self {
            HeartbeatProfile::Fast => (Duration::from_secs(1), Duration::from_secs(3)),
            HeartbeatProfile::Conservative => (Duration::from_secs(3), Duration::from_secs(10)),
        }
    }
}

impl HeartbeatConfig {
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.profile.intervals().0)
    }

    pub fn pong_timeout(&self) -> Duration {
        self.pong_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.profile.intervals().1)
    }
}

impl StreamConfig {
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    #[inline]
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    #[inline]
    pub fn snapshot_render_tick(&self) -> Option<Duration> {
        self.snapshot_render_tick_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from config.toml file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be parsed or fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = url::Url::parse(&self.stream.endpoint)
            .map_err(|e| ConfigError::Invalid(format!("endpoint: {}", e)))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "endpoint scheme must be ws or wss, got {}",
                endpoint.scheme()
            )));
        }
        if self.heartbeat.ping_interval().is_zero() {
            return Err(ConfigError::Invalid("ping interval must be > 0".to_string()));
        }
        if self.heartbeat.pong_timeout().is_zero() {
            return Err(ConfigError::Invalid("pong timeout must be > 0".to_string()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect base delay exceeds max delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid("jitter must be within 0.0..=1.0".to_string()));
        }
        if self.stream.snapshot_render_tick_ms == Some(0) {
            return Err(ConfigError::Invalid("render tick must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
    /// Parsed but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) | ConfigError::Invalid(_) => None,
        }
    }
}

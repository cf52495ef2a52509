//! Infrastructure - cold path only
//!
//! This module contains non-latency-critical code:
//! - Logging and metrics
//! - Configuration management

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError, HeartbeatProfile, SubscriptionSpec};
pub use metrics::{MetricsSnapshot, StreamMetrics};

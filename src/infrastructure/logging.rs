//! Centralized file-based logging system
//!
//! Writes logs to files under a log directory, separated by log type:
//! - main/ - all events as JSON
//! - error/ - warnings and errors only
//! - ws/ - connection lifecycle, heartbeat and dispatch events

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log sub-directories created under the root
pub const LOG_TYPES: [&str; 3] = ["main", "error", "ws"];

/// Initialize centralized file logging
///
/// Creates `root` and one subdirectory per log type. Returns the guards that
/// must be kept alive for the duration of the program. `RUST_LOG` overrides
/// the default `info` filter.
pub fn init_logging(root: impl AsRef<Path>) -> io::Result<Vec<WorkerGuard>> {
    let root = root.as_ref();
    prepare_log_dirs(root)?;

    let mut guards = Vec::new();

    let (main_appender, main_guard) = create_appender(root, "main");
    guards.push(main_guard);

    let (error_appender, error_guard) = create_appender(root, "error");
    guards.push(error_guard);

    let (ws_appender, ws_guard) = create_appender(root, "ws");
    guards.push(ws_guard);

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let ws_layer = tracing_subscriber::fmt::layer()
        .with_writer(ws_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            is_ws_target(metadata.target())
        }));

    // Console layer for development
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(main_layer)
        .with(error_layer)
        .with(ws_layer)
        .with(console_layer)
        .init();

    tracing::info!("Logging system initialized. Log files in {}", root.display());

    Ok(guards)
}

/// Create the root log directory and one subdirectory per log type
pub fn prepare_log_dirs(root: &Path) -> io::Result<()> {
    for log_type in &LOG_TYPES {
        fs::create_dir_all(root.join(log_type))?;
    }
    Ok(())
}

/// Whether an event target belongs in the ws log
pub fn is_ws_target(target: &str) -> bool {
    target == "ws" || target.contains("::ws") || target.contains("engine")
}

/// Create a daily rolling non-blocking appender
fn create_appender(root: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, root.join(name), name);

    tracing_appender::non_blocking(appender)
}

/// Log macro helper for connection lifecycle events
#[macro_export]
macro_rules! log_ws {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "ws", $level, $($arg)+)
    };
}

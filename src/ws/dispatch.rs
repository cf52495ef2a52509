//! Frame routing to consumer handlers
//!
//! Unmatched streams are dropped silently. A panicking handler is caught at
//! this boundary, logged and counted; it never unwinds into the engine.

use crate::core::StreamId;
use crate::infrastructure::metrics::StreamMetrics;
use crate::ws::ingest::{Admission, IngestBuffer};
use crate::ws::subscription::{Handler, SubscriptionRegistry};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::Instant;

/// Routes decoded payloads through the ingest buffer to handlers
#[derive(Clone)]
pub struct Dispatcher {
    metrics: Arc<StreamMetrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<StreamMetrics>) -> Self {
        Self { metrics }
    }

    /// Route one decoded data payload arriving at `now`
    ///
    /// Returns the number of handler invocations made.
    pub fn dispatch(
        &self,
        registry: &mut SubscriptionRegistry,
        buffer: &mut IngestBuffer,
        stream: &StreamId,
        payload: Value,
        now: Instant,
    ) -> usize {
        if !registry.contains(stream) {
            tracing::trace!(target: "ws", stream = %stream, "No handler, dropping frame");
            self.metrics.record_dropped();
            return 0;
        }

        match buffer.admit(stream, payload, now) {
            Admission::Deliver(batch) => self.deliver(registry, stream, batch),
            Admission::Buffered => {
                self.metrics.record_buffered();
                0
            }
        }
    }

    /// Invoke the handler for `stream` once per payload, in order
    pub fn deliver(
        &self,
        registry: &mut SubscriptionRegistry,
        stream: &StreamId,
        payloads: Vec<Value>,
    ) -> usize {
        let Some(handler) = registry.handler_mut(stream) else {
            self.metrics.record_dropped();
            return 0;
        };

        let mut delivered = 0;
        for payload in payloads {
            match invoke(handler, payload) {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    self.metrics.record_handler_fault();
                    tracing::error!(target: "ws", stream = %stream, %reason, "Handler panicked");
                }
            }
        }
        if delivered > 0 {
            self.metrics.record_delivered(delivered as u64);
        }
        delivered
    }
}

/// Call a handler, converting a panic into its message
pub fn invoke(handler: &mut Handler, payload: Value) -> Result<(), String> {
    panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).map_err(panic_message)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

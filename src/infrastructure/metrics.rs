//! Metrics collection for stream monitoring
//!
//! Lock-free counters using atomic operations.
//! Updated by the engine task, read through snapshots from any handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-client stream metrics
pub struct StreamMetrics {
    /// Text frames received from the transport
    frames_received: AtomicU64,
    /// Payloads handed to handlers
    payloads_delivered: AtomicU64,
    /// Payloads parked in the ingest buffer
    payloads_buffered: AtomicU64,
    /// Frames with no registered handler, or undecodable
    frames_dropped: AtomicU64,
    /// Handler panics caught at dispatch
    handler_faults: AtomicU64,
    /// Missed pong deadlines
    liveness_faults: AtomicU64,
    /// Reconnect attempts scheduled
    reconnect_attempts: AtomicU64,
    /// Sessions that reached Open
    sessions_opened: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

/// Metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub payloads_delivered: u64,
    pub payloads_buffered: u64,
    pub frames_dropped: u64,
    pub handler_faults: u64,
    pub liveness_faults: u64,
    pub reconnect_attempts: u64,
    pub sessions_opened: u64,
    pub delivery_rate: f64, // payloads per second
    pub uptime_seconds: u64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            payloads_delivered: AtomicU64::new(0),
            payloads_buffered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            handler_faults: AtomicU64::new(0),
            liveness_faults: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivered(&self, count: u64) {
        self.payloads_delivered.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_buffered(&self) {
        self.payloads_buffered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_liveness_fault(&self) {
        self.liveness_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let delivered = self.payloads_delivered.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs();
        let rate = if uptime > 0 {
            delivered as f64 / uptime as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            payloads_delivered: delivered,
            payloads_buffered: self.payloads_buffered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            liveness_faults: self.liveness_faults.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            delivery_rate: rate,
            uptime_seconds: uptime,
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

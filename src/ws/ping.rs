//! Heartbeat monitor for connection liveness
//!
//! Keeps the session honest by sending periodic ping frames and arming a
//! one-shot pong deadline. The monitor is pure timer state: the engine
//! sleeps until [`HeartbeatMonitor::next_ping_at`] or
//! [`HeartbeatMonitor::pong_deadline`] and reports back.

use crate::infrastructure::config::HeartbeatConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Outbound application-level ping
pub const PING_FRAME: &str = r#"{"method":"ping"}"#;

/// Shortest accepted ping interval
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Ping schedule and pong deadline for one session
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    /// How often to ping
    ping_interval: Duration,
    /// How long to wait for the pong
    pong_timeout: Duration,
    /// Recurring ping timer; None when stopped
    next_ping: Option<Instant>,
    /// One-shot pong deadline; None when disarmed
    pong_deadline: Option<Instant>,
    /// Pings sent since start
    pings_sent: u64,
}

impl HeartbeatMonitor {
    /// Intervals below [`MIN_PING_INTERVAL`] are raised to it
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval: ping_interval.max(MIN_PING_INTERVAL),
            pong_timeout,
            next_ping: None,
            pong_deadline: None,
            pings_sent: 0,
        }
    }

    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(config.ping_interval(), config.pong_timeout())
    }

    /// Arm the recurring ping timer
    pub fn start(&mut self, now: Instant) {
        self.next_ping = Some(now + self.ping_interval);
        self.pong_deadline = None;
        self.pings_sent = 0;
    }

    /// Clear both timers. Safe to call when nothing is armed.
    pub fn stop(&mut self) {
        self.next_ping = None;
        self.pong_deadline = None;
    }

    /// Ping timer fired
    ///
    /// Reschedules the next tick and returns true when a ping frame should be
    /// sent. The pong deadline is armed only if none is outstanding, so later
    /// pings never push an earlier deadline back.
    pub fn on_tick(&mut self, now: Instant, transport_open: bool) -> bool {
        let Some(due) = self.next_ping else {
            return false;
        };
        // Skip missed ticks instead of bursting
        let mut next = due + self.ping_interval;
        while next <= now {
            next += self.ping_interval;
        }
        self.next_ping = Some(next);

        if !transport_open {
            return false;
        }
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(now + self.pong_timeout);
        }
        self.pings_sent += 1;
        true
    }

    /// Pong received. Returns false for a stray pong (nothing armed).
    pub fn on_pong(&mut self) -> bool {
        self.pong_deadline.take().is_some()
    }

    /// Whether the armed deadline has passed
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.pong_deadline.is_some_and(|deadline| now >= deadline)
    }

    #[inline]
    pub fn next_ping_at(&self) -> Option<Instant> {
        self.next_ping
    }

    #[inline]
    pub fn pong_deadline(&self) -> Option<Instant> {
        self.pong_deadline
    }

    /// Whether any timer is armed
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.next_ping.is_some() || self.pong_deadline.is_some()
    }

    #[inline]
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn pong_timeout(&self) -> Duration {
        self.pong_timeout
    }
}

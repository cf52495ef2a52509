//! Reconnect backoff policy
//!
//! Exponential backoff capped at `max_delay`, with an attempt budget.
//! `delay(n) = min(base * 2^n, max)` where `n` is the 1-based attempt number,
//! optionally spread by a symmetric jitter fraction.

use crate::infrastructure::config::ReconnectConfig;
use std::time::Duration;

/// Observable backoff state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    /// Attempts scheduled since the last successful open
    pub attempt: u32,
    /// Delay the next attempt will wait (before jitter)
    pub next_delay: Duration,
}

/// Backoff schedule and attempt budget
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
    attempt: u32,
    rng_state: u64,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter: 0.0,
            attempt: 0,
            rng_state: seed(),
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
        .with_jitter(config.jitter)
    }

    /// Spread each delay by up to `±fraction` of itself
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Schedule the next attempt
    ///
    /// Returns `None` once the budget is spent; the attempt counter never
    /// moves past `max_attempts`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        let capped = self.delay_for(self.attempt);
        Some(self.apply_jitter(capped))
    }

    /// Back to `{0, base_delay}` after a successful open
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn state(&self) -> ReconnectState {
        ReconnectState {
            attempt: self.attempt,
            next_delay: if self.attempt == 0 {
                self.base_delay
            } else {
                self.delay_for(self.attempt + 1)
            },
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 seconds is far beyond any sane cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn apply_jitter(&mut self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset = (self.next_random() * 2.0 - 1.0) * spread;
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }

    /// xorshift64
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }
}

fn seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15)
        | 1
}

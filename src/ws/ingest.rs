//! Per-stream ingest throttle
//!
//! Each stream remembers when it last delivered. A payload arriving inside
//! `window` of that instant is parked; the next payload at or past the window
//! edge leaves together with the parked backlog, oldest first. Nothing is
//! dropped and a zero window degenerates to immediate delivery.
//!
//! Optionally the market-wide `!ticker@arr` stream bypasses the throttle and is
//! coalesced instead: array elements are merged into a latest-value-per-symbol
//! map that is flushed as one array on the next render tick.

use crate::core::{StreamId, StreamKind};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of offering one payload to the buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Deliver these payloads now, in order
    Deliver(Vec<Value>),
    /// Parked until the window reopens (or the render tick fires)
    Buffered,
}

#[derive(Debug, Default)]
struct Lane {
    last_delivered: Option<Instant>,
    pending: VecDeque<Value>,
}

/// Latest-value-per-symbol map for the ticker array stream
#[derive(Debug)]
struct SnapshotCoalescer {
    tick: Duration,
    flush_at: Option<Instant>,
    /// symbol → position in `latest`
    index: HashMap<String, usize>,
    /// First-seen order
    latest: Vec<Value>,
}

impl SnapshotCoalescer {
    fn new(tick: Duration) -> Self {
        Self {
            tick,
            flush_at: None,
            index: HashMap::new(),
            latest: Vec::new(),
        }
    }

    fn merge(&mut self, payload: Value, now: Instant) {
        let items = match payload {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            let key = item.get("s").and_then(Value::as_str).map(str::to_string);
            match key {
                Some(key) => match self.index.get(&key) {
                    Some(&pos) => self.latest[pos] = item,
                    None => {
                        self.index.insert(key, self.latest.len());
                        self.latest.push(item);
                    }
                },
                // Unkeyed entries cannot be coalesced; keep them all
                None => self.latest.push(item),
            }
        }
        if self.flush_at.is_none() {
            self.flush_at = Some(now + self.tick);
        }
    }

    fn take(&mut self) -> Option<Value> {
        self.flush_at = None;
        self.index.clear();
        if self.latest.is_empty() {
            return None;
        }
        Some(Value::Array(std::mem::take(&mut self.latest)))
    }

    fn clear(&mut self) {
        self.flush_at = None;
        self.index.clear();
        self.latest.clear();
    }
}

/// Per-stream throttle plus optional snapshot coalescing
#[derive(Debug)]
pub struct IngestBuffer {
    window: Duration,
    lanes: HashMap<StreamId, Lane>,
    snapshot: Option<SnapshotCoalescer>,
}

impl IngestBuffer {
    /// Throttle every stream with `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            lanes: HashMap::new(),
            snapshot: None,
        }
    }

    /// Coalesce `!ticker@arr` per symbol and flush it every `tick`
    pub fn with_snapshot_tick(mut self, tick: Duration) -> Self {
        self.snapshot = Some(SnapshotCoalescer::new(tick));
        self
    }

    /// Offer one payload for `stream` arriving at `now`
    pub fn admit(&mut self, stream: &StreamId, payload: Value, now: Instant) -> Admission {
        if stream.kind() == StreamKind::AllTickers {
            if let Some(snapshot) = self.snapshot.as_mut() {
                snapshot.merge(payload, now);
                return Admission::Buffered;
            }
        }

        let window = self.window;
        let lane = self.lanes.entry(stream.clone()).or_default();
        let throttled = lane
            .last_delivered
            .is_some_and(|last| now.saturating_duration_since(last) < window);

        if throttled {
            lane.pending.push_back(payload);
            return Admission::Buffered;
        }

        let mut batch: Vec<Value> = lane.pending.drain(..).collect();
        batch.push(payload);
        lane.last_delivered = Some(now);
        Admission::Deliver(batch)
    }

    /// When the snapshot coalescer wants to flush
    #[inline]
    pub fn next_flush_at(&self) -> Option<Instant> {
        self.snapshot.as_ref().and_then(|s| s.flush_at)
    }

    /// Render tick fired: the coalesced ticker array, if any
    pub fn flush_snapshot(&mut self) -> Option<Value> {
        self.snapshot.as_mut().and_then(SnapshotCoalescer::take)
    }

    /// Drop all state for one stream (unsubscribe)
    pub fn forget(&mut self, stream: &StreamId) {
        self.lanes.remove(stream);
        if stream.kind() == StreamKind::AllTickers {
            if let Some(snapshot) = self.snapshot.as_mut() {
                snapshot.clear();
            }
        }
    }

    /// Drop everything (close)
    pub fn clear(&mut self) {
        self.lanes.clear();
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.clear();
        }
    }

    /// Payloads parked for `stream`
    pub fn pending_len(&self, stream: &StreamId) -> usize {
        self.lanes.get(stream).map_or(0, |lane| lane.pending.len())
    }

    /// Whether anything at all is parked
    pub fn is_empty(&self) -> bool {
        self.lanes.values().all(|lane| lane.pending.is_empty())
            && self.snapshot.as_ref().map_or(true, |s| s.latest.is_empty())
    }
}

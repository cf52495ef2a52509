//! Subscription registry and control frames
//!
//! The registry is the authoritative StreamId → handler map. It survives
//! reconnects: after every open the engine replays `all()` as one bulk
//! SUBSCRIBE so the feed converges back to it.

use crate::core::StreamId;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Consumer callback, owned by the engine task
pub type Handler = Box<dyn FnMut(Value) + Send + 'static>;

/// Control request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlMethod {
    Subscribe,
    Unsubscribe,
}

/// `{"method":..,"params":[..],"id":N}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlRequest {
    pub method: ControlMethod,
    pub params: Vec<String>,
    pub id: u64,
}

impl ControlRequest {
    pub fn subscribe<'a>(streams: impl IntoIterator<Item = &'a StreamId>, id: u64) -> Self {
        Self {
            method: ControlMethod::Subscribe,
            params: streams.into_iter().map(|s| s.as_str().to_string()).collect(),
            id,
        }
    }

    pub fn unsubscribe<'a>(streams: impl IntoIterator<Item = &'a StreamId>, id: u64) -> Self {
        Self {
            method: ControlMethod::Unsubscribe,
            params: streams.into_iter().map(|s| s.as_str().to_string()).collect(),
            id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Request correlation ids, monotonically increasing per client
#[derive(Debug, Clone)]
pub struct RequestIds {
    next: u64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// StreamId → handler map with stable insertion order
#[derive(Default)]
pub struct SubscriptionRegistry {
    /// Registration order, used for bulk replay
    order: Vec<StreamId>,
    handlers: HashMap<StreamId, Handler>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handler for `stream`
    ///
    /// Returns true if the stream was not registered before (the caller owes
    /// the feed an incremental SUBSCRIBE). A replacement keeps the original
    /// position in replay order.
    pub fn subscribe(&mut self, stream: StreamId, handler: Handler) -> bool {
        match self.handlers.insert(stream.clone(), handler) {
            Some(_) => false,
            None => {
                self.order.push(stream);
                true
            }
        }
    }

    /// Remove `stream`; returns true if it was registered
    pub fn unsubscribe(&mut self, stream: &StreamId) -> bool {
        if self.handlers.remove(stream).is_none() {
            return false;
        }
        self.order.retain(|s| s != stream);
        true
    }

    /// All registered streams in registration order
    pub fn all(&self) -> Vec<StreamId> {
        self.order.clone()
    }

    #[inline]
    pub fn contains(&self, stream: &StreamId) -> bool {
        self.handlers.contains_key(stream)
    }

    #[inline]
    pub fn handler_mut(&mut self, stream: &StreamId) -> Option<&mut Handler> {
        self.handlers.get_mut(stream)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.handlers.clear();
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("streams", &self.order)
            .finish()
    }
}

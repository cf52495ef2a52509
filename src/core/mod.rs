//! Core types shared by the streaming client
//!
//! - StreamId: canonical stream key (channel + lowercased symbol)
//! - Frame: decoded transport payload

pub mod frame;
pub mod stream_id;

pub use frame::{decode, Frame, FrameError};
pub use stream_id::{StreamId, StreamKind, ALL_TICKERS};

//! Inbound frame decoding
//!
//! Turns one transport text payload into a [`Frame`]. Data frames carry the
//! reconstructed [`StreamId`] and the exact payload a handler receives:
//! - kline: the `k` sub-object, unmodified
//! - 24hrTicker: the whole event object
//! - array frame: the market-wide ticker array
//! - combined-stream envelope `{"stream":..,"data":..}`: id from `stream`,
//!   payload extracted from `data` by the same rules

use crate::core::stream_id::{StreamId, StreamKind};
use serde_json::{Map, Value};

/// One decoded unit of transport payload
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Liveness acknowledgment (`{"type":"pong"}`)
    Pong,
    /// Control request accepted (`{"result":null,"id":N}`)
    Ack { id: u64 },
    /// Control request rejected (`{"error":{..},"id":N}`)
    Rejected { id: Option<u64>, error: Value },
    /// Market data for one stream
    Data { stream: StreamId, payload: Value },
    /// Well-formed but not something we route
    Unknown,
}

/// Frame decoding errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Malformed JSON: {0}")]
    Json(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// Decode a text payload
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    // simd-json parses in place
    let mut bytes = text.as_bytes().to_vec();
    let value: Value =
        simd_json::serde::from_slice(&mut bytes).map_err(|e| FrameError::Json(e.to_string()))?;
    classify(value)
}

/// Classify an already-parsed JSON value
pub fn classify(value: Value) -> Result<Frame, FrameError> {
    match value {
        Value::Array(items) => Ok(Frame::Data {
            stream: StreamId::all_tickers(),
            payload: Value::Array(items),
        }),
        Value::Object(map) => classify_object(map),
        _ => Ok(Frame::Unknown),
    }
}

fn classify_object(mut map: Map<String, Value>) -> Result<Frame, FrameError> {
    if map.get("type").and_then(Value::as_str) == Some("pong") {
        return Ok(Frame::Pong);
    }

    let envelope = map
        .get("stream")
        .and_then(Value::as_str)
        .and_then(StreamId::parse);
    if let Some(stream) = envelope {
        if let Some(data) = map.remove("data") {
            let payload = unwrap_payload(&stream, data);
            return Ok(Frame::Data { stream, payload });
        }
    }

    if let Some(error) = map.remove("error") {
        let id = map.get("id").and_then(Value::as_u64);
        return Ok(Frame::Rejected { id, error });
    }
    if map.contains_key("result") {
        return match map.get("id").and_then(Value::as_u64) {
            Some(id) => Ok(Frame::Ack { id }),
            None => Ok(Frame::Unknown),
        };
    }

    match map.get("e").and_then(Value::as_str) {
        Some("kline") => {
            let symbol = map
                .get("s")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("s"))?
                .to_string();
            let kline = map.remove("k").ok_or(FrameError::MissingField("k"))?;
            let interval = kline
                .get("i")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("k.i"))?;
            let stream =
                StreamId::kline(&symbol, interval).ok_or(FrameError::MissingField("s"))?;
            Ok(Frame::Data { stream, payload: kline })
        }
        Some("24hrTicker") => {
            let stream = map
                .get("s")
                .and_then(Value::as_str)
                .and_then(StreamId::ticker)
                .ok_or(FrameError::MissingField("s"))?;
            Ok(Frame::Data {
                stream,
                payload: Value::Object(map),
            })
        }
        _ => Ok(Frame::Unknown),
    }
}

fn unwrap_payload(stream: &StreamId, mut data: Value) -> Value {
    if stream.kind() == StreamKind::Kline {
        if let Some(kline) = data.as_object_mut().and_then(|m| m.remove("k")) {
            return kline;
        }
    }
    data
}

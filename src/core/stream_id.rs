//! Canonical stream identifiers
//!
//! A `StreamId` is the only correlation key between subscribe requests,
//! inbound frames and registered handlers. Symbols are always lowercased.

use std::fmt;

/// Market-wide 24h ticker array stream
pub const ALL_TICKERS: &str = "!ticker@arr";

/// Stream channel class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// `<symbol>@kline_<interval>`
    Kline,
    /// `<symbol>@ticker`
    Ticker,
    /// `!ticker@arr`
    AllTickers,
    /// Anything else the feed multiplexes (depth, trades, ...)
    Other,
}

/// Canonical stream key, e.g. `btcusdt@kline_1m`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Candle stream for `symbol` at `interval`
    ///
    /// Returns `None` for an empty symbol or interval.
    pub fn kline(symbol: &str, interval: &str) -> Option<Self> {
        let symbol = normalize_symbol(symbol)?;
        let interval = interval.trim();
        if interval.is_empty() {
            return None;
        }
        Some(Self(format!("{symbol}@kline_{interval}")))
    }

    /// 24h rolling ticker stream for `symbol`
    pub fn ticker(symbol: &str) -> Option<Self> {
        let symbol = normalize_symbol(symbol)?;
        Some(Self(format!("{symbol}@ticker")))
    }

    /// Market-wide ticker array stream
    pub fn all_tickers() -> Self {
        Self(ALL_TICKERS.to_string())
    }

    /// Parse a raw stream name, lowercasing the symbol part
    ///
    /// Interval suffixes keep their case (`1M` is a month, `1m` a minute).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.starts_with('!') {
            return Some(Self(raw.to_string()));
        }
        match raw.split_once('@') {
            Some((symbol, channel)) if !channel.is_empty() => {
                let symbol = normalize_symbol(symbol)?;
                Some(Self(format!("{symbol}@{channel}")))
            }
            _ => None,
        }
    }

    /// Channel class of this stream
    pub fn kind(&self) -> StreamKind {
        if self.0 == ALL_TICKERS {
            return StreamKind::AllTickers;
        }
        match self.0.split_once('@') {
            Some((_, channel)) if channel.starts_with("kline_") => StreamKind::Kline,
            Some((_, "ticker")) => StreamKind::Ticker,
            _ => StreamKind::Other,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn normalize_symbol(symbol: &str) -> Option<String> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return None;
    }
    Some(symbol.to_ascii_lowercase())
}

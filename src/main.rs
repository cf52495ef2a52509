//! Demo client: streams the configured subscriptions until Ctrl-C
//!
//! # Architecture
//! - **core**: StreamId and frame decoding
//! - **ws**: Transport, heartbeat, backoff, registry, throttle, dispatch
//! - **engine**: Connection state machine (one task per client)
//! - **infrastructure**: Cold path (logging, metrics, config)

use anyhow::Context;
use market_stream::infrastructure::logging::init_logging;
use market_stream::infrastructure::SubscriptionSpec;
use market_stream::{log_ws, Config, MarketStream, StreamId};
use serde_json::Value;
use tracing::Level;

fn delivery_logger(label: String) -> impl FnMut(Value) + Send + 'static {
    let mut seen: u64 = 0;
    move |payload| {
        seen += 1;
        let close = payload.get("c").and_then(Value::as_str).unwrap_or("-");
        log_ws!(Level::DEBUG, stream = %label, seen, close, "Payload delivered");
    }
}

fn subscribe(client: &MarketStream, spec: &SubscriptionSpec) -> market_stream::Result<StreamId> {
    match spec {
        SubscriptionSpec::Candles { symbol, interval } => client.subscribe_candles(
            symbol,
            interval,
            delivery_logger(format!("{}@kline_{}", symbol, interval)),
        ),
        SubscriptionSpec::Ticker { symbol } => {
            client.subscribe_ticker(symbol, delivery_logger(format!("{}@ticker", symbol)))
        }
        SubscriptionSpec::AllTickers => client.subscribe_all_tickers(|batch: Value| {
            let symbols = batch.as_array().map_or(0, Vec::len);
            log_ws!(Level::DEBUG, symbols, "Ticker snapshot delivered");
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guards = init_logging("logs").context("failed to initialize logging")?;

    let config = Config::load().context("failed to load config")?;
    let specs = if config.subscriptions.is_empty() {
        vec![SubscriptionSpec::Ticker {
            symbol: "btcusdt".to_string(),
        }]
    } else {
        config.subscriptions.clone()
    };

    let client = MarketStream::new(config)?;
    for spec in &specs {
        let stream = subscribe(&client, spec)?;
        tracing::info!(stream = %stream, "Subscribed");
    }
    client.connect()?;
    tracing::info!(client = %client.id(), "Streaming; press Ctrl-C to stop");

    let mut states = client.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!(%state, "Connection state");
            }
        }
    }

    client.close().await?;
    let metrics = client.metrics();
    tracing::info!(
        delivered = metrics.payloads_delivered,
        dropped = metrics.frames_dropped,
        reconnects = metrics.reconnect_attempts,
        uptime_s = metrics.uptime_seconds,
        "Shut down"
    );
    Ok(())
}

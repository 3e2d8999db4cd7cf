// =============================================================================
// Live Tick Feed — WebSocket subscription per symbol
// =============================================================================
//
// Each subscription owns a background task that keeps one WebSocket open to
// `{stream_url}/{symbol}`, parses tick payloads and forwards them over an
// mpsc channel.  On error or stream end it reconnects after a fixed delay;
// it exits once the receiving side is dropped.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::market_data::candle::Tick;

/// Buffered ticks per subscription before the socket reader backs off.
const CHANNEL_CAPACITY: usize = 4096;

#[async_trait]
pub trait TickFeed: Send + Sync {
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>>;
}

pub struct WsTickFeed {
    stream_url: String,
    reconnect_delay: Duration,
}

impl WsTickFeed {
    pub fn new(stream_url: impl Into<String>, reconnect_delay_secs: u64) -> Self {
        Self {
            stream_url: stream_url.into().trim_end_matches('/').to_string(),
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
        }
    }
}

#[async_trait]
impl TickFeed for WsTickFeed {
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let url = format!("{}/{}", self.stream_url, symbol);
        let symbol = symbol.to_string();
        let delay = self.reconnect_delay;

        tokio::spawn(async move {
            while !tx.is_closed() {
                if let Err(e) = run_tick_stream(&url, &symbol, &tx).await {
                    error!(symbol = %symbol, error = %e, "tick stream error, reconnecting");
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
            info!(symbol = %symbol, "tick subscription closed");
        });

        Ok(rx)
    }
}

/// Read one WebSocket session until it ends or the receiver goes away.
async fn run_tick_stream(url: &str, symbol: &str, tx: &mpsc::Sender<Tick>) -> Result<()> {
    info!(url = %url, symbol = %symbol, "connecting to tick WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to tick WebSocket")?;

    info!(symbol = %symbol, "tick WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_ticks(&text) {
                Ok(ticks) => {
                    for tick in ticks {
                        if !tick.symbol.eq_ignore_ascii_case(symbol) {
                            continue;
                        }
                        if tx.send(tick).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "failed to parse tick message"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(e).context("tick WebSocket read error");
            }
            None => {
                warn!(symbol = %symbol, "tick WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// A message carries either one tick payload or an array of them.
fn parse_ticks(text: &str) -> Result<Vec<Tick>> {
    let root: Value = serde_json::from_str(text).context("failed to parse tick JSON")?;
    let arr = root.as_array().context("tick message is not an array")?;
    if arr.first().map_or(false, Value::is_array) {
        arr.iter().map(Tick::from_wire).collect()
    } else {
        Ok(vec![Tick::from_wire(&root)?])
    }
}

/// In-process feed: tests push ticks through the returned senders.
#[cfg(test)]
pub struct ChannelTickFeed {
    pending: parking_lot::Mutex<std::collections::HashMap<String, mpsc::Receiver<Tick>>>,
}

#[cfg(test)]
impl ChannelTickFeed {
    pub fn new() -> Self {
        Self {
            pending: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn sender(&self, symbol: &str) -> mpsc::Sender<Tick> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.pending.lock().insert(symbol.to_string(), rx);
        tx
    }
}

#[cfg(test)]
#[async_trait]
impl TickFeed for ChannelTickFeed {
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>> {
        self.pending
            .lock()
            .remove(symbol)
            .with_context(|| format!("no channel registered for {symbol}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_batched_payloads() {
        let one = r#"["a005930", 1000, "71000", "3", "b", "n"]"#;
        assert_eq!(parse_ticks(one).unwrap().len(), 1);

        let many = r#"[
            ["a005930", 1000, "71000", "3", "b", "n"],
            ["a005930", 1001, "71100", "1", "s", "pb"]
        ]"#;
        let ticks = parse_ticks(many).unwrap();
        assert_eq!(ticks.len(), 2);
        assert!(ticks[1].is_sell);

        assert!(parse_ticks(r#"{"e":"trade"}"#).is_err());
        assert!(parse_ticks("not json").is_err());
    }

    #[tokio::test]
    async fn channel_feed_hands_out_registered_receiver_once() {
        let feed = ChannelTickFeed::new();
        let tx = feed.sender("a005930");
        let mut rx = feed.subscribe("a005930").await.unwrap();
        tx.send(Tick::from_wire(&serde_json::json!(["a005930", 1, "1", "1", "b", "n"])).unwrap())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().event_time, 1);
        assert!(feed.subscribe("a005930").await.is_err());
    }
}

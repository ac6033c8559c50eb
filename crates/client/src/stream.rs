use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};
use url::Url;

use common::{Error, OrderSide, Result, TickRecord};

const WS_URL: &str = "wss://ws.kraken.com/";

/// A live trade published on the public `trade` channel.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    /// WebSocket pair name, e.g. `ETH/USD`.
    pub pair: String,
    pub tick: TickRecord,
    pub side: OrderSide,
}

/// Public trade WebSocket stream for a single pair.
///
/// Subscribes to the `trade` channel, parses each batch into `TradeEvent`s
/// and publishes them on a broadcast channel. Reconnects automatically with
/// exponential backoff.
pub struct TradeStream {
    wsname: String,
    trade_tx: broadcast::Sender<TradeEvent>,
}

impl TradeStream {
    pub fn new(wsname: impl Into<String>, trade_tx: broadcast::Sender<TradeEvent>) -> Self {
        Self {
            wsname: wsname.into(),
            trade_tx,
        }
    }

    /// Run the stream loop forever, reconnecting on failure.
    /// Call this inside a `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            info!(pair = %self.wsname, "Connecting to trade stream");
            match self.connect_once().await {
                Ok(()) => {
                    info!(pair = %self.wsname, "Trade stream closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(pair = %self.wsname, error = %e, backoff = ?backoff, "Trade stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = Url::parse(WS_URL).map_err(|e| Error::WebSocket(e.to_string()))?;
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let payload = json!({
            "event": "subscribe",
            "pair": [self.wsname],
            "subscription": { "name": "trade" }
        });
        futures_util::SinkExt::send(
            &mut write,
            tokio_tungstenite::tungstenite::Message::Text(payload.to_string()),
        )
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))?;

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;

            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                match parse_trade_message(&text) {
                    Ok(events) => {
                        for event in events {
                            // Ignore send errors (no active receivers)
                            let _ = self.trade_tx.send(event);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to parse trade message");
                    }
                }
            }
        }

        Ok(())
    }
}

// ─── Trade channel JSON parsing ──────────────────────────────────────────────

/// Trade payloads arrive as
/// `[channel_id, [[price, volume, time, side, ordertype, misc], ...], "trade", wsname]`.
/// Heartbeats and subscription acks are objects and are skipped.
fn parse_trade_message(text: &str) -> Result<Vec<TradeEvent>> {
    let value: Value = serde_json::from_str(text)?;
    let Some(parts) = value.as_array() else {
        return Ok(Vec::new()); // event object (heartbeat / subscriptionStatus)
    };
    if parts.get(2).and_then(Value::as_str) != Some("trade") {
        return Ok(Vec::new());
    }

    let pair = parts
        .get(3)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let rows = parts
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::WebSocket("trade message without rows".to_string()))?;

    rows.iter()
        .map(|row| {
            let malformed = || Error::WebSocket(format!("malformed trade row: {row}"));
            let price = row
                .get(0)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(malformed)?;
            let volume = row
                .get(1)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(malformed)?;
            // The websocket sends the timestamp as a decimal string.
            let timestamp = match row.get(2) {
                Some(Value::String(s)) => s.parse::<f64>().ok(),
                Some(Value::Number(n)) => n.as_f64(),
                _ => None,
            }
            .ok_or_else(malformed)?;
            let side = match row.get(3).and_then(Value::as_str) {
                Some("s") => OrderSide::Sell,
                _ => OrderSide::Buy,
            };

            Ok(TradeEvent {
                pair: pair.clone(),
                tick: TickRecord { timestamp, price, volume },
                side,
            })
        })
        .collect()
}

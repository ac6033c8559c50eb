use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use common::{
    BookLevel, Error, GenesisProbe, Result, SystemStatus, TickRecord, TopOfBook, TradeFetcher,
    TradePage,
};

use crate::sign::{sign_request, NonceCounter};

const BASE_URL: &str = "https://api.kraken.com";

/// Daily candles; used only by the genesis probe.
const OHLC_INTERVAL_DAILY: u32 = 1440;

/// REST client for the Kraken public and private APIs.
///
/// All responses arrive in a `{ "error": [...], "result": {...} }` envelope.
/// A non-empty `error` array is classified through `Error::from_remote` so
/// transient server conditions stay distinguishable from fatal ones.
pub struct KrakenClient {
    http: Client,
    credentials: Option<Credentials>,
    nonce: NonceCounter,
}

struct Credentials {
    api_key: String,
    private_key: String,
}

/// Condensed ticker snapshot for one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

impl<T> Envelope<T> {
    fn into_result(self) -> Result<T> {
        if !self.error.is_empty() {
            return Err(Error::from_remote(&self.error));
        }
        self.result
            .ok_or_else(|| Error::Exchange("response carried no result".to_string()))
    }
}

impl KrakenClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
            credentials: None,
            nonce: NonceCounter::new(),
        }
    }

    /// Client with credentials for private endpoints.
    pub fn with_credentials(api_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        let mut client = Self::new();
        client.credentials = Some(Credentials {
            api_key: api_key.into(),
            private_key: private_key.into(),
        });
        client
    }

    pub(crate) async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{BASE_URL}/0/public/{endpoint}");
        let resp = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let envelope: Envelope<T> = resp.json().await.map_err(|e| Error::Http(e.to_string()))?;
        envelope.into_result()
    }

    /// Signed POST to a private endpoint. `fields` must not include the nonce.
    pub(crate) async fn private_post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        fields: &[(&str, String)],
    ) -> Result<T> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            Error::Config("private endpoint called without credentials".to_string())
        })?;

        let path = format!("/0/private/{endpoint}");
        let nonce = self.nonce.next();

        let body = {
            let mut body = url::form_urlencoded::Serializer::new(String::new());
            body.append_pair("nonce", &nonce.to_string());
            for (key, value) in fields {
                body.append_pair(key, value);
            }
            body.finish()
        };

        let signature = sign_request(&path, nonce, &body, &creds.private_key)?;

        debug!(endpoint, nonce, "Signed private call");
        let resp = self
            .http
            .post(format!("{BASE_URL}{path}"))
            .header("API-Key", &creds.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let envelope: Envelope<T> = resp.json().await.map_err(|e| Error::Http(e.to_string()))?;
        envelope.into_result()
    }

    /// Exchange server time as a unix timestamp.
    pub async fn server_time(&self) -> Result<u64> {
        #[derive(Deserialize)]
        struct ServerTime {
            unixtime: u64,
        }
        let time: ServerTime = self.public_get("Time", &[]).await?;
        Ok(time.unixtime)
    }

    /// Current exchange operational mode.
    pub async fn system_status(&self) -> Result<SystemStatus> {
        #[derive(Deserialize)]
        struct Status {
            status: SystemStatus,
        }
        let status: Status = self.public_get("SystemStatus", &[]).await?;
        Ok(status.status)
    }

    /// Last trade price, best bid and best ask for `pair`.
    pub async fn ticker(&self, pair: &str) -> Result<Ticker> {
        let result: Value = self
            .public_get("Ticker", &[("pair", pair.to_string())])
            .await?;
        parse_ticker(pair, &result)
    }

    /// Full order book for `pair`, truncated to `count` levels per side.
    pub async fn depth(&self, pair: &str, count: u32) -> Result<(Vec<BookLevel>, Vec<BookLevel>)> {
        let result: Value = self
            .public_get(
                "Depth",
                &[("pair", pair.to_string()), ("count", count.to_string())],
            )
            .await?;
        let book = result
            .get(pair)
            .ok_or_else(|| Error::Exchange(format!("no depth returned for {pair}")))?;

        let parse_side = |side: &str| -> Result<Vec<BookLevel>> {
            book.get(side)
                .and_then(Value::as_array)
                .map(|rows| rows.iter().map(parse_book_level).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        };

        Ok((parse_side("asks")?, parse_side("bids")?))
    }
}

impl Default for KrakenClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeFetcher for KrakenClient {
    async fn fetch_page(&self, pair: &str, since: Option<u64>) -> Result<TradePage> {
        let mut params = vec![("pair", pair.to_string())];
        if let Some(cursor) = since {
            params.push(("since", cursor.to_string()));
        }

        let result: Value = self.public_get("Trades", &params).await?;
        parse_trade_page(pair, &result)
    }
}

#[async_trait]
impl GenesisProbe for KrakenClient {
    async fn earliest_trade_time(&self, pair: &str) -> Result<f64> {
        let result: Value = self
            .public_get(
                "OHLC",
                &[
                    ("pair", pair.to_string()),
                    ("interval", OHLC_INTERVAL_DAILY.to_string()),
                    ("since", "0".to_string()),
                ],
            )
            .await?;

        result
            .get(pair)
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get(0))
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::Exchange(format!("no candle history returned for {pair}")))
    }
}

#[async_trait]
impl TopOfBook for KrakenClient {
    async fn best_ask(&self, pair: &str) -> Result<Option<BookLevel>> {
        let (asks, _) = self.depth(pair, 1).await?;
        Ok(asks.into_iter().next())
    }

    async fn best_bid(&self, pair: &str) -> Result<Option<BookLevel>> {
        let (_, bids) = self.depth(pair, 1).await?;
        Ok(bids.into_iter().next())
    }
}

// ─── Wire format parsing ──────────────────────────────────────────────────────

/// Raw trade rows come as `[price, volume, time, side, ordertype, misc]`
/// with price/volume as strings. Only the first three columns survive into
/// a `TickRecord`.
fn parse_trade_row(row: &Value) -> Result<TickRecord> {
    let malformed = || Error::Exchange(format!("malformed trade row: {row}"));

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
    let timestamp = row.get(2).and_then(Value::as_f64).ok_or_else(malformed)?;

    Ok(TickRecord { timestamp, price, volume })
}

fn parse_book_level(row: &Value) -> Result<BookLevel> {
    let malformed = || Error::Exchange(format!("malformed book level: {row}"));

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
    let timestamp = row.get(2).and_then(Value::as_f64).unwrap_or(0.0);

    Ok(BookLevel { price, volume, timestamp })
}

/// Ticker fields arrive as string arrays; `c`/`b`/`a` carry the last trade,
/// best bid and best ask with the price first.
fn parse_ticker(pair: &str, result: &Value) -> Result<Ticker> {
    let info = result
        .get(pair)
        .ok_or_else(|| Error::Exchange(format!("no ticker returned for {pair}")))?;

    let first_of = |field: &str| -> Result<f64> {
        info.get(field)
            .and_then(|v| v.get(0))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| Error::Exchange(format!("malformed ticker field '{field}'")))
    };

    Ok(Ticker {
        last: first_of("c")?,
        bid: first_of("b")?,
        ask: first_of("a")?,
    })
}

fn parse_trade_page(pair: &str, result: &Value) -> Result<TradePage> {
    let rows = result
        .get(pair)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Exchange(format!("no trades returned for {pair}")))?;

    let records = rows
        .iter()
        .map(parse_trade_row)
        .collect::<Result<Vec<_>>>()?;

    // "last" arrives as a stringified nanosecond timestamp.
    let next_cursor = result
        .get("last")
        .and_then(|v| match v {
            Value::String(s) => s.parse::<u64>().ok(),
            Value::Number(n) => n.as_u64(),
            _ => None,
        })
        .ok_or_else(|| Error::Exchange("missing 'last' cursor in trades response".to_string()))?;

    Ok(TradePage { records, next_cursor })
}

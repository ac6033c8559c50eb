use serde::{Deserialize, Serialize};

/// A single executed trade as reported by the exchange's `Trades` endpoint.
/// Immutable once stored. Identity within a ledger is `(pair, timestamp)`,
/// but two distinct trades may legitimately share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Unix seconds, exchange-provided, sub-second precision.
    pub timestamp: f64,
    pub price: f64,
    pub volume: f64,
}

/// One page of trade history plus the continuation cursor.
#[derive(Debug, Clone)]
pub struct TradePage {
    /// Records in exchange (chronological) order.
    pub records: Vec<TickRecord>,
    /// Opaque "last" cursor: nanosecond-scaled unix timestamp.
    pub next_cursor: u64,
}

impl TradePage {
    pub fn page_size(&self) -> usize {
        self.records.len()
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order type subset supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrderKind {
    #[default]
    Market,
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "market"),
            OrderKind::Limit => write!(f, "limit"),
        }
    }
}

/// Explicit request-parameter struct for order submission.
/// Optional fields are serialized only when present.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Canonical pair name (e.g. `XETHZUSD`).
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Base-currency volume.
    pub volume: f64,
    /// Limit price; `None` for market orders.
    pub price: Option<f64>,
    pub leverage: Option<u32>,
    /// When true the exchange validates the order without booking it.
    pub validate: bool,
}

impl OrderRequest {
    pub fn market(pair: impl Into<String>, side: OrderSide, volume: f64) -> Self {
        Self {
            pair: pair.into(),
            side,
            kind: OrderKind::Market,
            volume,
            price: None,
            leverage: None,
            validate: false,
        }
    }

    pub fn limit(pair: impl Into<String>, side: OrderSide, volume: f64, price: f64) -> Self {
        Self {
            pair: pair.into(),
            side,
            kind: OrderKind::Limit,
            volume,
            price: Some(price),
            leverage: None,
            validate: false,
        }
    }
}

/// Confirmation of a submitted order returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmation {
    /// Exchange transaction ids (empty in validate-only mode).
    pub txid: Vec<String>,
    pub pair: String,
    pub side: OrderSide,
    /// Requested base-currency volume.
    pub volume: f64,
    /// Execution price used for notional accounting.
    pub price: f64,
    /// Filled notional in quote currency (price × volume).
    pub cost: f64,
    /// Human-readable order description from the exchange.
    pub descr: String,
}

/// Resolved metadata for a trading pair, assembled by the pair catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairInfo {
    /// Canonical exchange name, e.g. `XETHZUSD`.
    pub name: String,
    /// Alternate name, e.g. `ETHUSD`. Used for ledger table naming.
    pub altname: String,
    /// WebSocket name, e.g. `ETH/USD`. Not every pair has one.
    pub wsname: Option<String>,
    /// Scaling decimal places for quote-currency prices.
    pub pair_decimals: u32,
    /// Scaling decimal places for base-currency volume.
    pub lot_decimals: u32,
    /// Minimum order volume in base currency.
    pub ordermin: f64,
    /// Minimum order cost in quote currency.
    pub costmin: f64,
}

/// One visible order book level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub volume: f64,
    pub timestamp: f64,
}

impl BookLevel {
    /// Quote-currency value of the visible volume at this level.
    pub fn notional(&self) -> f64 {
        self.price * self.volume
    }
}

/// Exchange operational mode from the `SystemStatus` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Online,
    Maintenance,
    CancelOnly,
    PostOnly,
    LimitOnly,
}

impl SystemStatus {
    /// Whether market orders can currently be placed.
    pub fn accepts_orders(self) -> bool {
        self == SystemStatus::Online
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemStatus::Online => write!(f, "online"),
            SystemStatus::Maintenance => write!(f, "maintenance"),
            SystemStatus::CancelOnly => write!(f, "cancel_only"),
            SystemStatus::PostOnly => write!(f, "post_only"),
            SystemStatus::LimitOnly => write!(f, "limit_only"),
        }
    }
}

/// Round `value` down to `decimals` decimal places.
/// The exchange rejects volumes with more precision than the pair allows.
pub fn round_down(value: f64, decimals: u32) -> f64 {
    let multiplier = 10f64.powi(decimals as i32);
    (value * multiplier).floor() / multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_down_truncates_excess_precision() {
        assert_eq!(round_down(1.23456789, 4), 1.2345);
        assert_eq!(round_down(0.999999, 2), 0.99);
        assert_eq!(round_down(10.0, 8), 10.0);
    }

    #[test]
    fn round_down_zero_decimals_floors() {
        assert_eq!(round_down(7.9, 0), 7.0);
    }

    #[test]
    fn book_level_notional() {
        let level = BookLevel { price: 2000.0, volume: 0.5, timestamp: 0.0 };
        assert_eq!(level.notional(), 1000.0);
    }
}

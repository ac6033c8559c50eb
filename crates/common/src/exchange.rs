use async_trait::async_trait;

use crate::{BookLevel, OrderConfirmation, OrderRequest, Result, TradePage};

/// Paginated access to a pair's trade history.
///
/// `KrakenClient` implements this against the public `Trades` endpoint.
/// The synchronizer only ever talks to this trait, which keeps its state
/// machine testable without a network.
#[async_trait]
pub trait TradeFetcher: Send + Sync {
    /// Fetch one page of trades for `pair` starting at `since`
    /// (nanosecond-scaled unix timestamp). `None` returns the most recent
    /// page only, with no resume intent. At most 1000 records per page.
    ///
    /// Transient server conditions surface as `Error::Transient`; any other
    /// remote error is fatal to the current synchronization run.
    async fn fetch_page(&self, pair: &str, since: Option<u64>) -> Result<TradePage>;
}

/// Locates the earliest available trade time for a pair.
///
/// Backfill does not page from the very first trade to find its starting
/// point; a daily-candle probe is far cheaper against the call budget.
#[async_trait]
pub trait GenesisProbe: Send + Sync {
    /// Earliest trade timestamp (unix seconds) the exchange has for `pair`.
    async fn earliest_trade_time(&self, pair: &str) -> Result<f64>;
}

/// Live top-of-book access used by the notional walker.
#[async_trait]
pub trait TopOfBook: Send + Sync {
    async fn best_ask(&self, pair: &str) -> Result<Option<BookLevel>>;
    async fn best_bid(&self, pair: &str) -> Result<Option<BookLevel>>;
}

/// Validated order submission.
///
/// Only the book walker and direct order helpers call this. A rejection is
/// fatal to the current walk; already-submitted orders are never undone.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit(&self, request: &OrderRequest) -> Result<OrderConfirmation>;
}

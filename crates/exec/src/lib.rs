use std::sync::Arc;

use tracing::{debug, info, warn};

use common::{
    round_down, BookLevel, OrderConfirmation, OrderGateway, OrderRequest, OrderSide, PairInfo,
    Result, TopOfBook,
};

/// Why a notional walk stopped. Early termination is an expected outcome,
/// not an error; partial execution is reported, never rolled back.
#[derive(Debug, Clone, PartialEq)]
pub enum WalkTermination {
    /// Remaining notional fell below the pair's minimum order cost.
    NotionalExhausted,
    /// Price drifted beyond the configured bound from the walk's
    /// reference price.
    SlippageExceeded,
    /// No visible liquidity left at the top of book.
    BookExhausted,
    /// An order submission failed; already-filled orders stand.
    OrderFailed(String),
}

/// Result of one walk: the confirmations collected, in submission order,
/// and the reason the walk stopped.
#[derive(Debug, Clone)]
pub struct WalkOutcome {
    pub confirmations: Vec<OrderConfirmation>,
    pub termination: WalkTermination,
}

impl WalkOutcome {
    /// Total quote-currency notional actually filled.
    pub fn filled_notional(&self) -> f64 {
        self.confirmations.iter().map(|c| c.cost).sum()
    }
}

/// Sweeps the top of the order book with bounded market-order slices until
/// a target quote-currency amount is spent.
///
/// One large market order against a thin book realizes a far worse average
/// price than taking the book level by level, so each slice is clipped to
/// the visible top-of-book volume. This is bounded greedy execution, not an
/// optimal schedule.
pub struct BookWalker {
    book: Arc<dyn TopOfBook>,
    gateway: Arc<dyn OrderGateway>,
}

impl BookWalker {
    pub fn new(book: Arc<dyn TopOfBook>, gateway: Arc<dyn OrderGateway>) -> Self {
        Self { book, gateway }
    }

    /// Spend up to `notional` quote currency on `pair` with market orders.
    ///
    /// The reference price is captured from the top of book when the walk
    /// begins (best ask for a buy, best bid for a sell); when `max_slippage`
    /// is set, the walk stops as soon as the current price drifts more than
    /// that fraction from the reference. Remaining notional decreases by the
    /// confirmed filled cost of each order, rounded down to the pair's quote
    /// precision, so partial fills never cause overspend drift.
    pub async fn spend(
        &self,
        pair: &PairInfo,
        notional: f64,
        max_slippage: Option<f64>,
        side: OrderSide,
    ) -> Result<WalkOutcome> {
        let mut confirmations = Vec::new();

        let Some(reference) = self.top(pair, side).await? else {
            warn!(pair = %pair.name, "No visible liquidity, nothing to walk");
            return Ok(WalkOutcome {
                confirmations,
                termination: WalkTermination::BookExhausted,
            });
        };
        let reference_price = reference.price;
        let mut remaining = notional;

        info!(
            pair = %pair.name,
            %side,
            notional,
            reference_price,
            ?max_slippage,
            "Starting notional walk"
        );

        let termination = loop {
            if remaining < pair.costmin {
                break WalkTermination::NotionalExhausted;
            }

            let Some(level) = self.top(pair, side).await? else {
                break WalkTermination::BookExhausted;
            };

            let slippage = (level.price - reference_price).abs() / reference_price;
            if let Some(bound) = max_slippage {
                if slippage > bound {
                    debug!(
                        pair = %pair.name,
                        slippage,
                        bound,
                        "Slippage bound tripped, stopping walk"
                    );
                    break WalkTermination::SlippageExceeded;
                }
            }

            // Clip to the remainder when the visible level covers it,
            // otherwise take the whole level.
            let order_volume = if level.notional() >= remaining {
                round_down(remaining / level.price, pair.lot_decimals)
            } else {
                level.volume
            };
            if order_volume < pair.ordermin || order_volume <= 0.0 {
                break WalkTermination::NotionalExhausted;
            }

            let request = OrderRequest::market(pair.name.clone(), side, order_volume);
            match self.gateway.submit(&request).await {
                Ok(confirmation) => {
                    let filled = if confirmation.cost > 0.0 {
                        confirmation.cost
                    } else {
                        order_volume * level.price
                    };
                    if filled <= 0.0 {
                        confirmations.push(confirmation);
                        break WalkTermination::OrderFailed(
                            "order confirmed with zero filled notional".to_string(),
                        );
                    }
                    remaining -= round_down(filled, pair.pair_decimals);
                    debug!(
                        pair = %pair.name,
                        order_volume,
                        filled,
                        remaining,
                        "Walk slice filled"
                    );
                    confirmations.push(confirmation);
                }
                Err(e) => {
                    warn!(pair = %pair.name, error = %e, "Order submission failed, stopping walk");
                    break WalkTermination::OrderFailed(e.to_string());
                }
            }
        };

        info!(
            pair = %pair.name,
            orders = confirmations.len(),
            remaining,
            ?termination,
            "Notional walk finished"
        );
        Ok(WalkOutcome {
            confirmations,
            termination,
        })
    }

    async fn top(&self, pair: &PairInfo, side: OrderSide) -> Result<Option<BookLevel>> {
        match side {
            OrderSide::Buy => self.book.best_ask(&pair.name).await,
            OrderSide::Sell => self.book.best_bid(&pair.name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use common::Error;

    struct ScriptedBook {
        levels: Mutex<VecDeque<Option<BookLevel>>>,
    }

    impl ScriptedBook {
        fn new(levels: Vec<Option<BookLevel>>) -> Arc<Self> {
            Arc::new(Self {
                levels: Mutex::new(levels.into()),
            })
        }
    }

    #[async_trait]
    impl TopOfBook for ScriptedBook {
        async fn best_ask(&self, _pair: &str) -> Result<Option<BookLevel>> {
            Ok(self.levels.lock().unwrap().pop_front().flatten())
        }

        async fn best_bid(&self, _pair: &str) -> Result<Option<BookLevel>> {
            self.best_ask(_pair).await
        }
    }

    struct FillGateway {
        fail_from_order: Option<usize>,
        submitted: Mutex<Vec<OrderRequest>>,
    }

    impl FillGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_from_order: None,
                submitted: Mutex::new(Vec::new()),
            })
        }

        fn failing_from(order: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_from_order: Some(order),
                submitted: Mutex::new(Vec::new()),
            })
        }

        fn submissions(&self) -> Vec<OrderRequest> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderGateway for FillGateway {
        async fn submit(&self, request: &OrderRequest) -> Result<OrderConfirmation> {
            let mut submitted = self.submitted.lock().unwrap();
            if let Some(n) = self.fail_from_order {
                if submitted.len() >= n {
                    return Err(Error::OrderRejected(
                        "EOrder:Insufficient funds".to_string(),
                    ));
                }
            }
            submitted.push(request.clone());
            // Fills the full requested volume at a fixed price.
            let price = 100.0;
            Ok(OrderConfirmation {
                txid: vec![format!("T{}", submitted.len())],
                pair: request.pair.clone(),
                side: request.side,
                volume: request.volume,
                price,
                cost: request.volume * price,
                descr: String::new(),
            })
        }
    }

    fn eth_usd() -> PairInfo {
        PairInfo {
            name: "XETHZUSD".to_string(),
            altname: "ETHUSD".to_string(),
            wsname: Some("ETH/USD".to_string()),
            pair_decimals: 2,
            lot_decimals: 8,
            ordermin: 0.01,
            costmin: 10.0,
        }
    }

    fn level(price: f64, volume: f64) -> Option<BookLevel> {
        Some(BookLevel {
            price,
            volume,
            timestamp: 0.0,
        })
    }

    #[tokio::test]
    async fn first_level_covering_the_notional_means_one_order() {
        // Reference read plus one loop read.
        let book = ScriptedBook::new(vec![level(100.0, 12.0), level(100.0, 12.0)]);
        let gateway = FillGateway::new();
        let walker = BookWalker::new(book, gateway.clone());

        let outcome = walker
            .spend(&eth_usd(), 1000.0, Some(0.01), OrderSide::Buy)
            .await
            .unwrap();

        assert_eq!(outcome.termination, WalkTermination::NotionalExhausted);
        assert_eq!(outcome.confirmations.len(), 1);
        let submitted = gateway.submissions();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].volume, round_down(1000.0 / 100.0, 8));
        assert!(notional_within_bound(&outcome, 1000.0, 10.0));
    }

    #[tokio::test]
    async fn slippage_bound_stops_the_walk_with_partials() {
        let book = ScriptedBook::new(vec![
            level(100.0, 5.0), // reference
            level(100.0, 2.0), // first slice, 200 notional
            level(102.0, 50.0), // 2% move, beyond the 1% bound
        ]);
        let gateway = FillGateway::new();
        let walker = BookWalker::new(book, gateway.clone());

        let outcome = walker
            .spend(&eth_usd(), 1000.0, Some(0.01), OrderSide::Buy)
            .await
            .unwrap();

        assert_eq!(outcome.termination, WalkTermination::SlippageExceeded);
        assert_eq!(outcome.confirmations.len(), 1);
        assert_eq!(gateway.submissions().len(), 1);
        // Everything actually submitted traded within the bound.
        for confirmation in &outcome.confirmations {
            assert!((confirmation.price - 100.0).abs() / 100.0 <= 0.01);
        }
    }

    #[tokio::test]
    async fn thin_levels_are_swept_until_the_notional_is_spent() {
        let book = ScriptedBook::new(vec![
            level(100.0, 10.0), // reference
            level(100.0, 3.0),
            level(100.0, 3.0),
            level(100.0, 3.0),
            level(100.0, 10.0), // covers the remainder
        ]);
        let gateway = FillGateway::new();
        let walker = BookWalker::new(book, gateway.clone());

        let outcome = walker
            .spend(&eth_usd(), 1000.0, None, OrderSide::Buy)
            .await
            .unwrap();

        assert_eq!(outcome.termination, WalkTermination::NotionalExhausted);
        assert_eq!(outcome.confirmations.len(), 4);
        assert!(notional_within_bound(&outcome, 1000.0, 10.0));
    }

    #[tokio::test]
    async fn liquidity_running_out_terminates_the_walk() {
        let book = ScriptedBook::new(vec![
            level(100.0, 5.0), // reference
            level(100.0, 2.0),
            None,
        ]);
        let gateway = FillGateway::new();
        let walker = BookWalker::new(book, gateway.clone());

        let outcome = walker
            .spend(&eth_usd(), 1000.0, None, OrderSide::Buy)
            .await
            .unwrap();

        assert_eq!(outcome.termination, WalkTermination::BookExhausted);
        assert_eq!(outcome.confirmations.len(), 1);
    }

    #[tokio::test]
    async fn empty_book_returns_no_orders() {
        let book = ScriptedBook::new(vec![None]);
        let gateway = FillGateway::new();
        let walker = BookWalker::new(book, gateway.clone());

        let outcome = walker
            .spend(&eth_usd(), 1000.0, None, OrderSide::Buy)
            .await
            .unwrap();

        assert_eq!(outcome.termination, WalkTermination::BookExhausted);
        assert!(outcome.confirmations.is_empty());
        assert!(gateway.submissions().is_empty());
    }

    #[tokio::test]
    async fn failed_submission_returns_partials_without_retry() {
        let book = ScriptedBook::new(vec![
            level(100.0, 10.0), // reference
            level(100.0, 2.0),
            level(100.0, 2.0),
        ]);
        let gateway = FillGateway::failing_from(1);
        let walker = BookWalker::new(book, gateway.clone());

        let outcome = walker
            .spend(&eth_usd(), 1000.0, None, OrderSide::Buy)
            .await
            .unwrap();

        assert!(matches!(
            outcome.termination,
            WalkTermination::OrderFailed(_)
        ));
        assert_eq!(outcome.confirmations.len(), 1);
        assert_eq!(gateway.submissions().len(), 1);
    }

    #[tokio::test]
    async fn remainder_below_minimum_volume_is_left_unspent() {
        // 15 quote remaining at price 2000 buys 0.0075, below ordermin.
        let book = ScriptedBook::new(vec![level(2000.0, 5.0), level(2000.0, 5.0)]);
        let gateway = FillGateway::new();
        let walker = BookWalker::new(book, gateway.clone());

        let outcome = walker
            .spend(&eth_usd(), 15.0, None, OrderSide::Buy)
            .await
            .unwrap();

        assert_eq!(outcome.termination, WalkTermination::NotionalExhausted);
        assert!(outcome.confirmations.is_empty());
        assert!(gateway.submissions().is_empty());
    }

    fn notional_within_bound(outcome: &WalkOutcome, requested: f64, costmin: f64) -> bool {
        outcome.filled_notional() <= requested + costmin
    }
}

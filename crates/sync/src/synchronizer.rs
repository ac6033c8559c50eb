use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::{GenesisProbe, PairInfo, Result, TradeFetcher};
use store::TickStore;

use crate::budget::RateBudget;

/// A page of this many records means more history is likely pending.
pub const FULL_PAGE: usize = 1000;

const NANOS_PER_SEC: f64 = 1e9;

/// Outcome of one synchronizer invocation for one pair.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub pair: String,
    /// Pages fetched during this run.
    pub pages: u32,
    /// Rows actually inserted (duplicates from overlapping pages excluded).
    pub appended: u64,
    /// Ledger checkpoint after the run.
    pub last_timestamp: Option<f64>,
    /// False when the run stopped early on a shutdown signal.
    pub caught_up: bool,
}

/// Brings a pair's local trade ledger up to the present.
///
/// The ledger itself is the only checkpoint: every run recomputes its
/// cursor from `last_timestamp`, so an interrupted run resumes correctly
/// with no separate bookkeeping. For an empty ledger the starting cursor
/// comes from a daily-candle probe of the pair's earliest trade, which is
/// far cheaper against the call budget than paging forward from zero.
///
/// Pages for one pair are fetched strictly sequentially in cursor order.
/// Ledgers of different pairs are disjoint tables, so distinct pairs may
/// be synchronized concurrently by separate synchronizers.
pub struct HistorySynchronizer {
    fetcher: Arc<dyn TradeFetcher>,
    probe: Arc<dyn GenesisProbe>,
    store: TickStore,
    budget: RateBudget,
    shutdown: watch::Receiver<bool>,
}

impl HistorySynchronizer {
    pub fn new(
        fetcher: Arc<dyn TradeFetcher>,
        probe: Arc<dyn GenesisProbe>,
        store: TickStore,
        budget: RateBudget,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            fetcher,
            probe,
            store,
            budget,
            shutdown,
        }
    }

    /// Synchronize one pair to the present.
    ///
    /// Transient server failures retry the same cursor after a full-bucket
    /// backoff, indefinitely. Any other remote error aborts the run for
    /// this pair; pages already appended remain valid and the next run
    /// resumes from them.
    pub async fn sync_pair(&mut self, pair: &PairInfo) -> Result<SyncReport> {
        let mut pages = 0u32;
        let mut appended = 0u64;

        let (mut cursor, genesis) = match self.store.last_timestamp(&pair.altname).await? {
            Some(ts) => {
                debug!(pair = %pair.name, last_timestamp = ts, "Resuming from ledger checkpoint");
                (nanos(ts), None)
            }
            None => {
                let Some(genesis) = self.bootstrap_genesis(pair).await? else {
                    return self.stopped_report(pair, pages, appended).await;
                };
                self.store.create_ledger(&pair.altname).await?;
                info!(pair = %pair.name, genesis, "Bootstrapping empty ledger from earliest trade");
                (nanos(genesis), Some(genesis))
            }
        };

        loop {
            if *self.shutdown.borrow() {
                info!(pair = %pair.name, pages, appended, "Shutdown requested, stopping sync");
                return self.stopped_report(pair, pages, appended).await;
            }
            if !self.budget.can_call() {
                self.budget.wait_for_refill().await;
                continue;
            }

            match self.fetcher.fetch_page(&pair.name, Some(cursor)).await {
                Ok(page) => {
                    pages += 1;
                    appended += self.store.append(&pair.altname, &page.records).await?;
                    let caught_up = page.page_size() < FULL_PAGE;
                    cursor = page.next_cursor;

                    if let Some(genesis) = genesis {
                        let now = Utc::now().timestamp() as f64;
                        debug!(
                            pair = %pair.name,
                            pages,
                            appended,
                            progress = progress_estimate(now, cursor as f64 / NANOS_PER_SEC, genesis),
                            "Backfill progress"
                        );
                    }

                    if caught_up {
                        break;
                    }
                }
                Err(e) if e.is_transient() => {
                    self.budget.refund();
                    warn!(pair = %pair.name, error = %e, "Transient fetch failure, retrying same cursor");
                    self.budget.wait_for_refill().await;
                }
                Err(e) => return Err(e),
            }
        }

        let last_timestamp = self.store.last_timestamp(&pair.altname).await?;
        info!(pair = %pair.name, pages, appended, ?last_timestamp, "Pair caught up");
        Ok(SyncReport {
            pair: pair.name.clone(),
            pages,
            appended,
            last_timestamp,
            caught_up: true,
        })
    }

    /// Synchronize every pair in turn, skipping dark pool pairs.
    /// A fatal error for one pair is logged and does not stop the rest.
    pub async fn sync_all(&mut self, pairs: &[PairInfo]) -> Vec<SyncReport> {
        let mut reports = Vec::with_capacity(pairs.len());
        for pair in pairs {
            if pair.altname.ends_with(".d") {
                debug!(pair = %pair.name, "Skipping dark pool pair");
                continue;
            }
            if *self.shutdown.borrow() {
                info!("Shutdown requested, stopping remaining pairs");
                break;
            }
            match self.sync_pair(pair).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(pair = %pair.name, error = %e, "Sync failed for pair, continuing with next");
                }
            }
        }
        reports
    }

    /// Probe the pair's earliest trade time, retrying transient failures.
    /// Returns `None` when shutdown interrupts the bootstrap.
    async fn bootstrap_genesis(&mut self, pair: &PairInfo) -> Result<Option<f64>> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(None);
            }
            if !self.budget.can_call() {
                self.budget.wait_for_refill().await;
                continue;
            }
            match self.probe.earliest_trade_time(&pair.name).await {
                Ok(t) => return Ok(Some(t)),
                Err(e) if e.is_transient() => {
                    self.budget.refund();
                    warn!(pair = %pair.name, error = %e, "Transient failure probing earliest trade");
                    self.budget.wait_for_refill().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stopped_report(
        &self,
        pair: &PairInfo,
        pages: u32,
        appended: u64,
    ) -> Result<SyncReport> {
        let last_timestamp = self.store.last_timestamp(&pair.altname).await?;
        Ok(SyncReport {
            pair: pair.name.clone(),
            pages,
            appended,
            last_timestamp,
            caught_up: false,
        })
    }
}

fn nanos(timestamp: f64) -> u64 {
    (timestamp * NANOS_PER_SEC) as u64
}

/// Completion estimate in `0..=1`. Monitoring only.
fn progress_estimate(now: f64, cursor_time: f64, genesis_time: f64) -> f64 {
    if now <= genesis_time {
        return 1.0;
    }
    (1.0 - (now - cursor_time) / (now - genesis_time)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;

    use common::{Error, TickRecord, TradePage};

    struct ScriptedFetcher {
        pages: Mutex<VecDeque<Result<TradePage>>>,
        cursors: Mutex<Vec<Option<u64>>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<TradePage>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                cursors: Mutex::new(Vec::new()),
            })
        }

        fn seen_cursors(&self) -> Vec<Option<u64>> {
            self.cursors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TradeFetcher for ScriptedFetcher {
        async fn fetch_page(&self, _pair: &str, since: Option<u64>) -> Result<TradePage> {
            self.cursors.lock().unwrap().push(since);
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Exchange("script exhausted".to_string())))
        }
    }

    struct FixedProbe {
        genesis: f64,
        calls: Mutex<u32>,
    }

    impl FixedProbe {
        fn new(genesis: f64) -> Arc<Self> {
            Arc::new(Self {
                genesis,
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl GenesisProbe for FixedProbe {
        async fn earliest_trade_time(&self, _pair: &str) -> Result<f64> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.genesis)
        }
    }

    // These tests run on real time, not `start_paused`: the sqlx pool pings
    // connections on release from a background thread, and tokio's
    // auto-advancing paused clock skips past the pool's acquire timeout while
    // that ping is in flight, yielding spurious `PoolTimedOut` errors.
    async fn memory_store() -> TickStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        TickStore::from_pool(pool)
    }

    fn eth_usd() -> PairInfo {
        PairInfo {
            name: "XETHZUSD".to_string(),
            altname: "ETHUSD".to_string(),
            wsname: Some("ETH/USD".to_string()),
            pair_decimals: 2,
            lot_decimals: 8,
            ordermin: 0.01,
            costmin: 0.5,
        }
    }

    fn tick(timestamp: f64, price: f64) -> TickRecord {
        TickRecord {
            timestamp,
            price,
            volume: 1.0,
        }
    }

    fn page(records: Vec<TickRecord>, next_cursor: u64) -> Result<TradePage> {
        Ok(TradePage {
            records,
            next_cursor,
        })
    }

    fn full_page(start: f64, next_cursor: u64) -> Result<TradePage> {
        let records = (0..FULL_PAGE)
            .map(|i| tick(start + i as f64, 100.0 + i as f64))
            .collect();
        page(records, next_cursor)
    }

    fn synchronizer(
        fetcher: Arc<ScriptedFetcher>,
        probe: Arc<FixedProbe>,
        store: TickStore,
    ) -> (HistorySynchronizer, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let sync = HistorySynchronizer::new(
            fetcher,
            probe,
            store,
            RateBudget::public_endpoint(),
            rx,
        );
        (sync, tx)
    }

    #[tokio::test]
    async fn short_page_appends_and_catches_up() {
        let store = memory_store().await;
        store
            .append("ETHUSD", &[tick(1_700_000_000.0, 99.0)])
            .await
            .unwrap();

        let fetcher = ScriptedFetcher::new(vec![page(
            vec![
                tick(1_700_000_100.0, 100.0),
                tick(1_700_000_200.0, 101.0),
                tick(1_700_000_200.0, 101.5),
            ],
            1_700_000_200_000_000_001,
        )]);
        let probe = FixedProbe::new(0.0);
        let (mut sync, _tx) = synchronizer(fetcher.clone(), probe.clone(), store.clone());

        let report = sync.sync_pair(&eth_usd()).await.unwrap();

        assert!(report.caught_up);
        assert_eq!(report.pages, 1);
        assert_eq!(report.appended, 3);
        assert_eq!(report.last_timestamp, Some(1_700_000_200.0));
        // Cursor derived from the existing ledger checkpoint, not the probe.
        assert_eq!(
            fetcher.seen_cursors(),
            vec![Some(nanos(1_700_000_000.0))]
        );
        assert_eq!(*probe.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn full_pages_keep_paging_on_the_returned_cursor() {
        let store = memory_store().await;
        store.append("ETHUSD", &[tick(1000.0, 1.0)]).await.unwrap();

        let fetcher = ScriptedFetcher::new(vec![
            full_page(2000.0, 5_000_000_000_000),
            page(vec![tick(5000.0, 2.0)], 5_000_000_000_001),
        ]);
        let probe = FixedProbe::new(0.0);
        let (mut sync, _tx) = synchronizer(fetcher.clone(), probe, store);

        let report = sync.sync_pair(&eth_usd()).await.unwrap();

        assert!(report.caught_up);
        assert_eq!(report.pages, 2);
        assert_eq!(report.appended, FULL_PAGE as u64 + 1);
        assert_eq!(
            fetcher.seen_cursors(),
            vec![Some(nanos(1000.0)), Some(5_000_000_000_000)]
        );
    }

    #[tokio::test]
    async fn transient_failure_retries_the_same_cursor() {
        let store = memory_store().await;
        store.append("ETHUSD", &[tick(1000.0, 1.0)]).await.unwrap();

        let fetcher = ScriptedFetcher::new(vec![
            Err(Error::Transient("EService:Unavailable".to_string())),
            page(vec![tick(1001.0, 1.1)], 2_000_000_000_000),
        ]);
        let probe = FixedProbe::new(0.0);
        let (mut sync, _tx) = synchronizer(fetcher.clone(), probe, store);

        let report = sync.sync_pair(&eth_usd()).await.unwrap();

        assert!(report.caught_up);
        assert_eq!(report.appended, 1);
        let cursors = fetcher.seen_cursors();
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors[0], cursors[1]);
    }

    #[tokio::test]
    async fn second_run_with_no_new_data_appends_nothing() {
        let store = memory_store().await;

        let records = vec![tick(100.0, 1.0), tick(200.0, 2.0)];
        let fetcher = ScriptedFetcher::new(vec![
            page(records.clone(), 200_000_000_001),
            // Second run: the remote re-serves the overlap and nothing new.
            page(records, 200_000_000_001),
        ]);
        let probe = FixedProbe::new(50.0);
        let (mut sync, _tx) = synchronizer(fetcher.clone(), probe.clone(), store.clone());

        let first = sync.sync_pair(&eth_usd()).await.unwrap();
        assert_eq!(first.appended, 2);
        assert_eq!(*probe.calls.lock().unwrap(), 1);

        let second = sync.sync_pair(&eth_usd()).await.unwrap();
        assert_eq!(second.appended, 0);
        assert_eq!(second.last_timestamp, first.last_timestamp);
        // Resume cursor came from the ledger, no second probe.
        assert_eq!(*probe.calls.lock().unwrap(), 1);
        assert_eq!(fetcher.seen_cursors()[1], Some(nanos(200.0)));
    }

    #[tokio::test]
    async fn empty_ledger_bootstraps_from_the_probe() {
        let store = memory_store().await;
        let fetcher =
            ScriptedFetcher::new(vec![page(vec![tick(1_500_000_050.0, 9.0)], 1)]);
        let probe = FixedProbe::new(1_500_000_000.0);
        let (mut sync, _tx) = synchronizer(fetcher.clone(), probe.clone(), store.clone());

        let report = sync.sync_pair(&eth_usd()).await.unwrap();

        assert!(report.caught_up);
        assert_eq!(*probe.calls.lock().unwrap(), 1);
        assert_eq!(
            fetcher.seen_cursors(),
            vec![Some(nanos(1_500_000_000.0))]
        );
        assert_eq!(store.last_timestamp("ETHUSD").await.unwrap(), Some(1_500_000_050.0));
    }

    #[tokio::test]
    async fn fatal_error_aborts_and_leaves_ledger_valid() {
        let store = memory_store().await;
        store.append("ETHUSD", &[tick(1000.0, 1.0)]).await.unwrap();

        let fetcher = ScriptedFetcher::new(vec![Err(Error::Exchange(
            "EQuery:Unknown asset pair".to_string(),
        ))]);
        let probe = FixedProbe::new(0.0);
        let (mut sync, _tx) = synchronizer(fetcher, probe, store.clone());

        let err = sync.sync_pair(&eth_usd()).await.unwrap_err();
        assert!(matches!(err, Error::Exchange(_)));
        assert_eq!(store.last_timestamp("ETHUSD").await.unwrap(), Some(1000.0));
    }

    #[tokio::test]
    async fn shutdown_stops_before_fetching() {
        let store = memory_store().await;
        store.append("ETHUSD", &[tick(1000.0, 1.0)]).await.unwrap();

        let fetcher = ScriptedFetcher::new(vec![]);
        let probe = FixedProbe::new(0.0);
        let (mut sync, tx) = synchronizer(fetcher.clone(), probe, store);
        tx.send(true).unwrap();

        let report = sync.sync_pair(&eth_usd()).await.unwrap();
        assert!(!report.caught_up);
        assert_eq!(report.pages, 0);
        assert!(fetcher.seen_cursors().is_empty());
    }

    #[tokio::test]
    async fn sync_all_skips_dark_pools_and_survives_failures() {
        let store = memory_store().await;
        store.append("ETHUSD", &[tick(1000.0, 1.0)]).await.unwrap();
        store.append("XBTUSD", &[tick(2000.0, 2.0)]).await.unwrap();

        // First scripted response fails ETHUSD; second catches XBTUSD up.
        let fetcher = ScriptedFetcher::new(vec![
            Err(Error::Exchange("EGeneral:Invalid arguments".to_string())),
            page(vec![tick(2001.0, 2.1)], 1),
        ]);
        let probe = FixedProbe::new(0.0);
        let (mut sync, _tx) = synchronizer(fetcher, probe, store);

        let dark = PairInfo {
            name: "ETHUSDT.d".to_string(),
            altname: "ETHUSDT.d".to_string(),
            wsname: None,
            pair_decimals: 2,
            lot_decimals: 8,
            ordermin: 0.01,
            costmin: 0.5,
        };
        let xbt = PairInfo {
            name: "XXBTZUSD".to_string(),
            altname: "XBTUSD".to_string(),
            wsname: Some("XBT/USD".to_string()),
            pair_decimals: 1,
            lot_decimals: 8,
            ordermin: 0.0001,
            costmin: 0.5,
        };

        let reports = sync.sync_all(&[dark, eth_usd(), xbt]).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].pair, "XXBTZUSD");
        assert!(reports[0].caught_up);
    }

    #[test]
    fn progress_estimate_is_clamped_and_monotone() {
        assert_eq!(progress_estimate(100.0, 100.0, 0.0), 1.0);
        assert_eq!(progress_estimate(100.0, 0.0, 0.0), 0.0);
        let early = progress_estimate(100.0, 25.0, 0.0);
        let late = progress_estimate(100.0, 75.0, 0.0);
        assert!(early < late);
        // Degenerate window.
        assert_eq!(progress_estimate(50.0, 50.0, 50.0), 1.0);
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use client::{KrakenClient, PairCatalog};
use common::{Config, PairInfo, SpendConfig};
use exec::BookWalker;
use store::TickStore;
use sync::{HistorySynchronizer, RateBudget};

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(pairs = cfg.sync_pairs.len(), "InkWell starting");

    // ── Database ──────────────────────────────────────────────────────────────
    let store = TickStore::connect(&cfg.database_url)
        .await
        .unwrap_or_else(|e| panic!("Failed to open database: {e}"));
    info!(url = %cfg.database_url, "Database ready");

    // ── Exchange client ───────────────────────────────────────────────────────
    let client = match (&cfg.kraken_api_key, &cfg.kraken_private_key) {
        (Some(key), Some(secret)) => Arc::new(KrakenClient::with_credentials(key, secret)),
        _ => {
            info!("No credentials configured, public endpoints only");
            Arc::new(KrakenClient::new())
        }
    };
    let catalog = PairCatalog::new(
        client.clone(),
        Duration::from_secs(cfg.catalog_ttl_secs),
    );

    match client.system_status().await {
        Ok(status) => info!(%status, "Exchange status"),
        Err(e) => warn!(error = %e, "Could not read exchange status"),
    }

    // ── Shutdown signal ───────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing current page and stopping");
            let _ = shutdown_tx.send(true);
        }
    });

    // ── Pair resolution ───────────────────────────────────────────────────────
    let mut pairs: Vec<PairInfo> = Vec::new();
    for name in &cfg.sync_pairs {
        match catalog.resolve_pair(name).await {
            Ok(info) => pairs.push(info),
            Err(e) => warn!(pair = %name, error = %e, "Skipping unresolvable pair"),
        }
    }
    if pairs.is_empty() {
        panic!("None of the configured SYNC_PAIRS could be resolved");
    }

    // ── History synchronization ───────────────────────────────────────────────
    let mut synchronizer = HistorySynchronizer::new(
        client.clone(),
        client.clone(),
        store,
        RateBudget::public_endpoint(),
        shutdown_rx,
    );

    let reports = synchronizer.sync_all(&pairs).await;
    for report in &reports {
        info!(
            pair = %report.pair,
            pages = report.pages,
            appended = report.appended,
            last_timestamp = ?report.last_timestamp,
            caught_up = report.caught_up,
            "Sync finished"
        );
    }

    // ── Optional order walk ───────────────────────────────────────────────────
    if let Some(spend) = &cfg.spend {
        run_spend(&cfg, &client, &catalog, spend).await;
    }

    info!(pairs = reports.len(), "InkWell done");
}

async fn run_spend(
    cfg: &Config,
    client: &Arc<KrakenClient>,
    catalog: &PairCatalog,
    spend: &SpendConfig,
) {
    if let Err(e) = cfg.credentials() {
        warn!(error = %e, "Skipping order walk");
        return;
    }
    match client.system_status().await {
        Ok(status) if !status.accepts_orders() => {
            warn!(%status, "Exchange not accepting orders, skipping walk");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Could not confirm exchange status, skipping walk");
            return;
        }
        Ok(_) => {}
    }

    let pair = match catalog.resolve_pair(&spend.pair).await {
        Ok(info) => info,
        Err(e) => {
            warn!(pair = %spend.pair, error = %e, "Cannot resolve spend pair");
            return;
        }
    };

    let walker = BookWalker::new(client.clone(), client.clone());
    match walker
        .spend(&pair, spend.notional, spend.max_slippage, spend.side)
        .await
    {
        Ok(outcome) => {
            for confirmation in &outcome.confirmations {
                info!(
                    txid = ?confirmation.txid,
                    volume = confirmation.volume,
                    price = confirmation.price,
                    cost = confirmation.cost,
                    "Order filled"
                );
            }
            info!(
                orders = outcome.confirmations.len(),
                filled = outcome.filled_notional(),
                termination = ?outcome.termination,
                "Order walk finished"
            );
        }
        Err(e) => warn!(error = %e, "Order walk failed"),
    }
}

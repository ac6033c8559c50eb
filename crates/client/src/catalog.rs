use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{Error, PairInfo, Result};

use crate::rest::KrakenClient;

/// Fallback minimum order cost when the exchange omits `costmin`.
const DEFAULT_COSTMIN: f64 = 10.0;

/// Raw asset-pair metadata as served by the `AssetPairs` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAssetPair {
    pub altname: String,
    #[serde(default)]
    pub wsname: Option<String>,
    pub pair_decimals: u32,
    pub lot_decimals: u32,
    #[serde(default)]
    pub ordermin: Option<String>,
    #[serde(default)]
    pub costmin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAsset {
    pub altname: String,
}

/// Bidirectional name lookup built once from a full asset/pair listing.
///
/// The exchange knows three names for a pair: canonical (`XETHZUSD`),
/// alternate (`ETHUSD`) and websocket (`ETH/USD`). Users type whichever
/// they remember. Built eagerly so resolution never costs a remote call.
pub struct Snapshot {
    pairs: HashMap<String, PairInfo>,
    alt_to_canonical: HashMap<String, String>,
    ws_to_canonical: HashMap<String, String>,
    asset_alt_to_canonical: HashMap<String, String>,
    asset_canonical: HashMap<String, String>,
}

impl Snapshot {
    pub fn from_parts(
        raw_pairs: HashMap<String, RawAssetPair>,
        raw_assets: HashMap<String, RawAsset>,
    ) -> Self {
        let mut pairs = HashMap::new();
        let mut alt_to_canonical = HashMap::new();
        let mut ws_to_canonical = HashMap::new();

        for (canonical, raw) in raw_pairs {
            alt_to_canonical.insert(raw.altname.clone(), canonical.clone());
            if let Some(ws) = &raw.wsname {
                ws_to_canonical.insert(ws.clone(), canonical.clone());
            }
            pairs.insert(
                canonical.clone(),
                PairInfo {
                    name: canonical,
                    altname: raw.altname,
                    wsname: raw.wsname,
                    pair_decimals: raw.pair_decimals,
                    lot_decimals: raw.lot_decimals,
                    ordermin: raw
                        .ordermin
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0),
                    costmin: raw
                        .costmin
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(DEFAULT_COSTMIN),
                },
            );
        }

        let mut asset_alt_to_canonical = HashMap::new();
        let mut asset_canonical = HashMap::new();
        for (canonical, raw) in raw_assets {
            asset_alt_to_canonical.insert(raw.altname, canonical.clone());
            asset_canonical.insert(canonical.clone(), canonical);
        }

        Self {
            pairs,
            alt_to_canonical,
            ws_to_canonical,
            asset_alt_to_canonical,
            asset_canonical,
        }
    }

    /// Resolve any pair naming convention to its canonical metadata.
    pub fn resolve_pair(&self, name: &str) -> Result<&PairInfo> {
        // Exact canonical names (including dark pool `.d` suffixes) win
        // before any case normalization.
        if let Some(info) = self.pairs.get(name) {
            return Ok(info);
        }

        let upper = name.to_uppercase();

        // BTC/USD is the one name everyone types and the exchange rejects.
        let upper = if upper == "BTCUSD" || upper == "BTC/USD" {
            "XXBTZUSD".to_string()
        } else {
            upper
        };

        if let Some(info) = self.pairs.get(&upper) {
            return Ok(info);
        }
        if let Some(canonical) = self.ws_to_canonical.get(&upper) {
            return Ok(&self.pairs[canonical]);
        }
        if let Some(canonical) = self.alt_to_canonical.get(&upper) {
            return Ok(&self.pairs[canonical]);
        }
        Err(Error::Naming(name.to_string()))
    }

    /// Resolve an asset name (`eth`, `XETH`, `btc`) to its canonical form.
    pub fn resolve_asset(&self, name: &str) -> Result<&str> {
        let upper = name.to_uppercase();
        if upper == "BTC" {
            return Ok("XXBT");
        }
        if let Some(canonical) = self.asset_canonical.get(&upper) {
            return Ok(canonical);
        }
        if let Some(canonical) = self.asset_alt_to_canonical.get(&upper) {
            return Ok(canonical);
        }
        Err(Error::Naming(name.to_string()))
    }

    pub fn pair_names(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }
}

/// TTL-cached pair catalog backed by the REST client.
///
/// Listings change rarely; one build serves every resolution until the TTL
/// lapses or `invalidate` is called.
pub struct PairCatalog {
    client: Arc<KrakenClient>,
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
}

struct Cached {
    snapshot: Arc<Snapshot>,
    built_at: Instant,
}

impl PairCatalog {
    pub fn new(client: Arc<KrakenClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub async fn resolve_pair(&self, name: &str) -> Result<PairInfo> {
        let snapshot = self.snapshot().await?;
        snapshot.resolve_pair(name).cloned()
    }

    pub async fn resolve_asset(&self, name: &str) -> Result<String> {
        let snapshot = self.snapshot().await?;
        snapshot.resolve_asset(name).map(str::to_string)
    }

    /// All canonical pair names, excluding dark pool pairs (`.d` suffix).
    pub async fn tradeable_pairs(&self) -> Result<Vec<String>> {
        let snapshot = self.snapshot().await?;
        let mut names: Vec<String> = snapshot
            .pair_names()
            .filter(|name| !name.ends_with(".d"))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Drop the cached listing; the next resolution rebuilds it.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        {
            let guard = self.cached.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.built_at.elapsed() < self.ttl {
                    return Ok(cached.snapshot.clone());
                }
                debug!("Pair catalog TTL lapsed");
            }
        }

        let mut guard = self.cached.write().await;
        // Another task may have rebuilt while we waited for the write lock.
        if let Some(cached) = guard.as_ref() {
            if cached.built_at.elapsed() < self.ttl {
                return Ok(cached.snapshot.clone());
            }
        }

        let raw_pairs: HashMap<String, RawAssetPair> =
            self.client.public_get("AssetPairs", &[]).await?;
        let raw_assets: HashMap<String, RawAsset> =
            self.client.public_get("Assets", &[]).await?;

        let snapshot = Arc::new(Snapshot::from_parts(raw_pairs, raw_assets));
        info!(pairs = snapshot.pairs.len(), "Pair catalog rebuilt");
        *guard = Some(Cached {
            snapshot: snapshot.clone(),
            built_at: Instant::now(),
        });
        Ok(snapshot)
    }
}

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Exchange credentials (only needed for private endpoints)
    pub kraken_api_key: Option<String>,
    pub kraken_private_key: Option<String>,

    // Database
    pub database_url: String,

    // Pairs to synchronize, in any naming convention the catalog resolves
    pub sync_pairs: Vec<String>,

    // Catalog refresh interval in seconds
    pub catalog_ttl_secs: u64,

    // Optional one-shot order walk executed after synchronization
    pub spend: Option<SpendConfig>,
}

/// Settings for a single notional-amount order walk.
#[derive(Debug, Clone)]
pub struct SpendConfig {
    pub pair: String,
    /// Quote-currency amount to spend.
    pub notional: f64,
    pub side: crate::OrderSide,
    /// Maximum tolerated fractional price drift, e.g. `0.01`.
    pub max_slippage: Option<f64>,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let sync_pairs = required_env("SYNC_PAIRS")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if sync_pairs.is_empty() {
            panic!("SYNC_PAIRS must contain at least one trading pair");
        }

        Config {
            kraken_api_key: optional_env("KRAKEN_API_KEY"),
            kraken_private_key: optional_env("KRAKEN_PRIVATE_KEY"),
            database_url: required_env("DATABASE_URL"),
            sync_pairs,
            catalog_ttl_secs: optional_env("CATALOG_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            spend: spend_from_env(),
        }
    }

    /// Credentials as a pair, or an error when either is missing.
    /// Private endpoints require both.
    pub fn credentials(&self) -> crate::Result<(String, String)> {
        match (&self.kraken_api_key, &self.kraken_private_key) {
            (Some(key), Some(secret)) => Ok((key.clone(), secret.clone())),
            _ => Err(crate::Error::Config(
                "KRAKEN_API_KEY and KRAKEN_PRIVATE_KEY must both be set for private calls"
                    .to_string(),
            )),
        }
    }
}

fn spend_from_env() -> Option<SpendConfig> {
    let pair = optional_env("SPEND_PAIR")?;
    let notional = optional_env("SPEND_NOTIONAL")?
        .parse()
        .unwrap_or_else(|_| panic!("SPEND_NOTIONAL must be a number"));
    let side = match optional_env("SPEND_SIDE").as_deref() {
        None | Some("buy") => crate::OrderSide::Buy,
        Some("sell") => crate::OrderSide::Sell,
        Some(other) => panic!("SPEND_SIDE must be 'buy' or 'sell', got '{other}'"),
    };
    let max_slippage = optional_env("SPEND_MAX_SLIPPAGE").map(|v| {
        v.parse()
            .unwrap_or_else(|_| panic!("SPEND_MAX_SLIPPAGE must be a number"))
    });
    Some(SpendConfig {
        pair,
        notional,
        side,
        max_slippage,
    })
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

pub mod config;
pub mod error;
pub mod exchange;
pub mod types;

pub use config::{Config, SpendConfig};
pub use error::{Error, Result};
pub use exchange::{GenesisProbe, OrderGateway, TopOfBook, TradeFetcher};
pub use types::*;

pub mod catalog;
pub mod orders;
pub mod rest;
pub mod sign;
pub mod stream;

pub use catalog::{PairCatalog, Snapshot};
pub use rest::{KrakenClient, Ticker};
pub use stream::{TradeEvent, TradeStream};

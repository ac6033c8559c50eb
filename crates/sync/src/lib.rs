pub mod budget;
pub mod synchronizer;

pub use budget::RateBudget;
pub use synchronizer::{HistorySynchronizer, SyncReport, FULL_PAGE};

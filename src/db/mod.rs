pub mod schema;
pub mod store;

pub use store::{db_path_for_trading_day, PersistResult, TickStore, TickWriter};

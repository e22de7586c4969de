//! Trading on the master session.

mod executor;

pub use executor::TradeExecutor;

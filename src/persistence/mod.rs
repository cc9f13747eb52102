//! CSV Persistence Module
//!
//! Market inputs, the forecast history and weekly performance records.

pub mod forecast_store;
pub mod market_data;

pub use forecast_store::{CsvForecastStore, ForecastStore, InMemoryForecastStore};
pub use market_data::{CsvMarketData, MarketDataSource};

//! MCP Forecast Library
//!
//! Weekly hourly clearing-price forecaster: trend-seasonality, boosted
//! residuals and an optional sequence model blended by adaptive weights

pub mod config;
pub mod error;
pub mod ml_engine;
pub mod persistence;
pub mod reconciliation;
pub mod types;
pub mod workflow;

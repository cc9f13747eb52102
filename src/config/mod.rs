//! Configuration management for the forecaster
//!
//! Loads from YAML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub market: MarketConfig,
    pub features: FeaturesConfig,
    pub trend: TrendSection,
    pub residual: ResidualSection,
    pub sequence: SequenceSection,
    pub ensemble: EnsembleSection,
    pub training: TrainingSection,
    pub persistence: PersistenceConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

/// Market-specific assumptions; a different market must override these
#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Prices at or below this are excluded from percentage errors
    pub low_price_threshold: f64,
    /// Hours flagged as peak demand
    pub peak_hours: Vec<u32>,
    /// Solar window hours
    pub daytime_hours: Vec<u32>,
    /// Sunday hours with a history of extreme low prices
    pub extreme_low_hours: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeaturesConfig {
    /// Days of history averaged per hour-of-day for future supply/demand
    pub future_profile_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendSection {
    pub n_changepoints: usize,
    pub changepoint_range: f64,
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    pub holidays_prior_scale: f64,
    pub daily_fourier_order: usize,
    pub weekly_fourier_order: usize,
    pub yearly_fourier_order: usize,
    pub interval_width: f64,
    /// Optional YAML holiday calendar; built-in calendar when absent
    #[serde(default)]
    pub holidays_file: Option<String>,
    /// Prior scale per exogenous regressor
    #[serde(default = "default_regressor_priors")]
    pub regressor_priors: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResidualSection {
    pub n_estimators: usize,
    pub max_depth: u16,
    pub learning_rate: f64,
    pub subsample: f64,
    pub min_samples_leaf: usize,
    pub cv_folds: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceSection {
    pub enabled: bool,
    pub sequence_length: usize,
    pub reservoir_size: usize,
    pub spectral_radius: f64,
    pub leak_rate: f64,
    pub input_scaling: f64,
    pub ridge_alpha: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnsembleSection {
    /// adaptive_weighted | residual_stacking | two_model_fallback
    pub mode: String,
    pub stacking_factor: f64,
    pub initial_trend_weight: f64,
    pub initial_residual_weight: f64,
    pub initial_sequence_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingSection {
    /// Days before the cutoff held out for the training report
    pub holdout_days: i64,
    /// Days of history loaded for each retrain
    pub history_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory (market CSVs, forecast store, model artifacts)
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub enabled: bool,
    pub output_path: String,
    /// Weeks listed in the historical trend
    pub history_weeks: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

pub fn default_regressor_priors() -> HashMap<String, f64> {
    [
        ("consumption", 20.0),
        ("supply_demand_gap", 15.0),
        ("renewable_ratio", 12.0),
        ("fossil_ratio", 10.0),
        ("price_lag_24h", 8.0),
    ]
    .into_iter()
    .map(|(name, scale)| (name.to_string(), scale))
    .collect()
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder_with_defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (MCP_FORECAST__*)
            .add_source(Environment::with_prefix("MCP_FORECAST").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Defaults only, no files or environment
    pub fn defaults() -> Result<Self> {
        let config = Self::builder_with_defaults()?
            .build()
            .context("Failed to build default configuration")?;
        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize default configuration")?;
        Ok(app_config)
    }

    fn builder_with_defaults() -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            // Market defaults
            .set_default("market.low_price_threshold", 100.0)?
            .set_default("market.peak_hours", vec![8, 9, 10, 18, 19, 20, 21])?
            .set_default("market.daytime_hours", vec![10, 11, 12, 13, 14, 15])?
            .set_default("market.extreme_low_hours", vec![10, 11, 12, 13, 14])?
            // Features defaults
            .set_default("features.future_profile_days", 28)?
            // Trend defaults
            .set_default("trend.n_changepoints", 25)?
            .set_default("trend.changepoint_range", 0.8)?
            .set_default("trend.changepoint_prior_scale", 0.1)?
            .set_default("trend.seasonality_prior_scale", 10.0)?
            .set_default("trend.holidays_prior_scale", 10.0)?
            .set_default("trend.daily_fourier_order", 4)?
            .set_default("trend.weekly_fourier_order", 3)?
            .set_default("trend.yearly_fourier_order", 10)?
            .set_default("trend.interval_width", 0.95)?
            // Residual defaults
            .set_default("residual.n_estimators", 300)?
            .set_default("residual.max_depth", 7)?
            .set_default("residual.learning_rate", 0.03)?
            .set_default("residual.subsample", 0.8)?
            .set_default("residual.min_samples_leaf", 3)?
            .set_default("residual.cv_folds", 5)?
            .set_default("residual.seed", 42)?
            // Sequence defaults
            .set_default("sequence.enabled", true)?
            .set_default("sequence.sequence_length", 24)?
            .set_default("sequence.reservoir_size", 64)?
            .set_default("sequence.spectral_radius", 0.9)?
            .set_default("sequence.leak_rate", 0.3)?
            .set_default("sequence.input_scaling", 0.5)?
            .set_default("sequence.ridge_alpha", 1e-2)?
            .set_default("sequence.seed", 7)?
            // Ensemble defaults
            .set_default("ensemble.mode", "adaptive_weighted")?
            .set_default("ensemble.stacking_factor", 0.5)?
            .set_default("ensemble.initial_trend_weight", 0.3)?
            .set_default("ensemble.initial_residual_weight", 0.5)?
            .set_default("ensemble.initial_sequence_weight", 0.2)?
            // Training defaults
            .set_default("training.holdout_days", 7)?
            .set_default("training.history_days", 730)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            // Export defaults
            .set_default("export.enabled", true)?
            .set_default("export.output_path", "./public/forecasts.json")?
            .set_default("export.history_weeks", 8)?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;
        Ok(builder)
    }

    /// Reject values the models cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.trend.interval_width) || self.trend.interval_width <= 0.0 {
            bail!("trend.interval_width must be in (0, 1)");
        }
        if !(0.0..=1.0).contains(&self.residual.subsample) || self.residual.subsample == 0.0 {
            bail!("residual.subsample must be in (0, 1]");
        }
        if self.residual.cv_folds < 2 {
            bail!("residual.cv_folds must be at least 2");
        }
        if self.sequence.sequence_length == 0 {
            bail!("sequence.sequence_length must be positive");
        }
        if self
            .market
            .peak_hours
            .iter()
            .chain(&self.market.daytime_hours)
            .chain(&self.market.extreme_low_hours)
            .any(|h| *h > 23)
        {
            bail!("market hour sets must contain hours 0..=23");
        }
        if let Err(e) = self.ensemble.mode.parse::<crate::types::CombinationMode>() {
            bail!("ensemble.mode: {}", e);
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "data_dir={} mode={} threshold={:.1} peak={:?} trees={} sequence={}",
            self.persistence.data_dir,
            self.ensemble.mode,
            self.market.low_price_threshold,
            self.market.peak_hours,
            self.residual.n_estimators,
            self.sequence.enabled
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

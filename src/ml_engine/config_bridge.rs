//! ML Engine Configuration Bridge
//!
//! Convierte AppConfig (del sistema de config) a MLEngineConfig (del motor ML).
//! Esto permite cargar configuración desde archivos YAML/env vars.

use crate::config::AppConfig;
use crate::ml_engine::{
    EnsembleConfig, FeatureSettings, MLEngineConfig, ResidualConfig, SequenceConfig,
    TrainingConfig, TrendConfig,
};
use crate::types::CombinationMode;

/// Trait para convertir configuración del sistema de config a MLEngineConfig
pub trait MLConfigConvertible {
    fn to_ml_engine_config(&self) -> MLEngineConfig;
}

impl MLConfigConvertible for AppConfig {
    fn to_ml_engine_config(&self) -> MLEngineConfig {
        MLEngineConfig {
            features: FeatureSettings {
                peak_hours: self.market.peak_hours.clone(),
                daytime_hours: self.market.daytime_hours.clone(),
                extreme_low_hours: self.market.extreme_low_hours.clone(),
                future_profile_days: self.features.future_profile_days,
            },
            trend: TrendConfig {
                n_changepoints: self.trend.n_changepoints,
                changepoint_range: self.trend.changepoint_range,
                changepoint_prior_scale: self.trend.changepoint_prior_scale,
                seasonality_prior_scale: self.trend.seasonality_prior_scale,
                holidays_prior_scale: self.trend.holidays_prior_scale,
                daily_fourier_order: self.trend.daily_fourier_order,
                weekly_fourier_order: self.trend.weekly_fourier_order,
                yearly_fourier_order: self.trend.yearly_fourier_order,
                interval_width: self.trend.interval_width,
                regressor_priors: self
                    .trend
                    .regressor_priors
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
            },
            residual: ResidualConfig {
                n_estimators: self.residual.n_estimators,
                max_depth: self.residual.max_depth,
                learning_rate: self.residual.learning_rate,
                subsample: self.residual.subsample,
                min_samples_leaf: self.residual.min_samples_leaf,
                cv_folds: self.residual.cv_folds,
                seed: self.residual.seed,
            },
            sequence: SequenceConfig {
                enabled: self.sequence.enabled,
                sequence_length: self.sequence.sequence_length,
                reservoir_size: self.sequence.reservoir_size,
                spectral_radius: self.sequence.spectral_radius,
                leak_rate: self.sequence.leak_rate,
                input_scaling: self.sequence.input_scaling,
                ridge_alpha: self.sequence.ridge_alpha,
                seed: self.sequence.seed,
            },
            ensemble: EnsembleConfig {
                mode: parse_mode(&self.ensemble.mode),
                stacking_factor: self.ensemble.stacking_factor,
                initial_trend_weight: self.ensemble.initial_trend_weight,
                initial_residual_weight: self.ensemble.initial_residual_weight,
                initial_sequence_weight: self.ensemble.initial_sequence_weight,
            },
            training: TrainingConfig {
                holdout_days: self.training.holdout_days,
                history_days: self.training.history_days,
            },
            low_price_threshold: self.market.low_price_threshold,
            holidays_file: self.trend.holidays_file.clone(),
        }
    }
}

fn parse_mode(s: &str) -> CombinationMode {
    match s.parse() {
        Ok(mode) => mode,
        Err(e) => {
            tracing::warn!("{}, using adaptive_weighted", e);
            CombinationMode::AdaptiveWeighted
        }
    }
}

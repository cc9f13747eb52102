//! ML Engine - Pronóstico semanal del precio de equilibrio (MCP)
//!
//! Este módulo implementa:
//! - Pipeline de features con contrato de capacidades
//! - Modelo de tendencia-estacionalidad con feriados y regresores
//! - Corrección residual con gradient boosting
//! - Modelo secuencial opcional
//! - Combinador del ensemble con pesos adaptativos
//! - Entrenamiento con cutoff obligatorio y persistencia de artefactos

pub mod config_bridge;
pub mod dataset;
pub mod ensemble;
pub mod features;
pub mod holidays;
pub mod linalg;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod training;

pub use dataset::{join_sources, Dataset, RawHourlyRow, SourceCapabilities, TimeSeriesSplit};
pub use ensemble::{
    CombinedForecast, ComponentMetric, ComponentMetrics, EnsembleCombiner, EnsembleConfig,
    EnsembleWeights,
};
pub use features::{BoundFeatures, FeatureContract, FeaturePipeline, FeatureRow, FeatureSettings};
pub use holidays::HolidayCalendar;
pub use metrics::{ErrorMetrics, MAPE_UNDEFINED};
pub use models::{
    ComponentModel, ResidualBoostModel, ResidualConfig, SequenceAvailability, SequenceConfig,
    SequenceModel, TrendConfig, TrendSeasonalityModel,
};
pub use persistence::{ModelStore, TrainingRecord};
pub use training::{TrainingPipeline, TrainingReport};

use serde::{Deserialize, Serialize};

/// Configuración global del ML Engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MLEngineConfig {
    /// Horas pico, ventana solar y riesgo de precio extremo bajo
    pub features: FeatureSettings,
    pub trend: TrendConfig,
    pub residual: ResidualConfig,
    pub sequence: SequenceConfig,
    pub ensemble: EnsembleConfig,
    pub training: TrainingConfig,
    /// Umbral bajo el cual no se calcula error porcentual
    pub low_price_threshold: f64,
    /// Calendario de feriados en YAML (None = calendario incorporado)
    pub holidays_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Días finales antes del cutoff usados como hold-out
    pub holdout_days: i64,
    /// Días de historia cargados para entrenar
    pub history_days: i64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            holdout_days: 7,
            history_days: 730,
        }
    }
}

impl Default for MLEngineConfig {
    fn default() -> Self {
        Self {
            features: FeatureSettings::default(),
            trend: TrendConfig::default(),
            residual: ResidualConfig::default(),
            sequence: SequenceConfig::default(),
            ensemble: EnsembleConfig::default(),
            training: TrainingConfig::default(),
            low_price_threshold: 100.0,
            holidays_file: None,
        }
    }
}

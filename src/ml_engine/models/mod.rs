//! Modelos de componentes del ensemble
//!
//! Tendencia-estacionalidad (ridge MAP), corrección residual (gradient
//! boosting sobre árboles SmartCore) y modelo secuencial opcional.

pub mod residual;
pub mod sequence;
pub mod trend;

pub use residual::{CrossValidationReport, ResidualBoostModel, ResidualConfig};
pub use sequence::{
    SequenceAvailability, SequenceConfig, SequenceModel, SequenceOutput, UnavailableReason,
};
pub use trend::{TrendConfig, TrendForecast, TrendSeasonalityModel};

use crate::ml_engine::ensemble::ComponentMetric;
use crate::types::{ComponentKind, Cutoff};
use chrono::NaiveDateTime;

/// Interfaz común de los modelos entrenados
pub trait ComponentModel {
    fn kind(&self) -> ComponentKind;

    /// Último timestamp usado en el entrenamiento
    fn trained_until(&self) -> NaiveDateTime;

    /// Métrica de validación registrada al entrenar
    fn validation_metric(&self) -> ComponentMetric;

    /// Ningún dato de entrenamiento en o después del cutoff
    fn respects(&self, cutoff: Cutoff) -> bool {
        cutoff.admits(self.trained_until())
    }
}

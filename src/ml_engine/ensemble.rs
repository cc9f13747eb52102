//! Ensemble combiner
//!
//! Mezcla tendencia, corrección residual y modelo secuencial. Los pesos
//! adaptativos son inverso-MAE sobre la última semana reconciliada y viajan
//! como un registro versionado explícito.

use crate::error::{ForecastError, Result};
use crate::ml_engine::models::{SequenceOutput, TrendForecast};
use crate::types::{CombinationMode, ComponentKind};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Error reciente de un componente
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ComponentMetric {
    Available(f64),
    Unavailable,
}

impl ComponentMetric {
    /// Solo un MAE finito y positivo es utilizable
    pub fn from_mae(mae: Option<f64>) -> Self {
        match mae {
            Some(v) if v.is_finite() && v > 0.0 => ComponentMetric::Available(v),
            _ => ComponentMetric::Unavailable,
        }
    }

    pub fn mae(&self) -> Option<f64> {
        match self {
            ComponentMetric::Available(v) => Some(*v),
            ComponentMetric::Unavailable => None,
        }
    }
}

/// Métricas por componente producidas por la reconciliación
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetrics {
    pub trend: ComponentMetric,
    pub residual: ComponentMetric,
    pub sequence: ComponentMetric,
}

impl ComponentMetrics {
    pub fn get(&self, kind: ComponentKind) -> ComponentMetric {
        match kind {
            ComponentKind::Trend => self.trend,
            ComponentKind::Residual => self.residual,
            ComponentKind::Sequence => self.sequence,
        }
    }

    pub fn usable(&self) -> usize {
        ComponentKind::ALL
            .iter()
            .filter(|k| self.get(**k).mae().is_some())
            .count()
    }
}

/// Configuración del combinador
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub mode: CombinationMode,
    pub stacking_factor: f64,
    pub initial_trend_weight: f64,
    pub initial_residual_weight: f64,
    pub initial_sequence_weight: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            mode: CombinationMode::AdaptiveWeighted,
            stacking_factor: 0.5,
            initial_trend_weight: 0.3,
            initial_residual_weight: 0.5,
            initial_sequence_weight: 0.2,
        }
    }
}

/// Pesos del ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub trend: f64,
    pub residual: f64,
    pub sequence: f64,
    pub version: u64,
    pub updated_at: Option<NaiveDateTime>,
    /// Semana reconciliada que produjo estos pesos
    pub source_week: Option<NaiveDate>,
}

impl EnsembleWeights {
    pub fn from_config(config: &EnsembleConfig) -> Self {
        let mut weights = Self {
            trend: config.initial_trend_weight,
            residual: config.initial_residual_weight,
            sequence: config.initial_sequence_weight,
            version: 0,
            updated_at: None,
            source_week: None,
        };
        weights.normalize();
        weights
    }

    pub fn normalize(&mut self) {
        let total = self.total();
        if total > 0.0 {
            self.trend /= total;
            self.residual /= total;
            self.sequence /= total;
        }
    }

    pub fn total(&self) -> f64 {
        self.trend + self.residual + self.sequence
    }

    pub fn get(&self, kind: ComponentKind) -> f64 {
        match kind {
            ComponentKind::Trend => self.trend,
            ComponentKind::Residual => self.residual,
            ComponentKind::Sequence => self.sequence,
        }
    }

    /// Pesos inverso-MAE; `None` si ningún componente tiene MAE utilizable
    pub fn from_metrics(
        metrics: &ComponentMetrics,
        previous_version: u64,
        source_week: NaiveDate,
        now: NaiveDateTime,
    ) -> Option<Self> {
        let inverse = |m: ComponentMetric| m.mae().map(|v| 1.0 / v).unwrap_or(0.0);
        let (t, r, s) = (
            inverse(metrics.trend),
            inverse(metrics.residual),
            inverse(metrics.sequence),
        );
        let total = t + r + s;
        if total <= 0.0 || !total.is_finite() {
            return None;
        }
        Some(Self {
            trend: t / total,
            residual: r / total,
            sequence: s / total,
            version: previous_version + 1,
            updated_at: Some(now),
            source_week: Some(source_week),
        })
    }

    /// Siguiente versión tras una reconciliación; conserva los pesos previos
    /// cuando ninguna métrica es utilizable
    pub fn updated(&self, metrics: &ComponentMetrics, source_week: NaiveDate, now: NaiveDateTime) -> Self {
        match Self::from_metrics(metrics, self.version, source_week, now) {
            Some(next) => {
                info!(
                    "📊 Ensemble weights v{}: trend={:.3} residual={:.3} sequence={:.3} (from week {})",
                    next.version, next.trend, next.residual, next.sequence, source_week
                );
                next
            }
            None => {
                warn!("⚠️ No usable component MAE for week {}, keeping weights v{}", source_week, self.version);
                self.clone()
            }
        }
    }

    /// Pesos (trend, residual) renormalizados sin el secuencial
    pub fn without_sequence(&self) -> (f64, f64) {
        let total = self.trend + self.residual;
        if total > 0.0 {
            (self.trend / total, self.residual / total)
        } else {
            (0.0, 1.0)
        }
    }

    /// Mismos pesos por componente, sin mirar versión ni fechas
    pub fn same_weights(&self, other: &Self) -> bool {
        self.trend == other.trend && self.residual == other.residual && self.sequence == other.sequence
    }

    pub fn is_normalized(&self) -> bool {
        (self.total() - 1.0).abs() <= WEIGHT_TOLERANCE
    }
}

/// Fila combinada de pronóstico
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedForecast {
    pub timestamp: NaiveDateTime,
    pub predicted: f64,
    pub trend: f64,
    pub residual: f64,
    pub sequence: Option<f64>,
    pub lower: f64,
    pub upper: f64,
    pub mode: CombinationMode,
}

/// Combinador del ensemble
#[derive(Debug, Clone)]
pub struct EnsembleCombiner {
    config: EnsembleConfig,
}

impl EnsembleCombiner {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Combinar los componentes fila a fila
    ///
    /// Sin secuencial, o con salida degenerada, todas las filas usan el
    /// fallback de 2 modelos. Las filas no puntuadas del secuencial también.
    pub fn combine(
        &self,
        trend: &TrendForecast,
        residual: &[f64],
        sequence: Option<&SequenceOutput>,
        weights: &EnsembleWeights,
    ) -> Result<Vec<CombinedForecast>> {
        let n = trend.yhat.len();
        if n == 0 {
            return Err(ForecastError::EmptyInput("trend forecast".to_string()));
        }
        if residual.len() != n {
            return Err(ForecastError::NumericalFailure(format!(
                "residual length {} does not match trend length {}",
                residual.len(),
                n
            )));
        }

        let sequence = match sequence {
            Some(out) if out.values.len() != n => {
                return Err(ForecastError::NumericalFailure(format!(
                    "sequence length {} does not match trend length {}",
                    out.values.len(),
                    n
                )));
            }
            Some(out) if out.is_degenerate() => {
                warn!("⚠️ Sequence output is degenerate, using 2-model fallback");
                None
            }
            other => other,
        };

        let rows = (0..n)
            .map(|i| {
                let t = trend.yhat[i];
                let r = residual[i];
                let base = t + r;
                let seq = sequence.and_then(|s| s.values[i]);
                let (predicted, mode) = match seq {
                    None => (base, CombinationMode::TwoModelFallback),
                    Some(s) => self.blend(t, r, s, weights),
                };
                CombinedForecast {
                    timestamp: trend.timestamps[i],
                    predicted,
                    trend: t,
                    residual: r,
                    sequence: seq,
                    lower: trend.lower[i] + r,
                    upper: trend.upper[i] + r,
                    mode,
                }
            })
            .collect::<Vec<_>>();

        let fallback = rows
            .iter()
            .filter(|r| r.mode == CombinationMode::TwoModelFallback)
            .count();
        debug!("Combined {} rows ({} via 2-model fallback)", n, fallback);
        Ok(rows)
    }

    fn blend(&self, trend: f64, residual: f64, sequence: f64, weights: &EnsembleWeights) -> (f64, CombinationMode) {
        let base = trend + residual;
        match self.config.mode {
            CombinationMode::ResidualStacking => (
                base + self.config.stacking_factor * (sequence - base),
                CombinationMode::ResidualStacking,
            ),
            CombinationMode::AdaptiveWeighted => {
                let value = if weights.sequence > 0.0 {
                    weights.trend * trend + weights.residual * base + weights.sequence * sequence
                } else {
                    let (wt, wr) = weights.without_sequence();
                    wt * trend + wr * base
                };
                (value, CombinationMode::AdaptiveWeighted)
            }
            CombinationMode::TwoModelFallback => (base, CombinationMode::TwoModelFallback),
        }
    }
}

/// Modo dominante de un lote, para el reporte del ciclo
pub fn dominant_mode(rows: &[CombinedForecast]) -> Option<CombinationMode> {
    let mut counts: Vec<(CombinationMode, usize)> = Vec::new();
    for row in rows {
        match counts.iter_mut().find(|(m, _)| *m == row.mode) {
            Some((_, c)) => *c += 1,
            None => counts.push((row.mode, 1)),
        }
    }
    counts.into_iter().max_by_key(|(_, c)| *c).map(|(m, _)| m)
}

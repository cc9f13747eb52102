//! Modelo secuencial opcional (echo-state network)
//!
//! Recorre una ventana deslizante de `sequence_length` horas de features
//! normalizadas min-max con un reservorio recurrente fijo y aleatorio
//! (semilla) y predice el precio de la hora siguiente con un readout ridge.
//! El escalador de features y de target se guarda con el artefacto.

use crate::error::{ForecastError, Result};
use crate::ml_engine::dataset::Dataset;
use crate::ml_engine::ensemble::ComponentMetric;
use crate::ml_engine::features::{FeatureRow, RESIDUAL_FEATURES};
use crate::ml_engine::linalg::ridge_solve;
use crate::ml_engine::models::ComponentModel;
use crate::types::{ComponentKind, Cutoff};
use chrono::NaiveDateTime;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

const RESERVOIR_DENSITY: f64 = 0.2;
const POWER_ITERATIONS: usize = 100;
/// Fracción final de ventanas usada para validar el readout
const VALIDATION_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub enabled: bool,
    pub sequence_length: usize,
    pub reservoir_size: usize,
    pub spectral_radius: f64,
    pub leak_rate: f64,
    pub input_scaling: f64,
    pub ridge_alpha: f64,
    pub seed: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sequence_length: 24,
            reservoir_size: 64,
            spectral_radius: 0.9,
            leak_rate: 0.3,
            input_scaling: 0.5,
            ridge_alpha: 1e-2,
            seed: 7,
        }
    }
}

/// Escalador min-max por columna
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl MinMaxScaler {
    pub fn fit(columns: &[Vec<f64>]) -> Self {
        let width = columns.first().map(|r| r.len()).unwrap_or(0);
        let mut min = vec![f64::INFINITY; width];
        let mut max = vec![f64::NEG_INFINITY; width];
        for row in columns {
            for (j, v) in row.iter().enumerate() {
                min[j] = min[j].min(*v);
                max[j] = max[j].max(*v);
            }
        }
        Self { min, max }
    }

    pub fn transform(&self, j: usize, v: f64) -> f64 {
        let range = self.max[j] - self.min[j];
        if range > 0.0 {
            (v - self.min[j]) / range
        } else {
            0.0
        }
    }

    pub fn inverse(&self, j: usize, v: f64) -> f64 {
        self.min[j] + v * (self.max[j] - self.min[j])
    }
}

/// Salida por fila; `None` para filas sin historia suficiente
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutput {
    pub values: Vec<Option<f64>>,
}

impl SequenceOutput {
    pub fn flagged(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    /// Sin ninguna fila puntuada o todas en cero
    pub fn is_degenerate(&self) -> bool {
        self.values.iter().flatten().all(|v| *v == 0.0)
    }
}

/// Modelo secuencial entrenado
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceModel {
    pub config: SequenceConfig,
    pub feature_names: Vec<String>,
    pub feature_scaler: MinMaxScaler,
    pub target_scaler: MinMaxScaler,
    w_in: Array2<f64>,
    w_res: Array2<f64>,
    readout: Vec<f64>,
    pub validation_mae: f64,
    pub trained_until: NaiveDateTime,
    pub cutoff: Cutoff,
    pub n_train: usize,
}

/// Por qué el componente secuencial no participa
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    RuntimeMissing,
    Disabled,
    ArtifactMissing(String),
    ArtifactUnreadable(String),
    TrainingFailed(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::RuntimeMissing => write!(f, "sequence runtime not compiled in"),
            UnavailableReason::Disabled => write!(f, "disabled in configuration"),
            UnavailableReason::ArtifactMissing(p) => write!(f, "artifact missing at {}", p),
            UnavailableReason::ArtifactUnreadable(e) => write!(f, "artifact unreadable: {}", e),
            UnavailableReason::TrainingFailed(e) => write!(f, "training failed: {}", e),
        }
    }
}

/// Resultado de la detección de capacidad
#[derive(Debug, Clone)]
pub enum SequenceAvailability {
    Available(SequenceModel),
    Unavailable(UnavailableReason),
}

impl SequenceAvailability {
    /// Runtime y configuración; el artefacto se comprueba al cargar
    pub fn runtime_check(config: &SequenceConfig) -> Option<UnavailableReason> {
        if !cfg!(feature = "sequence-model") {
            Some(UnavailableReason::RuntimeMissing)
        } else if !config.enabled {
            Some(UnavailableReason::Disabled)
        } else {
            None
        }
    }

    pub fn model(&self) -> Option<&SequenceModel> {
        match self {
            SequenceAvailability::Available(m) => Some(m),
            SequenceAvailability::Unavailable(_) => None,
        }
    }
}

impl SequenceModel {
    /// Entrenar con filas estrictamente anteriores al cutoff
    pub fn fit(rows: &[FeatureRow], cutoff: Cutoff, config: &SequenceConfig) -> Result<Self> {
        let dataset = Dataset::before(rows, cutoff);
        let needed = config.sequence_length + 10;
        if dataset.len() < needed {
            return Err(ForecastError::InsufficientHistory {
                needed,
                got: dataset.len(),
            });
        }
        let trained_until = dataset
            .last_timestamp()
            .ok_or_else(|| ForecastError::EmptyInput("sequence training rows".to_string()))?;
        if !cutoff.admits(trained_until) {
            return Err(ForecastError::LeakageViolation {
                trained_until,
                cutoff: cutoff.instant(),
            });
        }

        let feature_names: Vec<String> = RESIDUAL_FEATURES.iter().map(|s| s.to_string()).collect();
        let x = dataset.to_matrix(&feature_names);
        let y = dataset.targets();
        let feature_scaler = MinMaxScaler::fit(&x);
        let target_scaler = MinMaxScaler::fit(&y.iter().map(|v| vec![*v]).collect::<Vec<_>>());

        let (w_in, w_res) = init_reservoir(feature_names.len(), config);
        let mut model = Self {
            config: config.clone(),
            feature_names,
            feature_scaler,
            target_scaler,
            w_in,
            w_res,
            readout: Vec::new(),
            validation_mae: 0.0,
            trained_until,
            cutoff,
            n_train: dataset.len(),
        };

        let scaled = model.scale_rows(&x);
        let l = config.sequence_length;
        let states: Vec<Array1<f64>> = (l..scaled.len())
            .map(|i| model.run_window(&scaled[i - l..i]))
            .collect();
        let targets: Vec<f64> = y[l..]
            .iter()
            .map(|v| model.target_scaler.transform(0, *v))
            .collect();

        let split = ((states.len() as f64) * (1.0 - VALIDATION_FRACTION)).round() as usize;
        let split = split.clamp(1, states.len());
        if split < states.len() {
            let readout = model.solve_readout(&states[..split], &targets[..split])?;
            let errors: Vec<f64> = states[split..]
                .iter()
                .zip(&y[l + split..])
                .map(|(s, actual)| {
                    let pred = model.target_scaler.inverse(0, dot_readout(&readout, s));
                    (pred - actual).abs()
                })
                .collect();
            model.validation_mae = errors.iter().sum::<f64>() / errors.len() as f64;
        }
        model.readout = model.solve_readout(&states, &targets)?;

        info!(
            "🧠 Sequence model trained: reservoir={} window={} rows={} until {} (val mae={:.2})",
            config.reservoir_size, l, model.n_train, trained_until, model.validation_mae
        );
        Ok(model)
    }

    fn scale_rows(&self, x: &[Vec<f64>]) -> Vec<Vec<f64>> {
        x.iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| self.feature_scaler.transform(j, *v))
                    .collect()
            })
            .collect()
    }

    /// Estado final del reservorio tras recorrer la ventana desde cero
    fn run_window(&self, window: &[Vec<f64>]) -> Array1<f64> {
        let r = self.config.reservoir_size;
        let a = self.config.leak_rate;
        let mut state = Array1::<f64>::zeros(r);
        for step in window {
            let mut u = Array1::<f64>::zeros(step.len() + 1);
            u[0] = 1.0;
            for (j, v) in step.iter().enumerate() {
                u[j + 1] = *v;
            }
            let pre = self.w_in.dot(&u) + self.w_res.dot(&state);
            state = state * (1.0 - a) + pre.mapv(f64::tanh) * a;
        }
        state
    }

    fn solve_readout(&self, states: &[Array1<f64>], targets: &[f64]) -> Result<Vec<f64>> {
        let r = self.config.reservoir_size;
        let mut s = Array2::<f64>::zeros((states.len(), r + 1));
        for (i, state) in states.iter().enumerate() {
            s[[i, 0]] = 1.0;
            for j in 0..r {
                s[[i, j + 1]] = state[j];
            }
        }
        let mut penalties = vec![self.config.ridge_alpha; r + 1];
        penalties[0] = 0.0;
        let t = Array1::from_vec(targets.to_vec());
        Ok(ridge_solve(s.view(), t.view(), &penalties)?.to_vec())
    }

    /// Predicción por fila; las primeras `sequence_length` filas quedan marcadas
    pub fn predict(&self, rows: &[FeatureRow]) -> Result<SequenceOutput> {
        if self.readout.len() != self.config.reservoir_size + 1 {
            return Err(ForecastError::NumericalFailure(
                "sequence model has no fitted readout".to_string(),
            ));
        }
        let x: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| {
                self.feature_names
                    .iter()
                    .map(|n| r.value(n).unwrap_or(0.0))
                    .collect()
            })
            .collect();
        let scaled = self.scale_rows(&x);
        let l = self.config.sequence_length;
        let values = (0..rows.len())
            .map(|i| {
                if i < l {
                    None
                } else {
                    let state = self.run_window(&scaled[i - l..i]);
                    Some(self.target_scaler.inverse(0, dot_readout(&self.readout, &state)))
                }
            })
            .collect();
        Ok(SequenceOutput { values })
    }
}

fn dot_readout(readout: &[f64], state: &Array1<f64>) -> f64 {
    readout[0]
        + readout[1..]
            .iter()
            .zip(state.iter())
            .map(|(w, s)| w * s)
            .sum::<f64>()
}

/// Pesos de entrada y reservorio disperso escalado al radio espectral pedido
fn init_reservoir(n_inputs: usize, config: &SequenceConfig) -> (Array2<f64>, Array2<f64>) {
    let r = config.reservoir_size;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let w_in = Array2::from_shape_fn((r, n_inputs + 1), |_| {
        rng.gen_range(-1.0..1.0) * config.input_scaling
    });
    let mut w_res = Array2::from_shape_fn((r, r), |_| {
        if rng.gen_bool(RESERVOIR_DENSITY) {
            rng.gen_range(-0.5..0.5)
        } else {
            0.0
        }
    });

    let radius = estimate_spectral_radius(&w_res);
    if radius > 1e-12 {
        w_res *= config.spectral_radius / radius;
    }
    (w_in, w_res)
}

/// Iteración de potencias: tasa de crecimiento de ‖Wᵏv‖
fn estimate_spectral_radius(w: &Array2<f64>) -> f64 {
    let n = w.nrows();
    if n == 0 {
        return 0.0;
    }
    let mut v = Array1::<f64>::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut log_growth = 0.0;
    let mut counted = 0;
    for k in 0..POWER_ITERATIONS {
        let next = w.dot(&v);
        let norm = next.dot(&next).sqrt();
        if norm < 1e-300 {
            return 0.0;
        }
        // skip the transient before averaging
        if k >= POWER_ITERATIONS / 2 {
            log_growth += norm.ln();
            counted += 1;
        }
        v = next / norm;
    }
    (log_growth / counted as f64).exp()
}

impl ComponentModel for SequenceModel {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Sequence
    }

    fn trained_until(&self) -> NaiveDateTime {
        self.trained_until
    }

    fn validation_metric(&self) -> ComponentMetric {
        ComponentMetric::from_mae(Some(self.validation_mae))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::dataset::{RawHourlyRow, SourceCapabilities};
    use crate::ml_engine::features::{FeaturePipeline, FeatureSettings};
    use crate::ml_engine::holidays::HolidayCalendar;
    use chrono::{Duration, NaiveDate};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 11, 3)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn rows(days: i64) -> Vec<FeatureRow> {
        let raw: Vec<RawHourlyRow> = (0..days * 24)
            .map(|h| RawHourlyRow {
                timestamp: start() + Duration::hours(h),
                price: 2200.0 + 300.0 * ((h % 24) as f64 / 24.0 * std::f64::consts::TAU).cos(),
                consumption: 34_000.0,
                generation_total: 36_000.0,
                solar: 1_500.0,
                wind: 2_500.0,
                hydro: 6_000.0,
                natural_gas: 9_000.0,
                lignite: 7_000.0,
            })
            .collect();
        FeaturePipeline::new(
            FeatureSettings::default(),
            HolidayCalendar::builtin(),
            &SourceCapabilities::full(),
        )
        .build(&raw, None)
        .unwrap()
    }

    fn small_config() -> SequenceConfig {
        SequenceConfig {
            reservoir_size: 16,
            ..SequenceConfig::default()
        }
    }

    #[test]
    fn test_first_window_rows_are_flagged() {
        let data = rows(16);
        let cutoff = Cutoff::at(start() + Duration::days(14));
        let model = SequenceModel::fit(&data, cutoff, &small_config()).unwrap();
        let out = model.predict(&data[data.len() - 60..]).unwrap();
        assert_eq!(out.values.len(), 60);
        assert_eq!(out.flagged(), 24);
        assert!(out.values[..24].iter().all(|v| v.is_none()));
        assert!(out.values[24..].iter().all(|v| v.map_or(false, f64::is_finite)));
        assert!(!out.is_degenerate());
    }

    #[test]
    fn test_scaler_is_persisted_with_artifact() {
        let data = rows(12);
        let cutoff = Cutoff::at(start() + Duration::days(12));
        let model = SequenceModel::fit(&data, cutoff, &small_config()).unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let restored: SequenceModel = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.target_scaler, model.target_scaler);
        assert_eq!(restored.feature_scaler, model.feature_scaler);
        let a = model.predict(&data[..40]).unwrap();
        let b = restored.predict(&data[..40]).unwrap();
        assert_eq!(a, b);
        assert!(model.trained_until < cutoff.instant());
    }

    #[test]
    fn test_spectral_radius_scaling() {
        let (_, w) = init_reservoir(3, &small_config());
        let radius = estimate_spectral_radius(&w);
        assert!((radius - 0.9).abs() < 0.2, "radius {}", radius);
    }

    #[test]
    fn test_degenerate_output() {
        let out = SequenceOutput {
            values: vec![None, Some(0.0), Some(0.0)],
        };
        assert!(out.is_degenerate());
        let all_flagged = SequenceOutput { values: vec![None, None] };
        assert!(all_flagged.is_degenerate());
    }

    #[test]
    fn test_scaler_constant_column() {
        let scaler = MinMaxScaler::fit(&[vec![5.0], vec![5.0]]);
        assert_eq!(scaler.transform(0, 5.0), 0.0);
    }
}

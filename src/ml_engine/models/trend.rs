//! Modelo de tendencia y estacionalidad
//!
//! Descomposición aditiva ajustada por MAP (ridge por columna):
//! - Tendencia lineal por tramos con changepoints automáticos
//! - Estacionalidades diaria, semanal y anual (series de Fourier)
//! - Indicadores de feriados con ventana de día siguiente
//! - Regresores exógenos estandarizados
//!
//! Cada grupo de columnas se penaliza con `1 / prior_scale²`, de modo que un
//! prior_scale mayor permite una contribución aditiva mayor.

use crate::error::{ForecastError, Result};
use crate::ml_engine::dataset::Dataset;
use crate::ml_engine::ensemble::ComponentMetric;
use crate::ml_engine::features::{FeatureContract, FeatureRow, TREND_REGRESSORS};
use crate::ml_engine::holidays::HolidayCalendar;
use crate::ml_engine::linalg::ridge_solve;
use crate::ml_engine::models::ComponentModel;
use crate::types::{ComponentKind, Cutoff};
use chrono::NaiveDateTime;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tracing::info;

const DAILY_PERIOD_HOURS: f64 = 24.0;
const WEEKLY_PERIOD_HOURS: f64 = 168.0;
const YEARLY_PERIOD_HOURS: f64 = 365.25 * 24.0;
/// Filas mínimas para ajustar
pub const MIN_TRAINING_ROWS: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    pub n_changepoints: usize,
    /// Fracción inicial de la historia donde se colocan changepoints
    pub changepoint_range: f64,
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    pub holidays_prior_scale: f64,
    pub daily_fourier_order: usize,
    pub weekly_fourier_order: usize,
    pub yearly_fourier_order: usize,
    pub interval_width: f64,
    pub regressor_priors: BTreeMap<String, f64>,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            n_changepoints: 25,
            changepoint_range: 0.8,
            changepoint_prior_scale: 0.1,
            seasonality_prior_scale: 10.0,
            holidays_prior_scale: 10.0,
            daily_fourier_order: 4,
            weekly_fourier_order: 3,
            yearly_fourier_order: 10,
            interval_width: 0.95,
            regressor_priors: [
                ("consumption", 20.0),
                ("supply_demand_gap", 15.0),
                ("renewable_ratio", 12.0),
                ("fossil_ratio", 10.0),
                ("price_lag_24h", 8.0),
            ]
            .into_iter()
            .map(|(n, s)| (n.to_string(), s))
            .collect(),
        }
    }
}

/// Regresor estandarizado con su prior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressorSpec {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub prior_scale: f64,
}

/// Predicción puntual con intervalo
#[derive(Debug, Clone, PartialEq)]
pub struct TrendForecast {
    pub timestamps: Vec<NaiveDateTime>,
    pub yhat: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

/// Modelo de tendencia-estacionalidad ajustado
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSeasonalityModel {
    pub config: TrendConfig,
    pub calendar: HolidayCalendar,
    pub holiday_names: Vec<String>,
    pub regressors: Vec<RegressorSpec>,
    t_start: NaiveDateTime,
    t_span_hours: f64,
    changepoints: Vec<f64>,
    y_scale: f64,
    coefficients: Vec<f64>,
    /// Desviación de los residuos en escala original
    pub sigma: f64,
    pub in_sample_mae: f64,
    pub trained_until: NaiveDateTime,
    pub cutoff: Cutoff,
    pub n_train: usize,
}

fn hours_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

impl TrendSeasonalityModel {
    /// Ajustar con filas estrictamente anteriores al cutoff
    pub fn fit(
        rows: &[FeatureRow],
        cutoff: Cutoff,
        config: &TrendConfig,
        calendar: &HolidayCalendar,
    ) -> Result<Self> {
        let dataset = Dataset::before(rows, cutoff);
        if dataset.len() < MIN_TRAINING_ROWS {
            return Err(ForecastError::InsufficientHistory {
                needed: MIN_TRAINING_ROWS,
                got: dataset.len(),
            });
        }
        let t_start = dataset.rows[0].timestamp;
        let trained_until = dataset
            .last_timestamp()
            .ok_or_else(|| ForecastError::EmptyInput("trend training rows".to_string()))?;
        if !cutoff.admits(trained_until) {
            return Err(ForecastError::LeakageViolation {
                trained_until,
                cutoff: cutoff.instant(),
            });
        }

        let y = dataset.targets();
        let y_scale = y.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let y_scale = if y_scale > 0.0 { y_scale } else { 1.0 };

        let regressors = TREND_REGRESSORS
            .iter()
            .map(|name| {
                let values: Vec<f64> = dataset
                    .rows
                    .iter()
                    .map(|r| r.value(name).unwrap_or(0.0))
                    .collect();
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                let std = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
                RegressorSpec {
                    name: name.to_string(),
                    mean,
                    std,
                    prior_scale: config.regressor_priors.get(*name).copied().unwrap_or(10.0),
                }
            })
            .collect();

        let n_cp = config.n_changepoints.min(dataset.len().saturating_sub(1));
        let changepoints = (1..=n_cp)
            .map(|j| config.changepoint_range * j as f64 / n_cp as f64)
            .collect();

        let mut model = Self {
            config: config.clone(),
            calendar: calendar.clone(),
            holiday_names: calendar.names(),
            regressors,
            t_start,
            t_span_hours: hours_between(t_start, trained_until).max(1.0),
            changepoints,
            y_scale,
            coefficients: Vec::new(),
            sigma: 0.0,
            in_sample_mae: 0.0,
            trained_until,
            cutoff,
            n_train: dataset.len(),
        };

        let x = model.design_matrix(&dataset.rows)?;
        let y_scaled = Array1::from_iter(y.iter().map(|v| v / y_scale));
        let penalties = model.penalties();
        let beta = ridge_solve(x.view(), y_scaled.view(), &penalties)?;
        if beta.iter().any(|b| !b.is_finite()) {
            return Err(ForecastError::NumericalFailure(
                "trend coefficients not finite".to_string(),
            ));
        }
        model.coefficients = beta.to_vec();

        let fitted: Vec<f64> = x.dot(&beta).iter().map(|v| v * y_scale).collect();
        let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(a, f)| a - f).collect();
        let n = residuals.len() as f64;
        model.sigma = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
        model.in_sample_mae = residuals.iter().map(|r| r.abs()).sum::<f64>() / n;

        info!(
            "🧠 Trend model trained on {} rows until {} ({} columns, sigma={:.2}, mae={:.2})",
            model.n_train,
            trained_until,
            penalties.len(),
            model.sigma,
            model.in_sample_mae
        );
        Ok(model)
    }

    /// Nombres de regresores usados al ajustar
    pub fn regressor_names(&self) -> Vec<String> {
        self.regressors.iter().map(|r| r.name.clone()).collect()
    }

    /// Los regresores deben estar en el contrato de features
    pub fn check_contract(&self, contract: &FeatureContract) -> Result<()> {
        contract.require(&self.regressor_names())
    }

    fn n_fourier(&self) -> usize {
        2 * (self.config.daily_fourier_order
            + self.config.weekly_fourier_order
            + self.config.yearly_fourier_order)
    }

    fn n_columns(&self) -> usize {
        2 + self.changepoints.len()
            + self.n_fourier()
            + self.holiday_names.len()
            + self.regressors.len()
    }

    /// Penalización por columna, en el mismo orden que `design_row`
    fn penalties(&self) -> Vec<f64> {
        let inv_sq = |s: f64| 1.0 / (s * s).max(1e-12);
        let mut p = vec![0.0, 0.0];
        p.extend(std::iter::repeat(inv_sq(self.config.changepoint_prior_scale)).take(self.changepoints.len()));
        p.extend(std::iter::repeat(inv_sq(self.config.seasonality_prior_scale)).take(self.n_fourier()));
        p.extend(std::iter::repeat(inv_sq(self.config.holidays_prior_scale)).take(self.holiday_names.len()));
        p.extend(self.regressors.iter().map(|r| inv_sq(r.prior_scale)));
        p
    }

    fn design_row(&self, row: &FeatureRow) -> Result<Vec<f64>> {
        let mut x = Vec::with_capacity(self.n_columns());
        let t = hours_between(self.t_start, row.timestamp) / self.t_span_hours;

        x.push(1.0);
        x.push(t);
        x.extend(self.changepoints.iter().map(|c| (t - c).max(0.0)));

        let abs_hours = row.timestamp.and_utc().timestamp() as f64 / 3600.0;
        for (period, order) in [
            (DAILY_PERIOD_HOURS, self.config.daily_fourier_order),
            (WEEKLY_PERIOD_HOURS, self.config.weekly_fourier_order),
            (YEARLY_PERIOD_HOURS, self.config.yearly_fourier_order),
        ] {
            for k in 1..=order {
                let angle = 2.0 * PI * k as f64 * abs_hours / period;
                x.push(angle.sin());
                x.push(angle.cos());
            }
        }

        let active = self.calendar.active_on(row.timestamp.date());
        x.extend(
            self.holiday_names
                .iter()
                .map(|n| if active.contains(&n.as_str()) { 1.0 } else { 0.0 }),
        );

        for spec in &self.regressors {
            let value = row.value(&spec.name).ok_or_else(|| ForecastError::FeatureMismatch {
                missing: vec![spec.name.clone()],
            })?;
            x.push((value - spec.mean) / spec.std);
        }
        Ok(x)
    }

    fn design_matrix(&self, rows: &[FeatureRow]) -> Result<Array2<f64>> {
        let p = self.n_columns();
        let mut x = Array2::<f64>::zeros((rows.len(), p));
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in self.design_row(row)?.into_iter().enumerate() {
                x[[i, j]] = v;
            }
        }
        Ok(x)
    }

    /// Predicción con intervalo al ancho configurado
    pub fn predict(&self, rows: &[FeatureRow]) -> Result<TrendForecast> {
        if self.coefficients.len() != self.n_columns() {
            return Err(ForecastError::NumericalFailure(
                "trend model has no fitted coefficients".to_string(),
            ));
        }
        let z = Normal::new(0.0, 1.0)
            .map_err(|e| ForecastError::NumericalFailure(e.to_string()))?
            .inverse_cdf(0.5 + self.config.interval_width / 2.0);
        let half_width = z * self.sigma;

        let mut out = TrendForecast {
            timestamps: Vec::with_capacity(rows.len()),
            yhat: Vec::with_capacity(rows.len()),
            lower: Vec::with_capacity(rows.len()),
            upper: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            let x = self.design_row(row)?;
            let yhat = x
                .iter()
                .zip(&self.coefficients)
                .map(|(a, b)| a * b)
                .sum::<f64>()
                * self.y_scale;
            out.timestamps.push(row.timestamp);
            out.yhat.push(yhat);
            out.lower.push(yhat - half_width);
            out.upper.push(yhat + half_width);
        }
        Ok(out)
    }
}

impl ComponentModel for TrendSeasonalityModel {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Trend
    }

    fn trained_until(&self) -> NaiveDateTime {
        self.trained_until
    }

    fn validation_metric(&self) -> ComponentMetric {
        ComponentMetric::from_mae(Some(self.in_sample_mae))
    }
}

//! Modelo de corrección de residuos (gradient boosting)
//!
//! Aprende `residual = precio − predicción de tendencia` con árboles de
//! regresión de SmartCore ajustados secuencialmente sobre el gradiente
//! (pérdida cuadrática), con shrinkage y submuestreo de filas.
//!
//! La validación usa k-fold temporal: cada ventana de validación es
//! estrictamente posterior a su ventana de entrenamiento.

use crate::error::{ForecastError, Result};
use crate::ml_engine::dataset::{Dataset, TimeSeriesSplit};
use crate::ml_engine::ensemble::ComponentMetric;
use crate::ml_engine::features::{BoundFeatures, FeatureContract, FeatureRow, RESIDUAL_FEATURES};
use crate::ml_engine::metrics::mean_absolute_error;
use crate::ml_engine::models::trend::TrendSeasonalityModel;
use crate::ml_engine::models::ComponentModel;
use crate::types::{ComponentKind, Cutoff};
use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};
use tracing::{info, warn};

type RegressionTree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Filas mínimas para ajustar
pub const MIN_TRAINING_ROWS: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualConfig {
    pub n_estimators: usize,
    pub max_depth: u16,
    pub learning_rate: f64,
    /// Fracción de filas por árbol
    pub subsample: f64,
    pub min_samples_leaf: usize,
    pub cv_folds: usize,
    pub seed: u64,
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            n_estimators: 300,
            max_depth: 7,
            learning_rate: 0.03,
            subsample: 0.8,
            min_samples_leaf: 3,
            cv_folds: 5,
            seed: 42,
        }
    }
}

/// Resultado de la validación cruzada temporal
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CrossValidationReport {
    pub fold_mae: Vec<f64>,
    pub mean_mae: f64,
}

/// Ensemble de árboles ajustado por boosting
#[derive(Debug, Serialize, Deserialize)]
struct Booster {
    base_score: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

fn to_dense(rows: &[Vec<f64>]) -> Result<DenseMatrix<f64>> {
    let refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
    DenseMatrix::from_2d_array(&refs).map_err(|e| ForecastError::NumericalFailure(e.to_string()))
}

impl Booster {
    fn fit(x: &[Vec<f64>], y: &[f64], config: &ResidualConfig) -> Result<Self> {
        let n = y.len();
        if n == 0 || x.len() != n {
            return Err(ForecastError::EmptyInput("boosting rows".to_string()));
        }
        let base_score = y.iter().sum::<f64>() / n as f64;
        let mut fitted = vec![base_score; n];
        let full = to_dense(x)?;
        let sample_size = ((n as f64 * config.subsample).round() as usize).clamp(1, n);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = DecisionTreeRegressorParameters::default()
            .with_max_depth(config.max_depth)
            .with_min_samples_leaf(config.min_samples_leaf)
            .with_min_samples_split(2 * config.min_samples_leaf.max(1));

        let mut trees = Vec::with_capacity(config.n_estimators);
        for _ in 0..config.n_estimators {
            let mut idx = sample(&mut rng, n, sample_size).into_vec();
            idx.sort_unstable();
            let x_sub: Vec<Vec<f64>> = idx.iter().map(|&i| x[i].clone()).collect();
            let g_sub: Vec<f64> = idx.iter().map(|&i| y[i] - fitted[i]).collect();

            let tree = RegressionTree::fit(&to_dense(&x_sub)?, &g_sub, params.clone())
                .map_err(|e| ForecastError::NumericalFailure(e.to_string()))?;
            let step = tree
                .predict(&full)
                .map_err(|e| ForecastError::NumericalFailure(e.to_string()))?;
            for (f, s) in fitted.iter_mut().zip(&step) {
                *f += config.learning_rate * s;
            }
            trees.push(tree);
        }

        Ok(Self {
            base_score,
            learning_rate: config.learning_rate,
            trees,
        })
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        if x.is_empty() {
            return Ok(Vec::new());
        }
        let dense = to_dense(x)?;
        let mut out = vec![self.base_score; x.len()];
        for tree in &self.trees {
            let step = tree
                .predict(&dense)
                .map_err(|e| ForecastError::NumericalFailure(e.to_string()))?;
            for (o, s) in out.iter_mut().zip(&step) {
                *o += self.learning_rate * s;
            }
        }
        Ok(out)
    }
}

/// Modelo de residuos entrenado
#[derive(Debug, Serialize, Deserialize)]
pub struct ResidualBoostModel {
    pub config: ResidualConfig,
    /// Lista ordenada exacta de features del entrenamiento
    pub feature_names: Vec<String>,
    /// Medias de entrenamiento, usadas para imputar features ausentes
    pub feature_means: Vec<f64>,
    booster: Booster,
    pub cv: CrossValidationReport,
    pub trained_until: NaiveDateTime,
    pub cutoff: Cutoff,
    pub n_train: usize,
}

impl ResidualBoostModel {
    /// Ajustar sobre los residuos del modelo de tendencia antes del cutoff
    pub fn fit(
        rows: &[FeatureRow],
        trend: &TrendSeasonalityModel,
        cutoff: Cutoff,
        config: &ResidualConfig,
    ) -> Result<Self> {
        let dataset = Dataset::before(rows, cutoff);
        if dataset.len() < MIN_TRAINING_ROWS {
            return Err(ForecastError::InsufficientHistory {
                needed: MIN_TRAINING_ROWS,
                got: dataset.len(),
            });
        }
        let trained_until = dataset
            .last_timestamp()
            .ok_or_else(|| ForecastError::EmptyInput("residual training rows".to_string()))?;
        if !cutoff.admits(trained_until) {
            return Err(ForecastError::LeakageViolation {
                trained_until,
                cutoff: cutoff.instant(),
            });
        }

        let trend_fit = trend.predict(&dataset.rows)?;
        let target: Vec<f64> = dataset
            .targets()
            .iter()
            .zip(&trend_fit.yhat)
            .map(|(y, t)| y - t)
            .collect();

        let feature_names: Vec<String> = RESIDUAL_FEATURES.iter().map(|s| s.to_string()).collect();
        let x = dataset.to_matrix(&feature_names);
        let n = x.len() as f64;
        let feature_means = (0..feature_names.len())
            .map(|j| x.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect();

        let cv = Self::cross_validate(&x, &target, config)?;
        let booster = Booster::fit(&x, &target, config)?;

        info!(
            "🧠 Residual model trained: {} trees on {} rows until {} (cv mae={:.2} over {} folds)",
            booster.trees.len(),
            dataset.len(),
            trained_until,
            cv.mean_mae,
            cv.fold_mae.len()
        );

        Ok(Self {
            config: config.clone(),
            feature_names,
            feature_means,
            booster,
            cv,
            trained_until,
            cutoff,
            n_train: dataset.len(),
        })
    }

    fn cross_validate(
        x: &[Vec<f64>],
        y: &[f64],
        config: &ResidualConfig,
    ) -> Result<CrossValidationReport> {
        let folds = TimeSeriesSplit::new(config.cv_folds).split(y.len())?;
        let mut fold_mae = Vec::with_capacity(folds.len());
        for fold in folds {
            let booster = Booster::fit(&x[fold.train.clone()], &y[fold.train.clone()], config)?;
            let pred = booster.predict(&x[fold.validation.clone()])?;
            if let Some(mae) = mean_absolute_error(&y[fold.validation.clone()], &pred) {
                fold_mae.push(mae);
            }
        }
        let mean_mae = if fold_mae.is_empty() {
            0.0
        } else {
            fold_mae.iter().sum::<f64>() / fold_mae.len() as f64
        };
        Ok(CrossValidationReport { fold_mae, mean_mae })
    }

    /// Negociar una sola vez contra el contrato del pipeline
    pub fn bind(&self, contract: &FeatureContract) -> BoundFeatures {
        let bound = contract.bind(&self.feature_names);
        if let BoundFeatures::Degraded { missing } = &bound {
            warn!(
                "⚠️ Residual model degraded: {} of {} features missing ({:?}); using the intersection, missing ones imputed with training means",
                missing.len(),
                self.feature_names.len(),
                missing
            );
        }
        bound
    }

    /// Corrección por fila
    pub fn predict(&self, rows: &[FeatureRow], bound: &BoundFeatures) -> Result<Vec<f64>> {
        let missing: &[String] = match bound {
            BoundFeatures::Full => &[],
            BoundFeatures::Degraded { missing } => missing,
        };
        let x: Vec<Vec<f64>> = rows
            .iter()
            .map(|row| {
                self.feature_names
                    .iter()
                    .zip(&self.feature_means)
                    .map(|(name, mean)| {
                        if missing.contains(name) {
                            *mean
                        } else {
                            row.value(name).unwrap_or(*mean)
                        }
                    })
                    .collect()
            })
            .collect();
        self.booster.predict(&x)
    }

    pub fn n_trees(&self) -> usize {
        self.booster.trees.len()
    }
}

impl ComponentModel for ResidualBoostModel {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Residual
    }

    fn trained_until(&self) -> NaiveDateTime {
        self.trained_until
    }

    fn validation_metric(&self) -> ComponentMetric {
        ComponentMetric::from_mae(Some(self.cv.mean_mae))
    }
}

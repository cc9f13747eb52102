//! Training Pipeline - Reentrenamiento con cutoff obligatorio y hold-out
//!
//! Cada reentrenamiento recibe un `Cutoff` por valor. El reporte de hold-out
//! usa un modelo de prueba ajustado antes de `cutoff - holdout_days` y
//! evaluado en los días restantes; el modelo final usa toda la historia
//! anterior al cutoff.

use crate::error::{ForecastError, Result};
use crate::ml_engine::dataset::Dataset;
use crate::ml_engine::ensemble::ComponentMetric;
use crate::ml_engine::features::{BoundFeatures, FeatureRow};
use crate::ml_engine::holidays::HolidayCalendar;
use crate::ml_engine::metrics::{evaluate, ErrorMetrics};
use crate::ml_engine::models::{
    ComponentModel, ResidualBoostModel, SequenceModel, TrendSeasonalityModel,
};
use crate::ml_engine::MLEngineConfig;
use crate::types::{ComponentKind, Cutoff};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Reporte de un reentrenamiento
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub component: ComponentKind,
    pub cutoff: Cutoff,
    pub trained_until: NaiveDateTime,
    pub train_rows: usize,
    pub holdout_rows: usize,
    /// Métricas del modelo de prueba sobre el hold-out
    pub holdout: Option<ErrorMetrics>,
    /// Métrica de validación interna del modelo final
    pub validation: ComponentMetric,
}

/// Modelo entrenado junto a su reporte
#[derive(Debug)]
pub struct Trained<M> {
    pub model: M,
    pub report: TrainingReport,
}

/// Pipeline de entrenamiento
pub struct TrainingPipeline {
    config: MLEngineConfig,
    calendar: HolidayCalendar,
}

impl TrainingPipeline {
    pub fn new(config: MLEngineConfig, calendar: HolidayCalendar) -> Self {
        Self { config, calendar }
    }

    pub fn config(&self) -> &MLEngineConfig {
        &self.config
    }

    fn holdout_start(&self, cutoff: Cutoff) -> Option<NaiveDateTime> {
        if self.config.training.holdout_days <= 0 {
            None
        } else {
            Some(cutoff.instant() - Duration::days(self.config.training.holdout_days))
        }
    }

    /// Filas observadas del hold-out y el índice de la primera en `rows`
    fn holdout_rows(rows: &[FeatureRow], start: NaiveDateTime, cutoff: Cutoff) -> (usize, Vec<FeatureRow>) {
        let first = rows.partition_point(|r| r.timestamp < start);
        let held = rows[first..]
            .iter()
            .filter(|r| cutoff.admits(r.timestamp) && r.price.is_some())
            .cloned()
            .collect();
        (first, held)
    }

    fn report<M: ComponentModel>(
        &self,
        model: &M,
        cutoff: Cutoff,
        train_rows: usize,
        holdout: Option<(usize, ErrorMetrics)>,
    ) -> Result<TrainingReport> {
        if !model.respects(cutoff) {
            return Err(ForecastError::LeakageViolation {
                trained_until: model.trained_until(),
                cutoff: cutoff.instant(),
            });
        }
        let (holdout_rows, holdout) = match holdout {
            Some((n, m)) => (n, Some(m)),
            None => (0, None),
        };
        let report = TrainingReport {
            component: model.kind(),
            cutoff,
            trained_until: model.trained_until(),
            train_rows,
            holdout_rows,
            holdout,
            validation: model.validation_metric(),
        };
        match &report.holdout {
            Some(m) => info!(
                "📊 {} hold-out ({} rows): MAE={:.2} RMSE={:.2} MAPE={:.2}%",
                report.component, holdout_rows, m.mae, m.rmse, m.mape
            ),
            None => info!("📊 {} trained without hold-out report", report.component),
        }
        Ok(report)
    }

    fn score(&self, actual: &[f64], predicted: &[f64]) -> Option<(usize, ErrorMetrics)> {
        match evaluate(actual, predicted, self.config.low_price_threshold) {
            Ok(m) => Some((actual.len(), m)),
            Err(e) => {
                warn!("⚠️ Hold-out scoring skipped: {}", e);
                None
            }
        }
    }

    /// Reentrenar tendencia-estacionalidad
    pub fn retrain_trend(&self, rows: &[FeatureRow], cutoff: Cutoff) -> Result<Trained<TrendSeasonalityModel>> {
        let holdout = self.holdout_start(cutoff).and_then(|start| {
            let (_, held) = Self::holdout_rows(rows, start, cutoff);
            if held.is_empty() {
                return None;
            }
            let holdout_fit = TrendSeasonalityModel::fit(rows, Cutoff::at(start), &self.config.trend, &self.calendar);
            match holdout_fit.and_then(|m| m.predict(&held)) {
                Ok(fc) => self.score(&targets(&held), &fc.yhat),
                Err(e) => {
                    warn!("⚠️ Trend hold-out evaluation failed: {}", e);
                    None
                }
            }
        });

        let model = TrendSeasonalityModel::fit(rows, cutoff, &self.config.trend, &self.calendar)?;
        let report = self.report(&model, cutoff, model.n_train, holdout)?;
        Ok(Trained { model, report })
    }

    /// Reentrenar la corrección residual sobre una tendencia ya ajustada
    pub fn retrain_residual(
        &self,
        rows: &[FeatureRow],
        trend: &TrendSeasonalityModel,
        cutoff: Cutoff,
    ) -> Result<Trained<ResidualBoostModel>> {
        let holdout = self.holdout_start(cutoff).and_then(|start| {
            let (_, held) = Self::holdout_rows(rows, start, cutoff);
            if held.is_empty() {
                return None;
            }
            let holdout_cutoff = Cutoff::at(start);
            let holdout_fit = TrendSeasonalityModel::fit(rows, holdout_cutoff, &self.config.trend, &self.calendar)
                .and_then(|t| {
                    let r = ResidualBoostModel::fit(rows, &t, holdout_cutoff, &self.config.residual)?;
                    let base = t.predict(&held)?;
                    let correction = r.predict(&held, &BoundFeatures::Full)?;
                    Ok(base
                        .yhat
                        .iter()
                        .zip(&correction)
                        .map(|(a, b)| a + b)
                        .collect::<Vec<_>>())
                });
            match holdout_fit {
                Ok(pred) => self.score(&targets(&held), &pred),
                Err(e) => {
                    warn!("⚠️ Residual hold-out evaluation failed: {}", e);
                    None
                }
            }
        });

        let model = ResidualBoostModel::fit(rows, trend, cutoff, &self.config.residual)?;
        let report = self.report(&model, cutoff, model.n_train, holdout)?;
        Ok(Trained { model, report })
    }

    /// Reentrenar el modelo secuencial
    pub fn retrain_sequence(&self, rows: &[FeatureRow], cutoff: Cutoff) -> Result<Trained<SequenceModel>> {
        let l = self.config.sequence.sequence_length;
        let holdout = self.holdout_start(cutoff).and_then(|start| {
            let (first, held) = Self::holdout_rows(rows, start, cutoff);
            if held.is_empty() || first < l {
                return None;
            }
            let holdout_fit = SequenceModel::fit(rows, Cutoff::at(start), &self.config.sequence);
            // context rows so the hold-out itself is scored
            let batch = Dataset::before(&rows[first - l..], cutoff).rows;
            match holdout_fit.and_then(|m| m.predict(&batch)) {
                Ok(out) => {
                    let (actual, predicted): (Vec<f64>, Vec<f64>) = batch
                        .iter()
                        .zip(&out.values)
                        .skip(l)
                        .filter_map(|(row, v)| Some((row.price?, (*v)?)))
                        .unzip();
                    self.score(&actual, &predicted)
                }
                Err(e) => {
                    warn!("⚠️ Sequence hold-out evaluation failed: {}", e);
                    None
                }
            }
        });

        let model = SequenceModel::fit(rows, cutoff, &self.config.sequence)?;
        let report = self.report(&model, cutoff, model.n_train, holdout)?;
        Ok(Trained { model, report })
    }
}

fn targets(rows: &[FeatureRow]) -> Vec<f64> {
    rows.iter().filter_map(|r| r.price).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::dataset::{RawHourlyRow, SourceCapabilities};
    use crate::ml_engine::features::{FeaturePipeline, FeatureSettings};
    use crate::ml_engine::models::{ResidualConfig, SequenceConfig};
    use crate::ml_engine::TrainingConfig;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 9, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn rows(days: i64) -> Vec<FeatureRow> {
        let raw: Vec<RawHourlyRow> = (0..days * 24)
            .map(|h| {
                let hour = (h % 24) as f64;
                RawHourlyRow {
                    timestamp: start() + Duration::hours(h),
                    price: 2000.0 + 400.0 * (hour / 24.0 * std::f64::consts::TAU).sin() + (h % 7) as f64,
                    consumption: 32_000.0 + 2_000.0 * (hour / 24.0 * std::f64::consts::TAU).sin(),
                    generation_total: 35_000.0,
                    solar: if (10.0..=15.0).contains(&hour) { 3_000.0 } else { 0.0 },
                    wind: 2_000.0,
                    hydro: 5_000.0,
                    natural_gas: 10_000.0,
                    lignite: 8_000.0,
                }
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

    fn pipeline(holdout_days: i64) -> TrainingPipeline {
        let config = MLEngineConfig {
            residual: ResidualConfig {
                n_estimators: 10,
                max_depth: 3,
                cv_folds: 2,
                ..ResidualConfig::default()
            },
            sequence: SequenceConfig {
                reservoir_size: 12,
                ..SequenceConfig::default()
            },
            training: TrainingConfig {
                holdout_days,
                history_days: 60,
            },
            ..MLEngineConfig::default()
        };
        TrainingPipeline::new(config, HolidayCalendar::builtin())
    }

    #[test]
    fn test_trend_respects_cutoff_and_reports_holdout() {
        let data = rows(28);
        let cutoff = Cutoff::at(start() + Duration::days(21));
        let trained = pipeline(3).retrain_trend(&data, cutoff).unwrap();
        assert!(trained.model.trained_until < cutoff.instant());
        assert_eq!(trained.report.component, ComponentKind::Trend);
        assert_eq!(trained.report.holdout_rows, 72);
        assert!(trained.report.holdout.is_some());
    }

    #[test]
    fn test_residual_report() {
        let data = rows(28);
        let cutoff = Cutoff::at(start() + Duration::days(21));
        let p = pipeline(2);
        let trend = p.retrain_trend(&data, cutoff).unwrap().model;
        let trained = p.retrain_residual(&data, &trend, cutoff).unwrap();
        assert!(trained.model.trained_until < cutoff.instant());
        assert_eq!(trained.report.component, ComponentKind::Residual);
        assert!(trained.report.holdout.is_some());
    }

    #[test]
    fn test_holdout_disabled() {
        let data = rows(20);
        let cutoff = Cutoff::at(start() + Duration::days(20));
        let trained = pipeline(0).retrain_sequence(&data, cutoff).unwrap();
        assert!(trained.report.holdout.is_none());
        assert_eq!(trained.report.holdout_rows, 0);
        assert_eq!(trained.report.component, ComponentKind::Sequence);
    }
}

//! Reconciliation of stored forecasts against observed prices
//!
//! Every run recomputes the week from the stored predictions and the actuals,
//! so repeated runs store identical metrics.

use crate::error::ForecastError;
use crate::ml_engine::ensemble::{ComponentMetric, ComponentMetrics};
use crate::ml_engine::metrics::{evaluate, mean_absolute_error, percentage_error, ErrorMetrics};
use crate::persistence::{ForecastStore, MarketDataSource};
use crate::types::{ForecastRecord, WeekWindow, WeeklyPerformanceRecord};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use tracing::{info, warn};

/// Outcome of reconciling one week
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
    pub week: WeekWindow,
    pub performance: WeeklyPerformanceRecord,
    pub metrics: ErrorMetrics,
    pub components: ComponentMetrics,
    /// Matched rows with actual and error fields filled
    pub rows: Vec<ForecastRecord>,
    pub unmatched: usize,
}

/// Per-component MAE over matched rows
pub fn component_metrics(rows: &[ForecastRecord]) -> ComponentMetrics {
    let matched: Vec<(&ForecastRecord, f64)> = rows
        .iter()
        .filter_map(|r| r.actual_price.map(|a| (r, a)))
        .collect();
    let actual: Vec<f64> = matched.iter().map(|(_, a)| *a).collect();

    let trend: Vec<f64> = matched.iter().map(|(r, _)| r.trend_component).collect();
    let two_model: Vec<f64> = matched
        .iter()
        .map(|(r, _)| r.trend_component + r.residual_component)
        .collect();
    let (seq_actual, seq_pred): (Vec<f64>, Vec<f64>) = matched
        .iter()
        .filter_map(|(r, a)| r.sequence_component.map(|s| (*a, s)))
        .unzip();

    ComponentMetrics {
        trend: ComponentMetric::from_mae(mean_absolute_error(&actual, &trend)),
        residual: ComponentMetric::from_mae(mean_absolute_error(&actual, &two_model)),
        sequence: ComponentMetric::from_mae(mean_absolute_error(&seq_actual, &seq_pred)),
    }
}

/// Week reconciler with the low-price threshold policy
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    low_price_threshold: f64,
}

impl Reconciler {
    pub fn new(low_price_threshold: f64) -> Self {
        Self { low_price_threshold }
    }

    /// Join the week's forecasts with actuals, persist errors and upsert the
    /// weekly performance record.
    ///
    /// Missing forecasts or actuals surface as [`ForecastError::DataUnavailable`]
    /// inside the returned error.
    pub fn reconcile(
        &self,
        store: &mut dyn ForecastStore,
        market: &dyn MarketDataSource,
        week: &WeekWindow,
    ) -> Result<ReconciliationResult> {
        let start = week.start_instant();
        let end = week.end_exclusive();

        let forecasts = store
            .load_week(week.week_start)
            .with_context(|| format!("Failed loading forecasts for week {}", week))?;
        if forecasts.is_empty() {
            return Err(ForecastError::DataUnavailable {
                what: "forecasts".to_string(),
                start,
                end,
            }
            .into());
        }

        let actuals: HashMap<NaiveDateTime, f64> = market
            .prices(start, end)
            .with_context(|| format!("Failed loading actuals for week {}", week))?
            .into_iter()
            .map(|p| (p.timestamp, p.price))
            .collect();
        if actuals.is_empty() {
            return Err(ForecastError::DataUnavailable {
                what: "actual prices".to_string(),
                start,
                end,
            }
            .into());
        }

        let total = forecasts.len();
        let rows: Vec<ForecastRecord> = forecasts
            .into_iter()
            .filter_map(|mut r| {
                let actual = *actuals.get(&r.forecast_datetime)?;
                r.actual_price = Some(actual);
                r.absolute_error = Some((actual - r.predicted_price).abs());
                r.percentage_error = percentage_error(actual, r.predicted_price, self.low_price_threshold);
                Some(r)
            })
            .collect();
        let unmatched = total - rows.len();
        if rows.is_empty() {
            return Err(ForecastError::DataUnavailable {
                what: "matched actual prices".to_string(),
                start,
                end,
            }
            .into());
        }
        if unmatched > 0 {
            warn!("⚠️ Week {}: {} forecasts have no actual yet", week, unmatched);
        }

        let actual: Vec<f64> = rows.iter().filter_map(|r| r.actual_price).collect();
        let predicted: Vec<f64> = rows.iter().map(|r| r.predicted_price).collect();
        let metrics = evaluate(&actual, &predicted, self.low_price_threshold)?;

        store
            .apply_actuals(week.week_start, &rows)
            .context("Failed persisting reconciled rows")?;
        let performance = WeeklyPerformanceRecord {
            week_start: week.week_start,
            week_end: week.week_end,
            mape: metrics.mape,
            mae: metrics.mae,
            rmse: metrics.rmse,
            total_predictions: rows.len(),
        };
        store
            .upsert_performance(performance.clone())
            .context("Failed persisting weekly performance")?;

        let components = component_metrics(&rows);
        info!(
            "📊 Week {} reconciled: {} rows, MAE={:.2} RMSE={:.2} MAPE={:.2}% ({} rows above threshold)",
            week, rows.len(), metrics.mae, metrics.rmse, metrics.mape, metrics.mape_rows
        );

        Ok(ReconciliationResult {
            week: *week,
            performance,
            metrics,
            components,
            rows,
            unmatched,
        })
    }
}

/// True when the error chain carries a domain error the cycle can skip past
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ForecastError>())
        .any(ForecastError::is_recoverable)
}

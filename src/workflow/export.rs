//! JSON export of the current forecast and recent accuracy
//!
//! Datetimes are `%Y-%m-%d %H:%M:%S`, dates `%Y-%m-%d`.

use crate::config::ExportConfig;
use crate::ml_engine::ensemble::EnsembleWeights;
use crate::persistence::ForecastStore;
use crate::types::{ForecastRecord, WeekWindow, WeeklyPerformanceRecord};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSettings {
    pub enabled: bool,
    pub output_path: PathBuf,
    /// Weeks listed in `historical_trend`
    pub history_weeks: usize,
}

impl From<&ExportConfig> for ExportSettings {
    fn from(config: &ExportConfig) -> Self {
        Self {
            enabled: config.enabled,
            output_path: PathBuf::from(&config.output_path),
            history_weeks: config.history_weeks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub generated_at: String,
    pub model_type: String,
    pub current_week: CurrentWeek,
    pub last_week_comparison: Vec<ComparisonRow>,
    pub last_week_performance: Option<PerformanceEntry>,
    pub historical_trend: Vec<TrendEntry>,
    pub weights: WeightsEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeek {
    pub start: String,
    pub end: String,
    pub forecasts: Vec<ForecastEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastEntry {
    pub datetime: String,
    pub predicted: f64,
    pub trend: f64,
    pub residual: f64,
    pub sequence: Option<f64>,
    pub lower: f64,
    pub upper: f64,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub datetime: String,
    pub predicted: f64,
    pub actual: f64,
    pub error: f64,
    pub error_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub week: String,
    pub mape: f64,
    pub mae: f64,
    pub rmse: f64,
    pub total_predictions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendEntry {
    pub week: String,
    pub mape: f64,
    pub mae: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsEntry {
    pub trend: f64,
    pub residual: f64,
    pub sequence: f64,
    pub version: u64,
}

fn forecast_entry(r: &ForecastRecord) -> ForecastEntry {
    ForecastEntry {
        datetime: r.forecast_datetime.format(DATETIME_FORMAT).to_string(),
        predicted: r.predicted_price,
        trend: r.trend_component,
        residual: r.residual_component,
        sequence: r.sequence_component,
        lower: r.lower_bound,
        upper: r.upper_bound,
        mode: r.mode.to_string(),
    }
}

fn comparison_row(r: &ForecastRecord) -> Option<ComparisonRow> {
    let actual = r.actual_price?;
    Some(ComparisonRow {
        datetime: r.forecast_datetime.format(DATETIME_FORMAT).to_string(),
        predicted: r.predicted_price,
        actual,
        error: r.absolute_error.unwrap_or((actual - r.predicted_price).abs()),
        error_percent: r.percentage_error,
    })
}

fn performance_entry(p: &WeeklyPerformanceRecord) -> PerformanceEntry {
    PerformanceEntry {
        week: p.week_start.format(DATE_FORMAT).to_string(),
        mape: p.mape,
        mae: p.mae,
        rmse: p.rmse,
        total_predictions: p.total_predictions,
    }
}

/// Assemble the export for `week` from the store
pub fn build_export(
    store: &dyn ForecastStore,
    week: &WeekWindow,
    weights: &EnsembleWeights,
    model_type: &str,
    history_weeks: usize,
    generated_at: NaiveDateTime,
) -> Result<ExportDocument> {
    let previous = week.previous();
    let current = store.load_week(week.week_start)?;
    let last = store.load_week(previous.week_start)?;

    Ok(ExportDocument {
        generated_at: generated_at.format(DATETIME_FORMAT).to_string(),
        model_type: model_type.to_string(),
        current_week: CurrentWeek {
            start: week.week_start.format(DATE_FORMAT).to_string(),
            end: week.week_end.format(DATE_FORMAT).to_string(),
            forecasts: current.iter().map(forecast_entry).collect(),
        },
        last_week_comparison: last.iter().filter_map(comparison_row).collect(),
        last_week_performance: store
            .performance(previous.week_start)?
            .as_ref()
            .map(performance_entry),
        historical_trend: store
            .performance_history(history_weeks)?
            .iter()
            .map(|p| TrendEntry {
                week: p.week_start.format(DATE_FORMAT).to_string(),
                mape: p.mape,
                mae: p.mae,
                rmse: p.rmse,
            })
            .collect(),
        weights: WeightsEntry {
            trend: weights.trend,
            residual: weights.residual,
            sequence: weights.sequence,
            version: weights.version,
        },
    })
}

/// Write the document through a temp file and a rename
pub fn write_export(path: &Path, document: &ExportDocument) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Failed creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(document)?;
    fs::write(&tmp, json).with_context(|| format!("Failed writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed renaming {}", tmp.display()))?;
    info!(
        "💾 Export written to {} ({} forecasts, {} comparison rows)",
        path.display(),
        document.current_week.forecasts.len(),
        document.last_week_comparison.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::ensemble::EnsembleConfig;
    use crate::persistence::InMemoryForecastStore;
    use crate::types::CombinationMode;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn record(week: &WeekWindow, ts: NaiveDateTime, actual: Option<f64>) -> ForecastRecord {
        ForecastRecord {
            week_start: week.week_start,
            week_end: week.week_end,
            forecast_datetime: ts,
            predicted_price: 2000.0,
            trend_component: 1950.0,
            residual_component: 50.0,
            sequence_component: Some(2010.0),
            lower_bound: 1800.0,
            upper_bound: 2200.0,
            mode: CombinationMode::AdaptiveWeighted,
            actual_price: actual,
            absolute_error: actual.map(|a| (a - 2000.0).abs()),
            percentage_error: actual.map(|a| (a - 2000.0).abs() / a * 100.0),
        }
    }

    #[test]
    fn test_export_shape() {
        let week = WeekWindow::containing(NaiveDate::from_ymd_opt(2026, 1, 14).unwrap());
        let prev = week.previous();
        let mut store = InMemoryForecastStore::new();
        let current: Vec<_> = week.hours().into_iter().map(|ts| record(&week, ts, None)).collect();
        let last: Vec<_> = prev
            .hours()
            .into_iter()
            .enumerate()
            .map(|(i, ts)| record(&prev, ts, if i < 100 { Some(2100.0) } else { None }))
            .collect();
        store.replace_week(&week, current).unwrap();
        store.replace_week(&prev, last).unwrap();
        store
            .upsert_performance(WeeklyPerformanceRecord {
                week_start: prev.week_start,
                week_end: prev.week_end,
                mape: 4.76,
                mae: 100.0,
                rmse: 100.0,
                total_predictions: 100,
            })
            .unwrap();

        let weights = EnsembleWeights::from_config(&EnsembleConfig::default());
        let generated = week.start_instant();
        let doc = build_export(&store, &week, &weights, "ensemble", 8, generated).unwrap();

        assert_eq!(doc.current_week.start, "2026-01-12");
        assert_eq!(doc.current_week.end, "2026-01-18");
        assert_eq!(doc.current_week.forecasts.len(), 168);
        assert_eq!(doc.current_week.forecasts[0].datetime, "2026-01-12 00:00:00");
        assert_eq!(doc.last_week_comparison.len(), 100);
        assert_eq!(doc.last_week_performance.as_ref().unwrap().week, "2026-01-05");
        assert_eq!(doc.historical_trend.len(), 1);
        assert_eq!(doc.generated_at, "2026-01-12 00:00:00");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("public").join("forecasts.json");
        write_export(&path, &doc).unwrap();
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value["weights"]["version"].is_u64());
        assert!(value["current_week"]["forecasts"][0]["sequence"].is_number());
    }

    #[test]
    fn test_export_without_history() {
        let week = WeekWindow::containing(NaiveDate::from_ymd_opt(2026, 1, 14).unwrap());
        let store = InMemoryForecastStore::new();
        let weights = EnsembleWeights::from_config(&EnsembleConfig::default());
        let doc = build_export(&store, &week, &weights, "ensemble", 8, week.start_instant()).unwrap();
        assert!(doc.last_week_performance.is_none());
        assert!(doc.historical_trend.is_empty());
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["last_week_performance"].is_null());
    }
}

//! Forecast history and weekly performance storage
//!
//! Rows are keyed by `(week_start, forecast_datetime)` and performance by
//! `week_start`, so neither can hold duplicates. The CSV store rewrites a
//! whole file per commit through a temp file and a rename.

use crate::types::{CombinationMode, ForecastRecord, WeekWindow, WeeklyPerformanceRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const FORECAST_HISTORY_FILE: &str = "forecast_history.csv";
pub const WEEKLY_PERFORMANCE_FILE: &str = "weekly_performance.csv";

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Storage for forecasts and their reconciliation results
pub trait ForecastStore {
    /// Delete every row of the week, then insert `records`, as one commit
    fn replace_week(&mut self, week: &WeekWindow, records: Vec<ForecastRecord>) -> Result<usize>;

    fn load_week(&self, week_start: NaiveDate) -> Result<Vec<ForecastRecord>>;

    /// Write actual and error fields of already stored rows
    fn apply_actuals(&mut self, week_start: NaiveDate, reconciled: &[ForecastRecord]) -> Result<usize>;

    fn upsert_performance(&mut self, record: WeeklyPerformanceRecord) -> Result<()>;

    fn performance(&self, week_start: NaiveDate) -> Result<Option<WeeklyPerformanceRecord>>;

    /// Newest week first
    fn performance_history(&self, limit: usize) -> Result<Vec<WeeklyPerformanceRecord>>;

    /// Weeks with at least one stored forecast, ascending
    fn forecast_weeks(&self) -> Result<Vec<NaiveDate>>;
}

type RowKey = (NaiveDate, NaiveDateTime);

#[derive(Debug, Clone, Default)]
struct StoreState {
    forecasts: BTreeMap<RowKey, ForecastRecord>,
    performance: BTreeMap<NaiveDate, WeeklyPerformanceRecord>,
}

impl StoreState {
    fn replace_week(&mut self, week: &WeekWindow, records: Vec<ForecastRecord>) -> Result<usize> {
        if let Some(stray) = records.iter().find(|r| r.week_start != week.week_start) {
            return Err(anyhow!(
                "record for week {} passed to replace_week({})",
                stray.week_start,
                week.week_start
            ));
        }
        let before = self.forecasts.len();
        self.forecasts.retain(|(w, _), _| *w != week.week_start);
        let removed = before - self.forecasts.len();
        let mut inserted = 0;
        for record in records {
            self.forecasts
                .insert((record.week_start, record.forecast_datetime), record);
            inserted += 1;
        }
        debug!(
            "Week {}: replaced {} stored rows with {}",
            week.week_start, removed, inserted
        );
        Ok(inserted)
    }

    fn load_week(&self, week_start: NaiveDate) -> Vec<ForecastRecord> {
        self.forecasts
            .iter()
            .filter(|((w, _), _)| *w == week_start)
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn apply_actuals(&mut self, week_start: NaiveDate, reconciled: &[ForecastRecord]) -> usize {
        let mut updated = 0;
        for rec in reconciled.iter().filter(|r| r.week_start == week_start) {
            if let Some(stored) = self.forecasts.get_mut(&(week_start, rec.forecast_datetime)) {
                stored.actual_price = rec.actual_price;
                stored.absolute_error = rec.absolute_error;
                stored.percentage_error = rec.percentage_error;
                updated += 1;
            }
        }
        updated
    }

    fn upsert_performance(&mut self, record: WeeklyPerformanceRecord) {
        self.performance.insert(record.week_start, record);
    }

    fn performance_history(&self, limit: usize) -> Vec<WeeklyPerformanceRecord> {
        self.performance.values().rev().take(limit).cloned().collect()
    }

    fn forecast_weeks(&self) -> Vec<NaiveDate> {
        let mut weeks: Vec<NaiveDate> = self.forecasts.keys().map(|(w, _)| *w).collect();
        weeks.dedup();
        weeks
    }
}

/// Store kept in memory, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryForecastStore {
    state: StoreState,
}

impl InMemoryForecastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ForecastStore for InMemoryForecastStore {
    fn replace_week(&mut self, week: &WeekWindow, records: Vec<ForecastRecord>) -> Result<usize> {
        self.state.replace_week(week, records)
    }

    fn load_week(&self, week_start: NaiveDate) -> Result<Vec<ForecastRecord>> {
        Ok(self.state.load_week(week_start))
    }

    fn apply_actuals(&mut self, week_start: NaiveDate, reconciled: &[ForecastRecord]) -> Result<usize> {
        Ok(self.state.apply_actuals(week_start, reconciled))
    }

    fn upsert_performance(&mut self, record: WeeklyPerformanceRecord) -> Result<()> {
        self.state.upsert_performance(record);
        Ok(())
    }

    fn performance(&self, week_start: NaiveDate) -> Result<Option<WeeklyPerformanceRecord>> {
        Ok(self.state.performance.get(&week_start).cloned())
    }

    fn performance_history(&self, limit: usize) -> Result<Vec<WeeklyPerformanceRecord>> {
        Ok(self.state.performance_history(limit))
    }

    fn forecast_weeks(&self) -> Result<Vec<NaiveDate>> {
        Ok(self.state.forecast_weeks())
    }
}

/// forecast_history.csv row
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForecastCsvRow {
    week_start: String,
    week_end: String,
    forecast_datetime: String,
    predicted_price: f64,
    trend_component: f64,
    residual_component: f64,
    sequence_component: Option<f64>,
    lower_bound: f64,
    upper_bound: f64,
    mode: String,
    actual_price: Option<f64>,
    absolute_error: Option<f64>,
    percentage_error: Option<f64>,
}

impl From<&ForecastRecord> for ForecastCsvRow {
    fn from(r: &ForecastRecord) -> Self {
        Self {
            week_start: r.week_start.format(DATE_FORMAT).to_string(),
            week_end: r.week_end.format(DATE_FORMAT).to_string(),
            forecast_datetime: r.forecast_datetime.format(DATETIME_FORMAT).to_string(),
            predicted_price: r.predicted_price,
            trend_component: r.trend_component,
            residual_component: r.residual_component,
            sequence_component: r.sequence_component,
            lower_bound: r.lower_bound,
            upper_bound: r.upper_bound,
            mode: r.mode.to_string(),
            actual_price: r.actual_price,
            absolute_error: r.absolute_error,
            percentage_error: r.percentage_error,
        }
    }
}

impl TryFrom<ForecastCsvRow> for ForecastRecord {
    type Error = anyhow::Error;

    fn try_from(row: ForecastCsvRow) -> Result<Self> {
        Ok(Self {
            week_start: parse_date(&row.week_start)?,
            week_end: parse_date(&row.week_end)?,
            forecast_datetime: NaiveDateTime::parse_from_str(&row.forecast_datetime, DATETIME_FORMAT)
                .with_context(|| format!("bad forecast_datetime '{}'", row.forecast_datetime))?,
            predicted_price: row.predicted_price,
            trend_component: row.trend_component,
            residual_component: row.residual_component,
            sequence_component: row.sequence_component,
            lower_bound: row.lower_bound,
            upper_bound: row.upper_bound,
            mode: row
                .mode
                .parse::<CombinationMode>()
                .map_err(|e| anyhow!(e))?,
            actual_price: row.actual_price,
            absolute_error: row.absolute_error,
            percentage_error: row.percentage_error,
        })
    }
}

/// weekly_performance.csv row
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PerformanceCsvRow {
    week_start: String,
    week_end: String,
    mape: f64,
    mae: f64,
    rmse: f64,
    total_predictions: usize,
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).with_context(|| format!("bad date '{}'", raw))
}

/// CSV-backed store under the data directory
#[derive(Debug)]
pub struct CsvForecastStore {
    forecast_path: PathBuf,
    performance_path: PathBuf,
    state: StoreState,
}

impl CsvForecastStore {
    /// Open the store, loading any existing files
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Failed creating {}", dir.display()))?;
        let mut store = Self {
            forecast_path: dir.join(FORECAST_HISTORY_FILE),
            performance_path: dir.join(WEEKLY_PERFORMANCE_FILE),
            state: StoreState::default(),
        };
        store.load()?;
        info!(
            "📂 Forecast store opened: {} rows, {} reconciled weeks",
            store.state.forecasts.len(),
            store.state.performance.len()
        );
        Ok(store)
    }

    fn load(&mut self) -> Result<()> {
        if self.forecast_path.exists() {
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .from_path(&self.forecast_path)
                .with_context(|| format!("Failed opening {}", self.forecast_path.display()))?;
            for row in reader.deserialize::<ForecastCsvRow>() {
                let record = ForecastRecord::try_from(row?)?;
                self.state
                    .forecasts
                    .insert((record.week_start, record.forecast_datetime), record);
            }
        }
        if self.performance_path.exists() {
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .from_path(&self.performance_path)
                .with_context(|| format!("Failed opening {}", self.performance_path.display()))?;
            for row in reader.deserialize::<PerformanceCsvRow>() {
                let row = row?;
                let record = WeeklyPerformanceRecord {
                    week_start: parse_date(&row.week_start)?,
                    week_end: parse_date(&row.week_end)?,
                    mape: row.mape,
                    mae: row.mae,
                    rmse: row.rmse,
                    total_predictions: row.total_predictions,
                };
                self.state.performance.insert(record.week_start, record);
            }
        }
        Ok(())
    }

    fn write_atomic<T: Serialize>(path: &Path, rows: impl Iterator<Item = T>) -> Result<()> {
        let tmp = path.with_extension("csv.tmp");
        {
            let mut writer = WriterBuilder::new()
                .has_headers(true)
                .from_path(&tmp)
                .with_context(|| format!("Failed creating {}", tmp.display()))?;
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    fn commit_forecasts(&self) -> Result<()> {
        Self::write_atomic(
            &self.forecast_path,
            self.state.forecasts.values().map(ForecastCsvRow::from),
        )
    }

    fn commit_performance(&self) -> Result<()> {
        Self::write_atomic(
            &self.performance_path,
            self.state.performance.values().map(|r| PerformanceCsvRow {
                week_start: r.week_start.format(DATE_FORMAT).to_string(),
                week_end: r.week_end.format(DATE_FORMAT).to_string(),
                mape: r.mape,
                mae: r.mae,
                rmse: r.rmse,
                total_predictions: r.total_predictions,
            }),
        )
    }
}

impl ForecastStore for CsvForecastStore {
    fn replace_week(&mut self, week: &WeekWindow, records: Vec<ForecastRecord>) -> Result<usize> {
        let mut next = self.state.clone();
        let inserted = next.replace_week(week, records)?;
        let previous = std::mem::replace(&mut self.state, next);
        if let Err(e) = self.commit_forecasts() {
            self.state = previous;
            return Err(e);
        }
        info!("💾 Stored {} forecasts for week {}", inserted, week);
        Ok(inserted)
    }

    fn load_week(&self, week_start: NaiveDate) -> Result<Vec<ForecastRecord>> {
        Ok(self.state.load_week(week_start))
    }

    fn apply_actuals(&mut self, week_start: NaiveDate, reconciled: &[ForecastRecord]) -> Result<usize> {
        let mut next = self.state.clone();
        let updated = next.apply_actuals(week_start, reconciled);
        let previous = std::mem::replace(&mut self.state, next);
        if let Err(e) = self.commit_forecasts() {
            self.state = previous;
            return Err(e);
        }
        Ok(updated)
    }

    fn upsert_performance(&mut self, record: WeeklyPerformanceRecord) -> Result<()> {
        let mut next = self.state.clone();
        next.upsert_performance(record);
        let previous = std::mem::replace(&mut self.state, next);
        if let Err(e) = self.commit_performance() {
            self.state = previous;
            return Err(e);
        }
        Ok(())
    }

    fn performance(&self, week_start: NaiveDate) -> Result<Option<WeeklyPerformanceRecord>> {
        Ok(self.state.performance.get(&week_start).cloned())
    }

    fn performance_history(&self, limit: usize) -> Result<Vec<WeeklyPerformanceRecord>> {
        Ok(self.state.performance_history(limit))
    }

    fn forecast_weeks(&self) -> Result<Vec<NaiveDate>> {
        Ok(self.state.forecast_weeks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn week() -> WeekWindow {
        WeekWindow::containing(NaiveDate::from_ymd_opt(2026, 1, 7).unwrap())
    }

    fn records(week: &WeekWindow, price: f64) -> Vec<ForecastRecord> {
        week.hours()
            .into_iter()
            .map(|ts| ForecastRecord {
                week_start: week.week_start,
                week_end: week.week_end,
                forecast_datetime: ts,
                predicted_price: price,
                trend_component: price - 10.0,
                residual_component: 10.0,
                sequence_component: None,
                lower_bound: price - 200.0,
                upper_bound: price + 200.0,
                mode: CombinationMode::TwoModelFallback,
                actual_price: None,
                absolute_error: None,
                percentage_error: None,
            })
            .collect()
    }

    fn perf(week: &WeekWindow, mae: f64) -> WeeklyPerformanceRecord {
        WeeklyPerformanceRecord {
            week_start: week.week_start,
            week_end: week.week_end,
            mape: 5.0,
            mae,
            rmse: mae * 1.2,
            total_predictions: 168,
        }
    }

    #[test]
    fn test_replace_week_never_duplicates() {
        let mut store = InMemoryForecastStore::new();
        let w = week();
        store.replace_week(&w, records(&w, 2000.0)).unwrap();
        store.replace_week(&w, records(&w, 2100.0)).unwrap();
        let rows = store.load_week(w.week_start).unwrap();
        assert_eq!(rows.len(), 168);
        assert!(rows.iter().all(|r| r.predicted_price == 2100.0));
        assert_eq!(store.forecast_weeks().unwrap(), vec![w.week_start]);
    }

    #[test]
    fn test_replace_week_rejects_foreign_rows() {
        let mut store = InMemoryForecastStore::new();
        let w = week();
        let other = w.next();
        assert!(store.replace_week(&w, records(&other, 1.0)).is_err());
    }

    #[test]
    fn test_upsert_performance_and_history_order() {
        let mut store = InMemoryForecastStore::new();
        let w1 = week();
        let w2 = w1.next();
        store.upsert_performance(perf(&w1, 50.0)).unwrap();
        store.upsert_performance(perf(&w2, 40.0)).unwrap();
        store.upsert_performance(perf(&w1, 45.0)).unwrap();
        let history = store.performance_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].week_start, w2.week_start);
        assert_eq!(history[1].mae, 45.0);
        assert_eq!(store.performance_history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_csv_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let w = week();
        {
            let mut store = CsvForecastStore::open(dir.path()).unwrap();
            store.replace_week(&w, records(&w, 2000.0)).unwrap();
            let mut rows = store.load_week(w.week_start).unwrap();
            rows[0].actual_price = Some(2050.0);
            rows[0].absolute_error = Some(50.0);
            rows[0].percentage_error = Some(50.0 / 2050.0 * 100.0);
            assert_eq!(store.apply_actuals(w.week_start, &rows[..1]).unwrap(), 1);
            store.upsert_performance(perf(&w, 50.0)).unwrap();
        }
        let store = CsvForecastStore::open(dir.path()).unwrap();
        let rows = store.load_week(w.week_start).unwrap();
        assert_eq!(rows.len(), 168);
        assert_eq!(rows[0].actual_price, Some(2050.0));
        assert!(rows[1].actual_price.is_none());
        assert_eq!(rows[0].sequence_component, None);
        assert_eq!(rows[0].mode, CombinationMode::TwoModelFallback);
        assert_eq!(store.performance(w.week_start).unwrap().unwrap().mae, 50.0);
        assert!(!dir.path().join("forecast_history.csv.tmp").exists());
    }
}

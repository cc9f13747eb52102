//! Core types used throughout the forecaster
//!
//! Market inputs, week windows, the training cutoff and the persisted
//! forecast/performance records.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Hourly clearing price (external, immutable once ingested)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: NaiveDateTime,
    pub price: f64,
}

/// Hourly consumption and generation mix (external, immutable once ingested)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SupplyDemandPoint {
    pub timestamp: NaiveDateTime,
    pub consumption: Option<f64>,
    pub generation_total: Option<f64>,
    /// Generation per source (solar, wind, hydro, natural_gas, lignite, ...)
    pub generation: BTreeMap<String, f64>,
}

impl SupplyDemandPoint {
    pub fn source(&self, name: &str) -> f64 {
        self.generation.get(name).copied().unwrap_or(0.0)
    }
}

/// Model components that feed the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Trend,
    Residual,
    Sequence,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 3] = [
        ComponentKind::Trend,
        ComponentKind::Residual,
        ComponentKind::Sequence,
    ];
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Trend => write!(f, "trend"),
            ComponentKind::Residual => write!(f, "residual"),
            ComponentKind::Sequence => write!(f, "sequence"),
        }
    }
}

/// How a forecast row was blended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationMode {
    /// trend + residual + factor * sequence correction
    ResidualStacking,
    /// Inverse-MAE weighted blend of all active components
    AdaptiveWeighted,
    /// trend + residual
    TwoModelFallback,
}

impl Default for CombinationMode {
    fn default() -> Self {
        CombinationMode::AdaptiveWeighted
    }
}

impl fmt::Display for CombinationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombinationMode::ResidualStacking => write!(f, "residual_stacking"),
            CombinationMode::AdaptiveWeighted => write!(f, "adaptive_weighted"),
            CombinationMode::TwoModelFallback => write!(f, "two_model_fallback"),
        }
    }
}

impl std::str::FromStr for CombinationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "residual_stacking" => Ok(CombinationMode::ResidualStacking),
            "adaptive_weighted" => Ok(CombinationMode::AdaptiveWeighted),
            "two_model_fallback" => Ok(CombinationMode::TwoModelFallback),
            other => Err(format!("unknown combination mode: {}", other)),
        }
    }
}

/// Exclusive upper bound on training data.
///
/// Only constructible from an explicit instant, so every retrain call names
/// the point after which no row may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cutoff(NaiveDateTime);

impl Cutoff {
    pub fn at(instant: NaiveDateTime) -> Self {
        Cutoff(instant)
    }

    /// Midnight at the start of `date`
    pub fn from_date(date: NaiveDate) -> Self {
        Cutoff(date.and_time(NaiveTime::MIN))
    }

    pub fn instant(&self) -> NaiveDateTime {
        self.0
    }

    /// True when `ts` may be used for training
    pub fn admits(&self, ts: NaiveDateTime) -> bool {
        ts < self.0
    }
}

impl fmt::Display for Cutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monday-to-Sunday forecast week
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeekWindow {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
}

impl WeekWindow {
    pub const HOURS: usize = 168;

    /// The week containing `date`
    pub fn containing(date: NaiveDate) -> Self {
        let offset = date.weekday().num_days_from_monday() as i64;
        let week_start = date - Duration::days(offset);
        Self {
            week_start,
            week_end: week_start + Duration::days(6),
        }
    }

    pub fn previous(&self) -> Self {
        Self::containing(self.week_start - Duration::days(7))
    }

    pub fn next(&self) -> Self {
        Self::containing(self.week_start + Duration::days(7))
    }

    /// Training cutoff: first instant of the week
    pub fn cutoff(&self) -> Cutoff {
        Cutoff::from_date(self.week_start)
    }

    pub fn start_instant(&self) -> NaiveDateTime {
        self.week_start.and_time(NaiveTime::MIN)
    }

    /// Exclusive upper bound, midnight after week_end
    pub fn end_exclusive(&self) -> NaiveDateTime {
        (self.week_end + Duration::days(1)).and_time(NaiveTime::MIN)
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start_instant() && ts < self.end_exclusive()
    }

    /// The 168 hourly timestamps of the week
    pub fn hours(&self) -> Vec<NaiveDateTime> {
        let start = self.start_instant();
        (0..Self::HOURS as i64)
            .map(|h| start + Duration::hours(h))
            .collect()
    }
}

impl fmt::Display for WeekWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.week_start, self.week_end)
    }
}

/// One hourly forecast row of a week
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub forecast_datetime: NaiveDateTime,
    pub predicted_price: f64,
    pub trend_component: f64,
    pub residual_component: f64,
    pub sequence_component: Option<f64>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub mode: CombinationMode,
    pub actual_price: Option<f64>,
    pub absolute_error: Option<f64>,
    pub percentage_error: Option<f64>,
}

impl ForecastRecord {
    pub fn is_reconciled(&self) -> bool {
        self.actual_price.is_some()
    }
}

/// Per-week error summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyPerformanceRecord {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub mape: f64,
    pub mae: f64,
    pub rmse: f64,
    pub total_predictions: usize,
}

/// Parse a market timestamp into local wall-clock time.
///
/// Accepts RFC 3339 with offset (offset dropped), `YYYY-MM-DD HH:MM:SS`,
/// `YYYY-MM-DDTHH:MM:SS` and plain dates (midnight).
pub fn parse_market_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

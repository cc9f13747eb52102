//! Feature Engineering - Features horarias para los tres modelos
//!
//! A partir de la serie cruda calcula:
//! - Calendario: hora, día de semana, fin de semana, hora pico, ventana solar, feriados
//! - Oferta/demanda: consumo, brecha oferta-demanda, ratios renovable/fósil/hidro
//! - Lags de precio (1h, 24h, 168h) y estadísticas móviles de 24h
//!
//! El contrato de features se negocia una sola vez al construir el pipeline
//! contra las capacidades de la fuente de datos.

use crate::error::{ForecastError, Result};
use crate::ml_engine::dataset::{reindex_hourly, RawHourlyRow, SourceCapabilities};
use crate::ml_engine::holidays::HolidayCalendar;
use crate::types::Cutoff;
use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Lag más largo; define cuántas filas iniciales se descartan
pub const MAX_LAG_HOURS: usize = 168;
const ROLLING_WINDOW: usize = 24;

/// Regresores exógenos del modelo de tendencia
pub const TREND_REGRESSORS: [&str; 5] = [
    "consumption",
    "supply_demand_gap",
    "renewable_ratio",
    "fossil_ratio",
    "price_lag_24h",
];

/// Conjunto amplio de features del modelo de residuos
pub const RESIDUAL_FEATURES: [&str; 21] = [
    "hour",
    "day_of_week",
    "day_of_month",
    "month",
    "is_weekend",
    "is_peak_hour",
    "is_daytime",
    "is_holiday",
    "extreme_low_risk",
    "consumption",
    "generation_total",
    "supply_demand_gap",
    "renewable_ratio",
    "fossil_ratio",
    "hydro_ratio",
    "price_lag_1h",
    "price_lag_24h",
    "price_lag_168h",
    "price_rolling_24h",
    "price_std_24h",
    "consumption_lag_24h",
];

/// Parámetros de mercado que usa el pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSettings {
    pub peak_hours: Vec<u32>,
    pub daytime_hours: Vec<u32>,
    pub extreme_low_hours: Vec<u32>,
    /// Días de historia promediados por hora para el futuro
    pub future_profile_days: i64,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            peak_hours: vec![8, 9, 10, 18, 19, 20, 21],
            daytime_hours: vec![10, 11, 12, 13, 14, 15],
            extreme_low_hours: vec![10, 11, 12, 13, 14],
            future_profile_days: 28,
        }
    }
}

/// Fila horaria de features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: NaiveDateTime,
    /// Precio observado; `None` en filas futuras
    pub price: Option<f64>,
    pub hour: f64,
    pub day_of_week: f64,
    pub day_of_month: f64,
    pub month: f64,
    pub is_weekend: f64,
    pub is_peak_hour: f64,
    pub is_daytime: f64,
    pub is_holiday: f64,
    pub extreme_low_risk: f64,
    pub consumption: f64,
    pub generation_total: f64,
    pub supply_demand_gap: f64,
    pub renewable_ratio: f64,
    pub fossil_ratio: f64,
    pub hydro_ratio: f64,
    pub price_lag_1h: f64,
    pub price_lag_24h: f64,
    pub price_lag_168h: f64,
    pub price_rolling_24h: f64,
    pub price_std_24h: f64,
    pub consumption_lag_24h: f64,
}

impl FeatureRow {
    /// Valor de una feature por nombre
    pub fn value(&self, name: &str) -> Option<f64> {
        let v = match name {
            "hour" => self.hour,
            "day_of_week" => self.day_of_week,
            "day_of_month" => self.day_of_month,
            "month" => self.month,
            "is_weekend" => self.is_weekend,
            "is_peak_hour" => self.is_peak_hour,
            "is_daytime" => self.is_daytime,
            "is_holiday" => self.is_holiday,
            "extreme_low_risk" => self.extreme_low_risk,
            "consumption" => self.consumption,
            "generation_total" => self.generation_total,
            "supply_demand_gap" => self.supply_demand_gap,
            "renewable_ratio" => self.renewable_ratio,
            "fossil_ratio" => self.fossil_ratio,
            "hydro_ratio" => self.hydro_ratio,
            "price_lag_1h" => self.price_lag_1h,
            "price_lag_24h" => self.price_lag_24h,
            "price_lag_168h" => self.price_lag_168h,
            "price_rolling_24h" => self.price_rolling_24h,
            "price_std_24h" => self.price_std_24h,
            "consumption_lag_24h" => self.consumption_lag_24h,
            _ => return None,
        };
        Some(v)
    }

    /// Vector en el orden dado; nombres desconocidos usan el fallback
    pub fn vector(&self, names: &[String], fallback: &[f64]) -> Vec<f64> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                self.value(n)
                    .unwrap_or_else(|| fallback.get(i).copied().unwrap_or(0.0))
            })
            .collect()
    }
}

/// Ratio con sustitución por cero cuando el denominador no es positivo
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Desviación estándar muestral; 0 con menos de dos puntos
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Features disponibles según la fuente, negociadas una vez
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureContract {
    pub available: BTreeSet<String>,
}

/// Resultado de ligar un modelo al contrato
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundFeatures {
    /// Todas las features requeridas están presentes
    Full,
    /// Solo la intersección aporta señal; las faltantes se imputan
    Degraded { missing: Vec<String> },
}

impl FeatureContract {
    pub fn negotiate(capabilities: &SourceCapabilities) -> Self {
        let caps = capabilities;
        let available = RESIDUAL_FEATURES
            .iter()
            .filter(|name| match **name {
                "consumption" | "consumption_lag_24h" => caps.consumption,
                "generation_total" => caps.generation_total,
                "supply_demand_gap" => caps.consumption && caps.generation_total,
                "renewable_ratio" => {
                    caps.generation_total && caps.has_source("solar") && caps.has_source("wind")
                }
                "fossil_ratio" => {
                    caps.generation_total
                        && caps.has_source("natural_gas")
                        && caps.has_source("lignite")
                }
                "hydro_ratio" => caps.generation_total && caps.has_source("hydro"),
                _ => true,
            })
            .map(|s| s.to_string())
            .collect();
        Self { available }
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.available.contains(name)
    }

    /// Features requeridas que el contrato no provee
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|n| !self.is_available(n))
            .cloned()
            .collect()
    }

    /// Ligar una lista de features requerida, decidiendo el modo una sola vez
    pub fn bind(&self, required: &[String]) -> BoundFeatures {
        let missing = self.missing(required);
        if missing.is_empty() {
            BoundFeatures::Full
        } else {
            BoundFeatures::Degraded { missing }
        }
    }

    /// Falla si falta alguna feature requerida
    pub fn require(&self, required: &[String]) -> Result<()> {
        let missing = self.missing(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ForecastError::FeatureMismatch { missing })
        }
    }
}

/// Pipeline de features
pub struct FeaturePipeline {
    settings: FeatureSettings,
    calendar: HolidayCalendar,
    contract: FeatureContract,
}

impl FeaturePipeline {
    pub fn new(
        settings: FeatureSettings,
        calendar: HolidayCalendar,
        capabilities: &SourceCapabilities,
    ) -> Self {
        let contract = FeatureContract::negotiate(capabilities);
        let unavailable: Vec<&str> = RESIDUAL_FEATURES
            .iter()
            .copied()
            .filter(|n| !contract.is_available(n))
            .collect();
        if !unavailable.is_empty() {
            warn!(
                "⚠️ Data source lacks inputs for {:?}; those features are zero-filled",
                unavailable
            );
        }
        Self {
            settings,
            calendar,
            contract,
        }
    }

    pub fn contract(&self) -> &FeatureContract {
        &self.contract
    }

    pub fn settings(&self) -> &FeatureSettings {
        &self.settings
    }

    pub fn calendar(&self) -> &HolidayCalendar {
        &self.calendar
    }

    /// Features de calendario de una marca de tiempo
    fn calendar_row(&self, timestamp: NaiveDateTime) -> FeatureRow {
        let hour = timestamp.hour();
        let weekday = timestamp.weekday().num_days_from_monday();
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        FeatureRow {
            timestamp,
            price: None,
            hour: hour as f64,
            day_of_week: weekday as f64,
            day_of_month: timestamp.day() as f64,
            month: timestamp.month() as f64,
            is_weekend: flag(weekday >= 5),
            is_peak_hour: flag(self.settings.peak_hours.contains(&hour)),
            is_daytime: flag(self.settings.daytime_hours.contains(&hour)),
            is_holiday: flag(self.calendar.is_holiday(timestamp.date())),
            extreme_low_risk: flag(weekday == 6 && self.settings.extreme_low_hours.contains(&hour)),
            consumption: 0.0,
            generation_total: 0.0,
            supply_demand_gap: 0.0,
            renewable_ratio: 0.0,
            fossil_ratio: 0.0,
            hydro_ratio: 0.0,
            price_lag_1h: 0.0,
            price_lag_24h: 0.0,
            price_lag_168h: 0.0,
            price_rolling_24h: 0.0,
            price_std_24h: 0.0,
            consumption_lag_24h: 0.0,
        }
    }

    /// Construir filas de features a partir de la serie cruda.
    ///
    /// Con `cutoff` solo se usan filas estrictamente anteriores. Las primeras
    /// 168 filas se descartan por falta del lag más largo.
    pub fn build(&self, raw: &[RawHourlyRow], cutoff: Option<Cutoff>) -> Result<Vec<FeatureRow>> {
        let observed: Vec<RawHourlyRow> = raw
            .iter()
            .filter(|r| cutoff.map_or(true, |c| c.admits(r.timestamp)))
            .cloned()
            .collect();
        if observed.is_empty() {
            return Err(ForecastError::EmptyInput("raw hourly rows".to_string()));
        }
        if observed.windows(2).any(|w| w[0].timestamp >= w[1].timestamp) {
            return Err(ForecastError::NumericalFailure(
                "raw rows must be strictly time-ordered".to_string(),
            ));
        }
        // los lags son posicionales: cada posición debe ser exactamente una hora
        let raw = reindex_hourly(&observed);
        if raw.len() > observed.len() {
            warn!(
                "⚠️ Filled {} missing hours by forward fill",
                raw.len() - observed.len()
            );
        }
        if raw.len() <= MAX_LAG_HOURS {
            return Err(ForecastError::InsufficientHistory {
                needed: MAX_LAG_HOURS + 1,
                got: raw.len(),
            });
        }

        let prices: Vec<f64> = raw.iter().map(|r| r.price).collect();
        let mut rows = Vec::with_capacity(raw.len().saturating_sub(MAX_LAG_HOURS));

        for i in MAX_LAG_HOURS..raw.len() {
            let r = &raw[i];
            let window = &prices[i.saturating_sub(ROLLING_WINDOW)..i];
            let renewable = r.solar + r.wind;
            let fossil = r.natural_gas + r.lignite;

            let mut row = self.calendar_row(r.timestamp);
            row.price = Some(r.price);
            row.consumption = r.consumption;
            row.generation_total = r.generation_total;
            row.supply_demand_gap = r.generation_total - r.consumption;
            row.renewable_ratio = safe_ratio(renewable, r.generation_total);
            row.fossil_ratio = safe_ratio(fossil, r.generation_total);
            row.hydro_ratio = safe_ratio(r.hydro, r.generation_total);
            row.price_lag_1h = prices[i - 1];
            row.price_lag_24h = prices[i - 24];
            row.price_lag_168h = prices[i - MAX_LAG_HOURS];
            row.price_rolling_24h = mean(window);
            row.price_std_24h = sample_std(window);
            row.consumption_lag_24h = raw[i - 24].consumption;
            rows.push(row);
        }

        debug!(
            "Built {} feature rows from {} raw rows",
            rows.len(),
            raw.len()
        );
        Ok(rows)
    }

    /// Features para horas futuras sin precio observado.
    ///
    /// Oferta/demanda: promedio por hora del día sobre los últimos
    /// `future_profile_days`. Lags: último precio, medias de 24h y 168h.
    pub fn prepare_future(
        &self,
        history: &[FeatureRow],
        start: NaiveDateTime,
        hours: usize,
    ) -> Result<Vec<FeatureRow>> {
        let observed: Vec<&FeatureRow> = history
            .iter()
            .filter(|r| r.price.is_some() && r.timestamp < start)
            .collect();
        let last = observed
            .last()
            .ok_or_else(|| ForecastError::EmptyInput("history for future features".to_string()))?;

        let profile_start = last.timestamp - Duration::days(self.settings.future_profile_days);
        let profile: Vec<&FeatureRow> = observed
            .iter()
            .copied()
            .filter(|r| r.timestamp > profile_start)
            .collect();

        let hourly_mean = |hour: u32, f: &dyn Fn(&FeatureRow) -> f64| -> f64 {
            let values: Vec<f64> = profile
                .iter()
                .filter(|r| r.timestamp.hour() == hour)
                .map(|r| f(*r))
                .collect();
            if values.is_empty() {
                mean(&profile.iter().map(|r| f(*r)).collect::<Vec<_>>())
            } else {
                mean(&values)
            }
        };

        let recent: Vec<f64> = observed.iter().filter_map(|r| r.price).collect();
        let tail = |n: usize| &recent[recent.len().saturating_sub(n)..];
        let last_price = recent.last().copied().unwrap_or(0.0);
        let mean_24 = mean(tail(ROLLING_WINDOW));
        let mean_168 = mean(tail(MAX_LAG_HOURS));
        let std_24 = sample_std(tail(ROLLING_WINDOW));

        let future = (0..hours as i64)
            .map(|h| {
                let ts = start + Duration::hours(h);
                let hour = ts.hour();
                let mut row = self.calendar_row(ts);
                row.consumption = hourly_mean(hour, &|r: &FeatureRow| r.consumption);
                row.generation_total = hourly_mean(hour, &|r: &FeatureRow| r.generation_total);
                row.supply_demand_gap = row.generation_total - row.consumption;
                row.renewable_ratio = hourly_mean(hour, &|r: &FeatureRow| r.renewable_ratio);
                row.fossil_ratio = hourly_mean(hour, &|r: &FeatureRow| r.fossil_ratio);
                row.hydro_ratio = hourly_mean(hour, &|r: &FeatureRow| r.hydro_ratio);
                row.price_lag_1h = last_price;
                row.price_lag_24h = mean_24;
                row.price_lag_168h = mean_168;
                row.price_rolling_24h = mean_24;
                row.price_std_24h = std_24;
                row.consumption_lag_24h = row.consumption;
                row
            })
            .collect();
        Ok(future)
    }
}

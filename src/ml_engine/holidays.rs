//! Calendario de feriados para el modelo de tendencia
//!
//! Feriados nacionales fijos (mes/día) más feriados religiosos móviles dados
//! como listas explícitas de fechas. Cada feriado tiene una ventana
//! `lower_window..=upper_window` en días alrededor de cada fecha; por defecto
//! `upper_window = 1` para capturar el efecto del día siguiente.

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

fn default_upper_window() -> i64 {
    1
}

/// Feriado de fecha fija que se repite cada año
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedHoliday {
    pub name: String,
    pub month: u32,
    pub day: u32,
    #[serde(default)]
    pub lower_window: i64,
    #[serde(default = "default_upper_window")]
    pub upper_window: i64,
}

/// Feriado móvil con fechas explícitas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingHoliday {
    pub name: String,
    pub dates: Vec<NaiveDate>,
    #[serde(default)]
    pub lower_window: i64,
    #[serde(default = "default_upper_window")]
    pub upper_window: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HolidayCalendar {
    #[serde(default)]
    pub fixed: Vec<FixedHoliday>,
    #[serde(default)]
    pub moving: Vec<MovingHoliday>,
}

impl HolidayCalendar {
    /// Calendario turco incorporado (2024-2026)
    pub fn builtin() -> Self {
        let fixed = [
            ("new_year", 1, 1),
            ("national_sovereignty", 4, 23),
            ("labour_day", 5, 1),
            ("youth_and_sports", 5, 19),
            ("democracy_day", 7, 15),
            ("victory_day", 8, 30),
            ("republic_day", 10, 29),
        ]
        .into_iter()
        .map(|(name, month, day)| FixedHoliday {
            name: name.to_string(),
            month,
            day,
            lower_window: 0,
            upper_window: 1,
        })
        .collect();

        let ramazan = [
            (2024, 4, 6, 9),
            (2025, 3, 29, 4),
            (2026, 3, 19, 4),
        ];
        let kurban = [
            (2024, 6, 15, 5),
            (2025, 6, 5, 5),
            (2026, 5, 26, 5),
        ];

        Self {
            fixed,
            moving: vec![
                MovingHoliday {
                    name: "ramazan_bayrami".to_string(),
                    dates: expand_ranges(&ramazan),
                    lower_window: 0,
                    upper_window: 1,
                },
                MovingHoliday {
                    name: "kurban_bayrami".to_string(),
                    dates: expand_ranges(&kurban),
                    lower_window: 0,
                    upper_window: 1,
                },
            ],
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let calendar: Self = serde_yaml::from_str(yaml).context("Invalid holiday calendar YAML")?;
        Ok(calendar)
    }

    /// Cargar desde YAML, o el calendario incorporado si no hay ruta
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) if Path::new(path).exists() => {
                let yaml = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read holiday calendar {}", path))?;
                let calendar = Self::from_yaml_str(&yaml)?;
                info!(
                    "📂 Holiday calendar loaded from {} ({} fixed, {} moving)",
                    path,
                    calendar.fixed.len(),
                    calendar.moving.len()
                );
                Ok(calendar)
            }
            Some(path) => anyhow::bail!("Holiday calendar {} not found", path),
            None => Ok(Self::builtin()),
        }
    }

    /// Nombres de feriados en orden estable (una columna por nombre)
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .fixed
            .iter()
            .map(|h| h.name.clone())
            .chain(self.moving.iter().map(|h| h.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Feriados cuya ventana cubre `date`
    pub fn active_on(&self, date: NaiveDate) -> Vec<&str> {
        let mut active = Vec::new();
        for h in &self.fixed {
            let hit = (h.lower_window.min(0)..=h.upper_window.max(0)).any(|offset| {
                let anchor = date - Duration::days(offset);
                anchor.month() == h.month && anchor.day() == h.day
            });
            if hit {
                active.push(h.name.as_str());
            }
        }
        for h in &self.moving {
            let hit = h.dates.iter().any(|d| {
                let delta = (date - *d).num_days();
                delta >= h.lower_window.min(0) && delta <= h.upper_window.max(0)
            });
            if hit {
                active.push(h.name.as_str());
            }
        }
        active
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        !self.active_on(date).is_empty()
    }
}

fn expand_ranges(ranges: &[(i32, u32, u32, i64)]) -> Vec<NaiveDate> {
    ranges
        .iter()
        .filter_map(|(y, m, d, days)| {
            NaiveDate::from_ymd_opt(*y, *m, *d).map(|start| (start, *days))
        })
        .flat_map(|(start, days)| (0..days).map(move |i| start + Duration::days(i)))
        .collect()
}

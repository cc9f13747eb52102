//! Dataset - Unión de fuentes horarias y datasets de entrenamiento
//!
//! `join_sources` arma la serie horaria cruda (precio + consumo + generación);
//! `Dataset` es el conjunto de filas de features acotado por un `Cutoff`, con
//! los splits temporales que usa el entrenamiento.

use crate::error::{ForecastError, Result};
use crate::ml_engine::features::FeatureRow;
use crate::types::{Cutoff, PricePoint, SupplyDemandPoint};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Fuentes de generación que alimentan los ratios
pub const GENERATION_SOURCES: [&str; 5] = ["solar", "wind", "hydro", "natural_gas", "lignite"];

/// Fila horaria cruda tras el join de las tres fuentes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHourlyRow {
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub consumption: f64,
    pub generation_total: f64,
    pub solar: f64,
    pub wind: f64,
    pub hydro: f64,
    pub natural_gas: f64,
    pub lignite: f64,
}

/// Qué columnas entrega realmente la fuente de datos
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceCapabilities {
    pub consumption: bool,
    pub generation_total: bool,
    pub sources: BTreeSet<String>,
}

impl SourceCapabilities {
    /// Todas las columnas presentes
    pub fn full() -> Self {
        Self {
            consumption: true,
            generation_total: true,
            sources: GENERATION_SOURCES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Detectar a partir de los puntos recibidos
    pub fn detect(points: &[SupplyDemandPoint]) -> Self {
        let mut caps = Self::default();
        for p in points {
            caps.consumption |= p.consumption.is_some();
            caps.generation_total |= p.generation_total.is_some();
            caps.sources.extend(p.generation.keys().cloned());
        }
        caps
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains(name)
    }
}

/// Left join de precios con consumo/generación por timestamp.
///
/// Ordena, elimina timestamps duplicados (se queda con el primero), rellena
/// consumo y generación total hacia adelante y luego hacia atrás; las
/// fuentes individuales faltantes quedan en 0.
pub fn join_sources(
    prices: &[PricePoint],
    supply_demand: &[SupplyDemandPoint],
) -> Result<Vec<RawHourlyRow>> {
    if prices.is_empty() {
        return Err(ForecastError::EmptyInput("price series".to_string()));
    }

    let mut prices: Vec<PricePoint> = prices.to_vec();
    prices.sort_by_key(|p| p.timestamp);
    prices.dedup_by_key(|p| p.timestamp);

    let mut by_ts: HashMap<NaiveDateTime, &SupplyDemandPoint> = HashMap::new();
    for point in supply_demand {
        by_ts.entry(point.timestamp).or_insert(point);
    }

    let mut consumption: Vec<Option<f64>> = Vec::with_capacity(prices.len());
    let mut generation_total: Vec<Option<f64>> = Vec::with_capacity(prices.len());
    let mut rows = Vec::with_capacity(prices.len());

    for p in &prices {
        let sd = by_ts.get(&p.timestamp);
        consumption.push(sd.and_then(|s| s.consumption));
        generation_total.push(sd.and_then(|s| s.generation_total));
        let source = |name: &str| sd.map(|s| s.source(name)).unwrap_or(0.0);
        rows.push(RawHourlyRow {
            timestamp: p.timestamp,
            price: p.price,
            consumption: 0.0,
            generation_total: 0.0,
            solar: source("solar"),
            wind: source("wind"),
            hydro: source("hydro"),
            natural_gas: source("natural_gas"),
            lignite: source("lignite"),
        });
    }

    let consumption = fill_forward_backward(&consumption);
    let generation_total = fill_forward_backward(&generation_total);
    for (i, row) in rows.iter_mut().enumerate() {
        row.consumption = consumption[i];
        row.generation_total = generation_total[i];
    }

    Ok(rows)
}

/// Reindexar sobre una grilla horaria contigua.
///
/// Cada hora faltante entre dos filas copia la fila previa (ffill). Entrada
/// ordenada y sin duplicados.
pub fn reindex_hourly(rows: &[RawHourlyRow]) -> Vec<RawHourlyRow> {
    let mut grid: Vec<RawHourlyRow> = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(prev) = grid.last().cloned() {
            let mut ts = prev.timestamp + Duration::hours(1);
            while ts < row.timestamp {
                grid.push(RawHourlyRow {
                    timestamp: ts,
                    ..prev.clone()
                });
                ts += Duration::hours(1);
            }
        }
        grid.push(row.clone());
    }
    grid
}

/// ffill seguido de bfill; una serie sin ningún valor queda en 0
pub fn fill_forward_backward(values: &[Option<f64>]) -> Vec<f64> {
    let mut filled: Vec<Option<f64>> = values.to_vec();
    let mut last = None;
    for v in filled.iter_mut() {
        match v {
            Some(x) => last = Some(*x),
            None => *v = last,
        }
    }
    let mut next = None;
    for v in filled.iter_mut().rev() {
        match v {
            Some(x) => next = Some(*x),
            None => *v = next,
        }
    }
    filled.into_iter().map(|v| v.unwrap_or(0.0)).collect()
}

/// Filas de features utilizables para entrenar antes de un cutoff
#[derive(Debug, Clone)]
pub struct Dataset {
    pub rows: Vec<FeatureRow>,
    pub cutoff: Cutoff,
}

impl Dataset {
    /// Solo filas con precio observado y estrictamente anteriores al cutoff
    pub fn before(rows: &[FeatureRow], cutoff: Cutoff) -> Self {
        let rows = rows
            .iter()
            .filter(|r| cutoff.admits(r.timestamp) && r.price.is_some())
            .cloned()
            .collect();
        Self { rows, cutoff }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.rows.last().map(|r| r.timestamp)
    }

    pub fn targets(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.price).collect()
    }

    /// Matriz fila-mayor con las columnas pedidas, en el orden dado
    pub fn to_matrix(&self, feature_names: &[String]) -> Vec<Vec<f64>> {
        self.rows
            .iter()
            .map(|r| {
                feature_names
                    .iter()
                    .map(|name| r.value(name).unwrap_or(0.0))
                    .collect()
            })
            .collect()
    }

    /// Split temporal: todo antes de `holdout_start` vs. desde ahí
    pub fn temporal_split(&self, holdout_start: NaiveDateTime) -> (Dataset, Dataset) {
        let split = self
            .rows
            .partition_point(|r| r.timestamp < holdout_start);
        (
            Dataset {
                rows: self.rows[..split].to_vec(),
                cutoff: Cutoff::at(holdout_start),
            },
            Dataset {
                rows: self.rows[split..].to_vec(),
                cutoff: self.cutoff,
            },
        )
    }
}

/// K-fold temporal de ventana creciente.
///
/// Con n muestras y k folds el tamaño de validación es n / (k + 1); el fold i
/// entrena con `[0, n - (k - i) * test)` y valida en el bloque siguiente.
#[derive(Debug, Clone, Copy)]
pub struct TimeSeriesSplit {
    pub n_splits: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: std::ops::Range<usize>,
    pub validation: std::ops::Range<usize>,
}

impl TimeSeriesSplit {
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits }
    }

    pub fn split(&self, n_samples: usize) -> Result<Vec<Fold>> {
        let test_size = n_samples / (self.n_splits + 1);
        if self.n_splits < 2 || test_size == 0 {
            return Err(ForecastError::InsufficientHistory {
                needed: self.n_splits + 1,
                got: n_samples,
            });
        }
        let first_test = n_samples - self.n_splits * test_size;
        Ok((0..self.n_splits)
            .map(|i| {
                let start = first_test + i * test_size;
                Fold {
                    train: 0..start,
                    validation: start..start + test_size,
                }
            })
            .collect())
    }
}

//! Market data source
//!
//! Reads the three hourly inputs from CSV:
//! - `mcp_data.csv`: date, hour, price
//! - `consumption_data.csv`: date, hour, consumption
//! - `generation_data.csv`: date, hour, total, then one column per source
//!
//! `date` may be a plain date or an RFC 3339 timestamp; only its date part is
//! used and the hour comes from the `hour` column (`5` or `05:00`).

use crate::ml_engine::dataset::SourceCapabilities;
use crate::types::{parse_market_timestamp, PricePoint, SupplyDemandPoint};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

pub const PRICE_FILE: &str = "mcp_data.csv";
pub const CONSUMPTION_FILE: &str = "consumption_data.csv";
pub const GENERATION_FILE: &str = "generation_data.csv";

/// Hourly market inputs over half-open ranges `[start, end)`
pub trait MarketDataSource {
    fn prices(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<PricePoint>>;

    fn supply_demand(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<SupplyDemandPoint>>;

    /// Supply columns this source actually provides
    fn capabilities(&self) -> SourceCapabilities;
}

/// CSV files loaded once into memory
#[derive(Debug, Clone, Default)]
pub struct CsvMarketData {
    prices: BTreeMap<NaiveDateTime, f64>,
    supply: BTreeMap<NaiveDateTime, SupplyDemandPoint>,
    capabilities: SourceCapabilities,
}

fn column(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name))
}

fn required_column(headers: &StringRecord, name: &str, path: &Path) -> Result<usize> {
    column(headers, name).ok_or_else(|| anyhow!("{} has no '{}' column", path.display(), name))
}

/// Timestamp from the date and hour fields
fn row_timestamp(date: &str, hour: &str) -> Option<NaiveDateTime> {
    let day = parse_market_timestamp(date)?.date();
    let hour: i64 = hour.trim().split(':').next()?.trim().parse().ok()?;
    if !(0..24).contains(&hour) {
        return None;
    }
    day.and_hms_opt(0, 0, 0).map(|d| d + Duration::hours(hour))
}

fn parse_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        None
    } else {
        raw.parse().ok()
    }
}

impl CsvMarketData {
    /// Load every input present under `dir`; the price file is required
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut data = Self::default();
        data.load_prices(&dir.join(PRICE_FILE))?;

        let consumption_path = dir.join(CONSUMPTION_FILE);
        if consumption_path.exists() {
            data.load_consumption(&consumption_path)?;
        } else {
            warn!("⚠️ {} not found, consumption features unavailable", consumption_path.display());
        }
        let generation_path = dir.join(GENERATION_FILE);
        if generation_path.exists() {
            data.load_generation(&generation_path)?;
        } else {
            warn!("⚠️ {} not found, generation features unavailable", generation_path.display());
        }

        let points: Vec<SupplyDemandPoint> = data.supply.values().cloned().collect();
        data.capabilities = SourceCapabilities::detect(&points);
        info!(
            "📂 Market data loaded: {} prices, {} supply/demand hours, sources {:?}",
            data.prices.len(),
            data.supply.len(),
            data.capabilities.sources
        );
        Ok(data)
    }

    fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
        ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed opening {}", path.display()))
    }

    fn load_prices(&mut self, path: &Path) -> Result<()> {
        let mut reader = Self::reader(path)?;
        let headers = reader.headers()?.clone();
        let date = required_column(&headers, "date", path)?;
        let hour = required_column(&headers, "hour", path)?;
        let price = required_column(&headers, "price", path)?;

        let mut skipped = 0usize;
        for record in reader.records() {
            let record = record?;
            let ts = row_timestamp(record.get(date).unwrap_or(""), record.get(hour).unwrap_or(""));
            let value = record.get(price).and_then(parse_value);
            match (ts, value) {
                // keep the first row for a timestamp
                (Some(ts), Some(v)) => {
                    self.prices.entry(ts).or_insert(v);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("⚠️ Skipped {} unparseable rows in {}", skipped, path.display());
        }
        Ok(())
    }

    fn supply_entry(&mut self, ts: NaiveDateTime) -> &mut SupplyDemandPoint {
        self.supply.entry(ts).or_insert_with(|| SupplyDemandPoint {
            timestamp: ts,
            ..SupplyDemandPoint::default()
        })
    }

    fn load_consumption(&mut self, path: &Path) -> Result<()> {
        let mut reader = Self::reader(path)?;
        let headers = reader.headers()?.clone();
        let date = required_column(&headers, "date", path)?;
        let hour = required_column(&headers, "hour", path)?;
        let consumption = required_column(&headers, "consumption", path)?;

        for record in reader.records() {
            let record = record?;
            let Some(ts) = row_timestamp(record.get(date).unwrap_or(""), record.get(hour).unwrap_or("")) else {
                continue;
            };
            if let Some(v) = record.get(consumption).and_then(parse_value) {
                let point = self.supply_entry(ts);
                point.consumption.get_or_insert(v);
            }
        }
        Ok(())
    }

    fn load_generation(&mut self, path: &Path) -> Result<()> {
        let mut reader = Self::reader(path)?;
        let headers = reader.headers()?.clone();
        let date = required_column(&headers, "date", path)?;
        let hour = required_column(&headers, "hour", path)?;
        let total = column(&headers, "total").or_else(|| column(&headers, "generation_total"));
        let sources: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != date && *i != hour && Some(*i) != total)
            .map(|(i, h)| (i, h.trim().to_ascii_lowercase()))
            .collect();

        for record in reader.records() {
            let record = record?;
            let Some(ts) = row_timestamp(record.get(date).unwrap_or(""), record.get(hour).unwrap_or("")) else {
                continue;
            };
            let total_value = total.and_then(|i| record.get(i)).and_then(parse_value);
            let values: Vec<(String, f64)> = sources
                .iter()
                .filter_map(|(i, name)| record.get(*i).and_then(parse_value).map(|v| (name.clone(), v)))
                .collect();
            let point = self.supply_entry(ts);
            if point.generation_total.is_none() {
                point.generation_total = total_value;
            }
            for (name, v) in values {
                point.generation.entry(name).or_insert(v);
            }
        }
        Ok(())
    }

    /// Last hour with an observed price
    pub fn last_price_timestamp(&self) -> Option<NaiveDateTime> {
        self.prices.keys().next_back().copied()
    }
}

impl MarketDataSource for CsvMarketData {
    fn prices(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<PricePoint>> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self
            .prices
            .range(start..end)
            .map(|(ts, price)| PricePoint {
                timestamp: *ts,
                price: *price,
            })
            .collect())
    }

    fn supply_demand(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<SupplyDemandPoint>> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self.supply.range(start..end).map(|(_, p)| p.clone()).collect())
    }

    fn capabilities(&self) -> SourceCapabilities {
        self.capabilities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn write_inputs(dir: &Path) {
        fs::write(
            dir.join(PRICE_FILE),
            "date,hour,price\n\
             2026-01-05,0,2100.5\n\
             2026-01-05T00:00:00+03:00,01:00,2050\n\
             2026-01-05,2,\n\
             2026-01-05,0,9999\n",
        )
        .unwrap();
        fs::write(
            dir.join(CONSUMPTION_FILE),
            "date,hour,consumption\n2026-01-05,0,31000\n2026-01-05,1,30500\n",
        )
        .unwrap();
        fs::write(
            dir.join(GENERATION_FILE),
            "date,hour,total,solar,wind,hydro,natural_gas,lignite\n\
             2026-01-05,0,33000,0,2500,6000,9000,7000\n",
        )
        .unwrap();
    }

    #[test]
    fn test_loads_and_normalizes_timestamps() {
        let dir = TempDir::new().unwrap();
        write_inputs(dir.path());
        let data = CsvMarketData::open(dir.path()).unwrap();

        let prices = data.prices(at(5, 0), at(6, 0)).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].price, 2100.5);
        assert_eq!(prices[1].timestamp, at(5, 1));
        assert_eq!(data.last_price_timestamp(), Some(at(5, 1)));

        let supply = data.supply_demand(at(5, 0), at(6, 0)).unwrap();
        assert_eq!(supply.len(), 2);
        assert_eq!(supply[0].generation_total, Some(33000.0));
        assert_eq!(supply[0].source("wind"), 2500.0);
        assert_eq!(supply[1].generation_total, None);
    }

    #[test]
    fn test_range_is_half_open() {
        let dir = TempDir::new().unwrap();
        write_inputs(dir.path());
        let data = CsvMarketData::open(dir.path()).unwrap();
        assert_eq!(data.prices(at(5, 0), at(5, 1)).unwrap().len(), 1);
        assert!(data.prices(at(5, 1), at(5, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_capabilities_without_generation_file() {
        let dir = TempDir::new().unwrap();
        write_inputs(dir.path());
        fs::remove_file(dir.path().join(GENERATION_FILE)).unwrap();
        let data = CsvMarketData::open(dir.path()).unwrap();
        let caps = data.capabilities();
        assert!(caps.consumption);
        assert!(!caps.generation_total);
        assert!(caps.sources.is_empty());
    }

    #[test]
    fn test_missing_price_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(CsvMarketData::open(dir.path()).is_err());
    }

    #[test]
    fn test_row_timestamp() {
        assert_eq!(row_timestamp("2026-01-05", "23"), Some(at(5, 23)));
        assert_eq!(row_timestamp("2026-01-05", "24"), None);
        assert_eq!(row_timestamp("garbage", "1"), None);
    }
}

//! Tests del ciclo semanal

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
    use mcp_forecast::ml_engine::dataset::SourceCapabilities;
    use mcp_forecast::ml_engine::models::{ResidualConfig, SequenceConfig, TrendConfig};
    use mcp_forecast::ml_engine::persistence::ModelStore;
    use mcp_forecast::ml_engine::{HolidayCalendar, MLEngineConfig, TrainingConfig};
    use mcp_forecast::persistence::{CsvForecastStore, ForecastStore, InMemoryForecastStore, MarketDataSource};
    use mcp_forecast::types::{CombinationMode, ForecastRecord, PricePoint, SupplyDemandPoint, WeekWindow};
    use mcp_forecast::workflow::export::ExportSettings;
    use mcp_forecast::workflow::{CycleSettings, Stage, StageOutcome, WeeklyCycle};
    use mockall::mock;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    mock! {
        pub Market {}

        impl MarketDataSource for Market {
            fn prices(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<PricePoint>>;
            fn supply_demand(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<SupplyDemandPoint>>;
            fn capabilities(&self) -> SourceCapabilities;
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn first_hour() -> NaiveDateTime {
        date(2025, 11, 3).and_hms_opt(0, 0, 0).unwrap()
    }

    // ============================================================================
    // Datos sintéticos
    // ============================================================================

    /// Hourly market observed from 2025-11-03 until `until` (exclusive)
    fn synthetic(until: NaiveDateTime, with_generation: bool) -> (Vec<PricePoint>, Vec<SupplyDemandPoint>) {
        let hours = (until - first_hour()).num_hours() as usize;
        let mut prices = Vec::with_capacity(hours);
        let mut supply = Vec::with_capacity(hours);
        for i in 0..hours {
            let ts = first_hour() + Duration::hours(i as i64);
            let hour = ts.hour() as f64;
            let noise = ((i * 104_729) % 61) as f64 - 30.0;
            prices.push(PricePoint {
                timestamp: ts,
                price: 2100.0 + 300.0 * (std::f64::consts::PI * hour / 12.0).sin() + noise,
            });
            let generation: BTreeMap<String, f64> = if with_generation {
                [
                    ("solar", if (8..17).contains(&ts.hour()) { 2500.0 } else { 0.0 }),
                    ("wind", 2000.0 + (i % 7) as f64 * 100.0),
                    ("hydro", 5500.0),
                    ("natural_gas", 9000.0),
                    ("lignite", 7000.0),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect()
            } else {
                BTreeMap::new()
            };
            supply.push(SupplyDemandPoint {
                timestamp: ts,
                consumption: Some(32_000.0 + 80.0 * hour),
                generation_total: if with_generation { Some(generation.values().sum()) } else { None },
                generation,
            });
        }
        (prices, supply)
    }

    fn mock_market(until: NaiveDateTime, with_generation: bool) -> MockMarket {
        let (prices, supply) = synthetic(until, with_generation);
        let capabilities = SourceCapabilities::detect(&supply);
        let prices = Arc::new(prices);
        let supply = Arc::new(supply);

        let mut market = MockMarket::new();
        market.expect_prices().returning(move |start, end| {
            Ok(prices
                .iter()
                .filter(|p| p.timestamp >= start && p.timestamp < end)
                .copied()
                .collect())
        });
        market.expect_supply_demand().returning(move |start, end| {
            Ok(supply
                .iter()
                .filter(|p| p.timestamp >= start && p.timestamp < end)
                .cloned()
                .collect())
        });
        market.expect_capabilities().returning(move || capabilities.clone());
        market
    }

    fn settings(dir: &TempDir, sequence: bool) -> CycleSettings {
        CycleSettings {
            engine: MLEngineConfig {
                trend: TrendConfig {
                    n_changepoints: 5,
                    yearly_fourier_order: 0,
                    ..TrendConfig::default()
                },
                residual: ResidualConfig {
                    n_estimators: 10,
                    max_depth: 3,
                    learning_rate: 0.1,
                    cv_folds: 2,
                    ..ResidualConfig::default()
                },
                sequence: SequenceConfig {
                    enabled: sequence,
                    reservoir_size: 16,
                    ..SequenceConfig::default()
                },
                training: TrainingConfig {
                    holdout_days: 2,
                    history_days: 42,
                },
                ..MLEngineConfig::default()
            },
            export: ExportSettings {
                enabled: true,
                output_path: dir.path().join("public").join("forecasts.json"),
                history_weeks: 8,
            },
        }
    }

    // ============================================================================
    // Ciclo completo
    // ============================================================================

    #[test]
    fn test_cycle_respects_cutoff() {
        let dir = TempDir::new().unwrap();
        let week = WeekWindow::containing(date(2026, 1, 12));
        // actuals run past the forecast week; none may reach training
        let market = mock_market(week.end_exclusive() + Duration::days(7), true);
        let mut store = InMemoryForecastStore::new();
        let models = ModelStore::new(dir.path()).unwrap();

        let report = {
            let mut cycle = WeeklyCycle::new(settings(&dir, true), HolidayCalendar::builtin(), &market, &mut store, models);
            cycle.run(date(2026, 1, 14)).unwrap()
        };

        assert!(report.completed());
        assert_eq!(report.week, week);
        assert_eq!(report.forecasts, WeekWindow::HOURS);
        assert_eq!(report.outcome(Stage::RetrainSequence), Some(&StageOutcome::Completed));
        assert_eq!(report.final_mode, Some(CombinationMode::AdaptiveWeighted));

        let history = ModelStore::new(dir.path()).unwrap().load_training_history().unwrap();
        assert_eq!(history.len(), 3);
        for record in &history {
            assert!(record.report.trained_until < week.start_instant());
            assert_eq!(record.week_start, week.week_start);
        }

        let rows = store.load_week(week.week_start).unwrap();
        assert_eq!(rows.len(), WeekWindow::HOURS);
        assert_eq!(rows[0].forecast_datetime, week.start_instant());
        assert!(rows.iter().all(|r| r.sequence_component.is_some()));
        assert!(dir.path().join("public").join("forecasts.json").exists());
    }

    #[test]
    fn test_without_sequence_output_is_trend_plus_residual() {
        let dir = TempDir::new().unwrap();
        let week = WeekWindow::containing(date(2026, 1, 12));
        let market = mock_market(week.start_instant(), true);
        let mut store = InMemoryForecastStore::new();
        let models = ModelStore::new(dir.path()).unwrap();

        let report = {
            let mut cycle = WeeklyCycle::new(settings(&dir, false), HolidayCalendar::builtin(), &market, &mut store, models);
            cycle.run(week.week_start).unwrap()
        };

        assert!(matches!(report.outcome(Stage::RetrainSequence), Some(StageOutcome::Skipped(_))));
        assert_eq!(report.final_mode, Some(CombinationMode::TwoModelFallback));
        let rows = store.load_week(week.week_start).unwrap();
        for r in &rows {
            assert_eq!(r.mode, CombinationMode::TwoModelFallback);
            assert_eq!(r.predicted_price, r.trend_component + r.residual_component);
            assert!(r.sequence_component.is_none());
        }
    }

    #[test]
    fn test_reforecast_replaces_week() {
        let dir = TempDir::new().unwrap();
        let week = WeekWindow::containing(date(2026, 1, 12));
        let market = mock_market(week.start_instant(), true);
        let mut store = CsvForecastStore::open(dir.path()).unwrap();

        {
            let mut cycle = WeeklyCycle::new(
                settings(&dir, false),
                HolidayCalendar::builtin(),
                &market,
                &mut store,
                ModelStore::new(dir.path()).unwrap(),
            );
            cycle.run(week.week_start).unwrap();
            cycle.run(week.week_start + Duration::days(3)).unwrap();
        }

        assert_eq!(store.load_week(week.week_start).unwrap().len(), WeekWindow::HOURS);
        let reopened = CsvForecastStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_week(week.week_start).unwrap().len(), WeekWindow::HOURS);
        assert_eq!(reopened.forecast_weeks().unwrap(), vec![week.week_start]);
    }

    #[test]
    fn test_previous_week_reconciled_and_weights_updated() {
        let dir = TempDir::new().unwrap();
        let first = WeekWindow::containing(date(2026, 1, 5));
        let second = first.next();
        let market = mock_market(second.start_instant(), true);
        let mut store = InMemoryForecastStore::new();

        let (r1, r2) = {
            let mut cycle = WeeklyCycle::new(
                settings(&dir, true),
                HolidayCalendar::builtin(),
                &market,
                &mut store,
                ModelStore::new(dir.path()).unwrap(),
            );
            (cycle.run(first.week_start).unwrap(), cycle.run(second.week_start).unwrap())
        };

        assert!(matches!(r1.outcome(Stage::ReconcilePrevious), Some(StageOutcome::Skipped(_))));
        assert_eq!(r1.weights_version, 0);
        assert_eq!(r2.outcome(Stage::ReconcilePrevious), Some(&StageOutcome::Completed));
        assert_eq!(r2.weights_version, 1);

        let performance = store.performance(first.week_start).unwrap().unwrap();
        assert_eq!(performance.total_predictions, WeekWindow::HOURS);
        let rows: Vec<ForecastRecord> = store.load_week(first.week_start).unwrap();
        let mae = rows
            .iter()
            .map(|r| (r.actual_price.unwrap() - r.predicted_price).abs())
            .sum::<f64>()
            / rows.len() as f64;
        assert!((performance.mae - mae).abs() < 1e-9);

        let weights = ModelStore::new(dir.path())
            .unwrap()
            .load_weights(&Default::default());
        assert_eq!(weights.version, 1);
        assert!(weights.is_normalized());
        assert_eq!(weights.source_week, Some(first.week_start));
    }

    #[test]
    fn test_residual_stacking_cycle() {
        let dir = TempDir::new().unwrap();
        let week = WeekWindow::containing(date(2026, 1, 12));
        let market = mock_market(week.start_instant(), true);
        let mut store = InMemoryForecastStore::new();
        let mut settings = settings(&dir, true);
        settings.engine.ensemble.mode = CombinationMode::ResidualStacking;
        let factor = settings.engine.ensemble.stacking_factor;

        let report = {
            let mut cycle = WeeklyCycle::new(settings, HolidayCalendar::builtin(), &market, &mut store, ModelStore::new(dir.path()).unwrap());
            cycle.run(week.week_start).unwrap()
        };

        assert!(report.completed());
        assert_eq!(report.final_mode, Some(CombinationMode::ResidualStacking));
        let rows = store.load_week(week.week_start).unwrap();
        assert_eq!(rows.len(), WeekWindow::HOURS);
        for r in &rows {
            let base = r.trend_component + r.residual_component;
            match r.sequence_component {
                Some(seq) => {
                    assert_eq!(r.mode, CombinationMode::ResidualStacking);
                    assert_relative_eq!(r.predicted_price, base + factor * (seq - base), epsilon = 1e-9);
                }
                None => assert_eq!(r.predicted_price, base),
            }
        }
    }

    // ============================================================================
    // Pesos por semana
    // ============================================================================

    #[test]
    fn test_backfill_of_older_week_keeps_current_weights() {
        let dir = TempDir::new().unwrap();
        let a = WeekWindow::containing(date(2026, 1, 5));
        let b = a.next();
        let c = b.next();
        let market = mock_market(c.start_instant(), true);
        let mut store = InMemoryForecastStore::new();

        let (rc, backfilled) = {
            let mut cycle = WeeklyCycle::new(
                settings(&dir, false),
                HolidayCalendar::builtin(),
                &market,
                &mut store,
                ModelStore::new(dir.path()).unwrap(),
            );
            cycle.run(a.week_start).unwrap();
            cycle.run(b.week_start).unwrap();
            let rc = cycle.run(c.week_start).unwrap();
            (rc, cycle.backfill(&[a.week_start]).unwrap())
        };

        assert_eq!(rc.weights_version, 2);
        // week A predates every reconciled week
        assert_eq!(backfilled.len(), 1);
        assert_eq!(backfilled[0].weights_version, 0);

        let models = ModelStore::new(dir.path()).unwrap();
        let current = models.load_weights(&Default::default());
        assert_eq!(current.source_week, Some(b.week_start));
        assert_eq!(current.version, 2);
        assert_eq!(models.weights_as_of(c.week_start, &Default::default()).version, 2);
        assert_eq!(models.weights_as_of(b.week_start, &Default::default()).source_week, Some(a.week_start));
    }

    #[test]
    fn test_reconcile_twice_keeps_weights_version() {
        let dir = TempDir::new().unwrap();
        let a = WeekWindow::containing(date(2026, 1, 5));
        let b = a.next();
        let market = mock_market(b.start_instant(), true);
        let mut store = InMemoryForecastStore::new();

        let (first, second) = {
            let mut cycle = WeeklyCycle::new(
                settings(&dir, false),
                HolidayCalendar::builtin(),
                &market,
                &mut store,
                ModelStore::new(dir.path()).unwrap(),
            );
            cycle.run(a.week_start).unwrap();
            cycle.run(b.week_start).unwrap();
            (cycle.reconcile(a.week_start).unwrap(), cycle.reconcile(a.week_start + Duration::days(2)).unwrap())
        };

        assert_eq!(first.metrics, second.metrics);
        let models = ModelStore::new(dir.path()).unwrap();
        let current = models.load_weights(&Default::default());
        assert_eq!(current.version, 1);
        assert_eq!(current.source_week, Some(a.week_start));
        assert_eq!(models.weights_history().len(), 1);
    }

    #[test]
    fn test_missing_generation_aborts_at_trend() {
        let dir = TempDir::new().unwrap();
        let week = WeekWindow::containing(date(2026, 1, 12));
        let market = mock_market(week.start_instant(), false);
        let mut store = InMemoryForecastStore::new();

        let result = {
            let mut cycle = WeeklyCycle::new(
                settings(&dir, false),
                HolidayCalendar::builtin(),
                &market,
                &mut store,
                ModelStore::new(dir.path()).unwrap(),
            );
            cycle.run(week.week_start)
        };

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("RETRAIN_TREND"));
        assert!(store.forecast_weeks().unwrap().is_empty());
    }

    // ============================================================================
    // Backfill y catch-up
    // ============================================================================

    #[test]
    fn test_missing_weeks() {
        let dir = TempDir::new().unwrap();
        let market = MockMarket::new();
        let mut store = InMemoryForecastStore::new();
        let seeded = WeekWindow::containing(date(2026, 1, 5));
        let records = seeded
            .hours()
            .into_iter()
            .map(|ts| ForecastRecord {
                week_start: seeded.week_start,
                week_end: seeded.week_end,
                forecast_datetime: ts,
                predicted_price: 2000.0,
                trend_component: 1900.0,
                residual_component: 100.0,
                sequence_component: None,
                lower_bound: 1700.0,
                upper_bound: 2300.0,
                mode: CombinationMode::TwoModelFallback,
                actual_price: None,
                absolute_error: None,
                percentage_error: None,
            })
            .collect();
        store.replace_week(&seeded, records).unwrap();

        let cycle = WeeklyCycle::new(
            settings(&dir, false),
            HolidayCalendar::builtin(),
            &market,
            &mut store,
            ModelStore::new(dir.path()).unwrap(),
        );
        assert_eq!(
            cycle.missing_weeks(date(2026, 1, 22)).unwrap(),
            vec![date(2026, 1, 12), date(2026, 1, 19)]
        );
        assert!(cycle.missing_weeks(date(2026, 1, 8)).unwrap().is_empty());
    }

    #[test]
    fn test_catch_up_fills_gap_in_order() {
        let dir = TempDir::new().unwrap();
        let first = WeekWindow::containing(date(2026, 1, 5));
        let today = date(2026, 1, 21);
        let market = mock_market(first.next().next().start_instant(), true);
        let mut store = InMemoryForecastStore::new();

        let reports = {
            let mut cycle = WeeklyCycle::new(
                settings(&dir, false),
                HolidayCalendar::builtin(),
                &market,
                &mut store,
                ModelStore::new(dir.path()).unwrap(),
            );
            cycle.run(first.week_start).unwrap();
            cycle.catch_up(today).unwrap()
        };

        let weeks: Vec<NaiveDate> = reports.iter().map(|r| r.week.week_start).collect();
        assert_eq!(weeks, vec![date(2026, 1, 12), date(2026, 1, 19)]);
        assert_eq!(
            store.forecast_weeks().unwrap(),
            vec![date(2026, 1, 5), date(2026, 1, 12), date(2026, 1, 19)]
        );
        assert!(reports.iter().all(|r| r.completed()));
    }
}

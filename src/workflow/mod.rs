//! Weekly cycle orchestrator
//!
//! RECONCILE_PREVIOUS → RETRAIN_TREND → RETRAIN_RESIDUAL → RETRAIN_SEQUENCE
//! → FORECAST_CURRENT → PERSIST → EXPORT → DONE
//!
//! Reconciliation, the sequence model and the export are non-fatal; every
//! other stage aborts the run. Every retrain uses the first instant of the
//! forecast week as its cutoff.

pub mod export;

use crate::ml_engine::dataset::join_sources;
use crate::ml_engine::ensemble::{dominant_mode, CombinedForecast, EnsembleCombiner, EnsembleWeights};
use crate::ml_engine::features::{BoundFeatures, FeaturePipeline, FeatureRow};
use crate::ml_engine::models::{
    ComponentModel, ResidualBoostModel, SequenceAvailability, SequenceOutput,
    TrendSeasonalityModel, UnavailableReason,
};
use crate::ml_engine::persistence::{ModelStore, TrainingRecord};
use crate::ml_engine::training::{TrainingPipeline, TrainingReport};
use crate::ml_engine::{HolidayCalendar, MLEngineConfig};
use crate::persistence::{ForecastStore, MarketDataSource};
use crate::reconciliation::{is_recoverable, ReconciliationResult, Reconciler};
use crate::types::{CombinationMode, Cutoff, ForecastRecord, WeekWindow};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use export::{build_export, write_export, ExportSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    ReconcilePrevious,
    RetrainTrend,
    RetrainResidual,
    RetrainSequence,
    ForecastCurrent,
    Persist,
    Export,
    Done,
}

impl Stage {
    /// Whether a failure here aborts the run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Stage::ReconcilePrevious | Stage::RetrainSequence | Stage::Export
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ReconcilePrevious => "RECONCILE_PREVIOUS",
            Stage::RetrainTrend => "RETRAIN_TREND",
            Stage::RetrainResidual => "RETRAIN_RESIDUAL",
            Stage::RetrainSequence => "RETRAIN_SEQUENCE",
            Stage::ForecastCurrent => "FORECAST_CURRENT",
            Stage::Persist => "PERSIST",
            Stage::Export => "EXPORT",
            Stage::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    Completed,
    Skipped(String),
    Failed(String),
}

/// Summary of one run of the weekly cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub week: WeekWindow,
    pub stages: Vec<(Stage, StageOutcome)>,
    pub final_mode: Option<CombinationMode>,
    pub weights_version: u64,
    pub forecasts: usize,
}

impl CycleReport {
    fn new(week: WeekWindow) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            week,
            stages: Vec::new(),
            final_mode: None,
            weights_version: 0,
            forecasts: 0,
        }
    }

    fn record(&mut self, stage: Stage, outcome: StageOutcome) {
        match &outcome {
            StageOutcome::Completed => info!("✅ {} completed", stage),
            StageOutcome::Skipped(reason) => info!("⏭️ {} skipped: {}", stage, reason),
            StageOutcome::Failed(detail) if stage.is_fatal() => error!("❌ {} failed: {}", stage, detail),
            StageOutcome::Failed(detail) => warn!("⚠️ {} failed: {}", stage, detail),
        }
        self.stages.push((stage, outcome));
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|(s, _)| *s == stage).map(|(_, o)| o)
    }

    pub fn completed(&self) -> bool {
        self.outcome(Stage::Done) == Some(&StageOutcome::Completed)
    }
}

/// Settings for one orchestrator instance
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub engine: MLEngineConfig,
    pub export: ExportSettings,
}

/// Runs the weekly state machine against a market source and a store it
/// owns for the duration of the run
pub struct WeeklyCycle<'a> {
    settings: CycleSettings,
    calendar: HolidayCalendar,
    market: &'a dyn MarketDataSource,
    store: &'a mut dyn ForecastStore,
    models: ModelStore,
    trainer: TrainingPipeline,
    combiner: EnsembleCombiner,
}

struct TrainedModels {
    trend: TrendSeasonalityModel,
    residual: ResidualBoostModel,
    sequence: SequenceAvailability,
}

impl<'a> WeeklyCycle<'a> {
    pub fn new(
        settings: CycleSettings,
        calendar: HolidayCalendar,
        market: &'a dyn MarketDataSource,
        store: &'a mut dyn ForecastStore,
        models: ModelStore,
    ) -> Self {
        let trainer = TrainingPipeline::new(settings.engine.clone(), calendar.clone());
        let combiner = EnsembleCombiner::new(settings.engine.ensemble.clone());
        Self {
            settings,
            calendar,
            market,
            store,
            models,
            trainer,
            combiner,
        }
    }

    fn now() -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    /// Run the cycle for the week containing `date`
    pub fn run(&mut self, date: NaiveDate) -> Result<CycleReport> {
        let week = WeekWindow::containing(date);
        let mut report = CycleReport::new(week);
        let span = info_span!("weekly_cycle", run_id = %report.run_id, week = %week);
        let _guard = span.enter();
        info!("🚀 Weekly cycle started for {}", week);

        // RECONCILE_PREVIOUS
        match self.reconcile_and_update(&week.previous()) {
            Ok(_) => report.record(Stage::ReconcilePrevious, StageOutcome::Completed),
            Err(e) if is_recoverable(&e) => {
                report.record(Stage::ReconcilePrevious, StageOutcome::Skipped(format!("{:#}", e)))
            }
            Err(e) => report.record(Stage::ReconcilePrevious, StageOutcome::Failed(format!("{:#}", e))),
        }
        let weights = self
            .models
            .weights_as_of(week.week_start, &self.settings.engine.ensemble);
        report.weights_version = weights.version;

        let cutoff = week.cutoff();
        let (pipeline, history) = match self.load_history(cutoff) {
            Ok(loaded) => loaded,
            Err(e) => return Self::abort(report, Stage::RetrainTrend, e),
        };

        let models = match self.retrain(&pipeline, &history, cutoff, &week, &mut report) {
            Ok(models) => models,
            Err((stage, e)) => return Self::abort(report, stage, e),
        };

        // FORECAST_CURRENT
        let combined = match self.forecast(&pipeline, &history, &models, &week, &weights) {
            Ok(rows) => rows,
            Err(e) => return Self::abort(report, Stage::ForecastCurrent, e),
        };
        report.final_mode = dominant_mode(&combined);
        report.forecasts = combined.len();
        report.record(Stage::ForecastCurrent, StageOutcome::Completed);

        // PERSIST
        let records = to_records(&week, &combined);
        if let Err(e) = self.store.replace_week(&week, records) {
            return Self::abort(report, Stage::Persist, e);
        }
        report.record(Stage::Persist, StageOutcome::Completed);

        // EXPORT
        if self.settings.export.enabled {
            match self.export(&week, &weights, report.final_mode) {
                Ok(()) => report.record(Stage::Export, StageOutcome::Completed),
                Err(e) => report.record(Stage::Export, StageOutcome::Failed(format!("{:#}", e))),
            }
        } else {
            report.record(Stage::Export, StageOutcome::Skipped("export disabled".to_string()));
        }

        report.record(Stage::Done, StageOutcome::Completed);
        info!(
            "🏁 Weekly cycle done: {} forecasts, mode {}, weights v{}",
            report.forecasts,
            report
                .final_mode
                .map(|m| m.to_string())
                .unwrap_or_else(|| "none".to_string()),
            report.weights_version
        );
        Ok(report)
    }

    fn abort(mut report: CycleReport, stage: Stage, err: anyhow::Error) -> Result<CycleReport> {
        report.record(stage, StageOutcome::Failed(format!("{:#}", err)));
        Err(err.context(format!("weekly cycle for {} aborted at {}", report.week, stage)))
    }

    /// Reconcile one week and record the weights derived from its component
    /// errors. Forecasts only read weights from weeks before their own.
    fn reconcile_and_update(&mut self, week: &WeekWindow) -> Result<ReconciliationResult> {
        let reconciler = Reconciler::new(self.settings.engine.low_price_threshold);
        let result = reconciler.reconcile(&mut *self.store, self.market, week)?;

        let latest = self.models.latest_weights(&self.settings.engine.ensemble);
        let next = latest.updated(&result.components, week.week_start, Self::now());
        if next.source_week == Some(week.week_start) && next.version > latest.version {
            match self.models.record_weights(next) {
                Ok(stored) => debug!("Weights v{} recorded for {}", stored.version, week),
                Err(e) => warn!("⚠️ Failed saving ensemble weights: {}", e),
            }
        }
        Ok(result)
    }

    /// Reconcile a single week outside the full cycle
    pub fn reconcile(&mut self, date: NaiveDate) -> Result<ReconciliationResult> {
        self.reconcile_and_update(&WeekWindow::containing(date))
    }

    /// Feature rows strictly before the cutoff
    fn load_history(&self, cutoff: Cutoff) -> Result<(FeaturePipeline, Vec<FeatureRow>)> {
        let end = cutoff.instant();
        let start = end - Duration::days(self.settings.engine.training.history_days);
        let prices = self
            .market
            .prices(start, end)
            .context("Failed loading price history")?;
        let supply = self
            .market
            .supply_demand(start, end)
            .context("Failed loading supply/demand history")?;
        let raw = join_sources(&prices, &supply)?;

        let pipeline = FeaturePipeline::new(
            self.settings.engine.features.clone(),
            self.calendar.clone(),
            &self.market.capabilities(),
        );
        let rows = pipeline.build(&raw, Some(cutoff))?;
        info!("📊 {} feature rows before {}", rows.len(), cutoff);
        Ok((pipeline, rows))
    }

    fn retrain(
        &mut self,
        pipeline: &FeaturePipeline,
        history: &[FeatureRow],
        cutoff: Cutoff,
        week: &WeekWindow,
        report: &mut CycleReport,
    ) -> std::result::Result<TrainedModels, (Stage, anyhow::Error)> {
        // RETRAIN_TREND
        let trend = self
            .trainer
            .retrain_trend(history, cutoff)
            .and_then(|t| {
                t.model.check_contract(pipeline.contract())?;
                Ok(t)
            })
            .map_err(|e| (Stage::RetrainTrend, anyhow!(e)))?;
        self.models
            .save_trend(&trend.model)
            .map_err(|e| (Stage::RetrainTrend, anyhow!(e)))?;
        self.log_training(week, trend.report);
        report.record(Stage::RetrainTrend, StageOutcome::Completed);

        // RETRAIN_RESIDUAL
        let residual = self
            .trainer
            .retrain_residual(history, &trend.model, cutoff)
            .map_err(|e| (Stage::RetrainResidual, anyhow!(e)))?;
        self.models
            .save_residual(&residual.model)
            .map_err(|e| (Stage::RetrainResidual, anyhow!(e)))?;
        self.log_training(week, residual.report);
        report.record(Stage::RetrainResidual, StageOutcome::Completed);

        // RETRAIN_SEQUENCE
        let sequence = self.retrain_sequence(history, cutoff, week, report);

        Ok(TrainedModels {
            trend: trend.model,
            residual: residual.model,
            sequence,
        })
    }

    fn retrain_sequence(
        &mut self,
        history: &[FeatureRow],
        cutoff: Cutoff,
        week: &WeekWindow,
        report: &mut CycleReport,
    ) -> SequenceAvailability {
        let config = &self.settings.engine.sequence;
        if let Some(reason) = SequenceAvailability::runtime_check(config) {
            report.record(Stage::RetrainSequence, StageOutcome::Skipped(reason.to_string()));
            return SequenceAvailability::Unavailable(reason);
        }
        match self.trainer.retrain_sequence(history, cutoff) {
            Ok(trained) => {
                if let Err(e) = self.models.save_sequence(&trained.model) {
                    warn!("⚠️ Failed saving sequence artifact: {}", e);
                }
                self.log_training(week, trained.report);
                report.record(Stage::RetrainSequence, StageOutcome::Completed);
                SequenceAvailability::Available(trained.model)
            }
            Err(e) => {
                report.record(Stage::RetrainSequence, StageOutcome::Failed(e.to_string()));
                // a previous artifact is usable only if it predates the cutoff
                match self.models.load_sequence(config) {
                    SequenceAvailability::Available(model) if model.respects(cutoff) => {
                        info!("📂 Using previous sequence artifact trained until {}", model.trained_until);
                        SequenceAvailability::Available(model)
                    }
                    SequenceAvailability::Available(_) => SequenceAvailability::Unavailable(
                        UnavailableReason::TrainingFailed(e.to_string()),
                    ),
                    unavailable => unavailable,
                }
            }
        }
    }

    fn log_training(&self, week: &WeekWindow, report: TrainingReport) {
        let record = TrainingRecord {
            recorded_at: Self::now(),
            week_start: week.week_start,
            report,
        };
        if let Err(e) = self.models.append_training_record(record) {
            warn!("⚠️ Failed appending training history: {}", e);
        }
    }

    fn forecast(
        &self,
        pipeline: &FeaturePipeline,
        history: &[FeatureRow],
        models: &TrainedModels,
        week: &WeekWindow,
        weights: &EnsembleWeights,
    ) -> Result<Vec<CombinedForecast>> {
        let future = pipeline.prepare_future(history, week.start_instant(), WeekWindow::HOURS)?;
        let trend = models.trend.predict(&future)?;
        let bound: BoundFeatures = models.residual.bind(pipeline.contract());
        let residual = models.residual.predict(&future, &bound)?;

        let sequence = match &models.sequence {
            SequenceAvailability::Available(model) => {
                let context = model.config.sequence_length.min(history.len());
                let mut batch = history[history.len() - context..].to_vec();
                batch.extend(future.iter().cloned());
                let out = model.predict(&batch)?;
                Some(SequenceOutput {
                    values: out.values[context..].to_vec(),
                })
            }
            SequenceAvailability::Unavailable(reason) => {
                info!("🔀 Sequence component unavailable ({}), using 2-model ensemble", reason);
                None
            }
        };

        Ok(self
            .combiner
            .combine(&trend, &residual, sequence.as_ref(), weights)?)
    }

    fn export(&self, week: &WeekWindow, weights: &EnsembleWeights, mode: Option<CombinationMode>) -> Result<()> {
        let model_type = match mode {
            Some(m) => format!("ensemble_{}", m),
            None => "ensemble".to_string(),
        };
        let document = build_export(
            &*self.store,
            week,
            weights,
            &model_type,
            self.settings.export.history_weeks,
            Self::now(),
        )?;
        write_export(&self.settings.export.output_path, &document)
    }

    /// Run the identical cycle for each listed week, oldest first
    pub fn backfill(&mut self, dates: &[NaiveDate]) -> Result<Vec<CycleReport>> {
        let weeks: BTreeSet<NaiveDate> = dates
            .iter()
            .map(|d| WeekWindow::containing(*d).week_start)
            .collect();
        info!("🔁 Backfilling {} weeks", weeks.len());
        let mut reports = Vec::with_capacity(weeks.len());
        for week_start in weeks {
            reports.push(self.run(week_start)?);
        }
        Ok(reports)
    }

    /// Weeks after the last forecast week, up to the one containing `today`,
    /// that have no forecast
    pub fn missing_weeks(&self, today: NaiveDate) -> Result<Vec<NaiveDate>> {
        let current = WeekWindow::containing(today);
        let existing: BTreeSet<NaiveDate> = self.store.forecast_weeks()?.into_iter().collect();
        let Some(last) = existing.iter().next_back().copied() else {
            return Ok(vec![current.week_start]);
        };
        let mut missing = Vec::new();
        let mut week = WeekWindow::containing(last).next();
        while week.week_start <= current.week_start {
            if !existing.contains(&week.week_start) {
                missing.push(week.week_start);
            }
            week = week.next();
        }
        Ok(missing)
    }

    /// Backfill every missing week up to today
    pub fn catch_up(&mut self, today: NaiveDate) -> Result<Vec<CycleReport>> {
        let missing = self.missing_weeks(today)?;
        if missing.is_empty() {
            info!("✅ No missing weeks up to {}", today);
            return Ok(Vec::new());
        }
        info!("🔁 Catching up {} missing weeks: {:?}", missing.len(), missing);
        self.backfill(&missing)
    }
}

/// Store rows for a combined forecast
pub fn to_records(week: &WeekWindow, combined: &[CombinedForecast]) -> Vec<ForecastRecord> {
    combined
        .iter()
        .map(|c| ForecastRecord {
            week_start: week.week_start,
            week_end: week.week_end,
            forecast_datetime: c.timestamp,
            predicted_price: c.predicted,
            trend_component: c.trend,
            residual_component: c.residual,
            sequence_component: c.sequence,
            lower_bound: c.lower,
            upper_bound: c.upper,
            mode: c.mode,
            actual_price: None,
            absolute_error: None,
            percentage_error: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_fatality() {
        assert!(!Stage::ReconcilePrevious.is_fatal());
        assert!(Stage::RetrainTrend.is_fatal());
        assert!(Stage::RetrainResidual.is_fatal());
        assert!(!Stage::RetrainSequence.is_fatal());
        assert!(Stage::ForecastCurrent.is_fatal());
        assert!(Stage::Persist.is_fatal());
        assert!(!Stage::Export.is_fatal());
    }

    #[test]
    fn test_report_outcomes() {
        let week = WeekWindow::containing(NaiveDate::from_ymd_opt(2026, 1, 7).unwrap());
        let mut report = CycleReport::new(week);
        report.record(Stage::ReconcilePrevious, StageOutcome::Skipped("no actuals".into()));
        assert!(!report.completed());
        report.record(Stage::Done, StageOutcome::Completed);
        assert!(report.completed());
        assert_eq!(
            report.outcome(Stage::ReconcilePrevious),
            Some(&StageOutcome::Skipped("no actuals".into()))
        );
        assert_eq!(Stage::RetrainSequence.to_string(), "RETRAIN_SEQUENCE");
    }
}

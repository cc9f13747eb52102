//! ML Persistence - Artefactos de modelos, pesos del ensemble e historial
//!
//! Todo vive en JSON bajo `<data_dir>/models/`. Las escrituras pasan por un
//! archivo temporal y un rename para no dejar artefactos a medias.

use crate::error::{ForecastError, Result};
use crate::ml_engine::ensemble::{EnsembleConfig, EnsembleWeights};
use crate::ml_engine::models::{
    ResidualBoostModel, SequenceAvailability, SequenceConfig, SequenceModel,
    TrendSeasonalityModel, UnavailableReason,
};
use crate::ml_engine::training::TrainingReport;
use chrono::{NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TREND_FILE: &str = "trend_model.json";
pub const RESIDUAL_FILE: &str = "residual_model.json";
pub const SEQUENCE_FILE: &str = "sequence_model.json";
pub const WEIGHTS_FILE: &str = "ensemble_weights.json";
pub const WEIGHTS_HISTORY_FILE: &str = "ensemble_weights_history.json";
pub const TRAINING_HISTORY_FILE: &str = "training_history.json";
/// Registros de entrenamiento conservados
pub const MAX_TRAINING_RECORDS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub recorded_at: NaiveDateTime,
    pub week_start: NaiveDate,
    pub report: TrainingReport,
}

/// Manager de artefactos del ML
#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
}

impl ModelStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let models_dir = data_dir.as_ref().join("models");
        fs::create_dir_all(&models_dir)?;
        Ok(Self { models_dir })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.models_dir.join(file)
    }

    fn save_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.path(file);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        info!("💾 Saved {}", path.display());
        Ok(())
    }

    fn load_json<T: DeserializeOwned>(&self, component: &str, file: &str) -> Result<T> {
        let path = self.path(file);
        if !path.exists() {
            return Err(ForecastError::ModelArtifactMissing {
                component: component.to_string(),
                path: path.display().to_string(),
            });
        }
        let json = fs::read_to_string(&path)?;
        let value = serde_json::from_str(&json)?;
        info!("📂 Loaded {}", path.display());
        Ok(value)
    }

    pub fn save_trend(&self, model: &TrendSeasonalityModel) -> Result<()> {
        self.save_json(TREND_FILE, model)
    }

    pub fn save_residual(&self, model: &ResidualBoostModel) -> Result<()> {
        self.save_json(RESIDUAL_FILE, model)
    }

    pub fn save_sequence(&self, model: &SequenceModel) -> Result<()> {
        self.save_json(SEQUENCE_FILE, model)
    }

    /// Detección de capacidad: runtime, configuración y artefacto
    pub fn load_sequence(&self, config: &SequenceConfig) -> SequenceAvailability {
        if let Some(reason) = SequenceAvailability::runtime_check(config) {
            return SequenceAvailability::Unavailable(reason);
        }
        match self.load_json::<SequenceModel>("sequence", SEQUENCE_FILE) {
            Ok(model) => SequenceAvailability::Available(model),
            Err(ForecastError::ModelArtifactMissing { path, .. }) => {
                SequenceAvailability::Unavailable(UnavailableReason::ArtifactMissing(path))
            }
            Err(e) => SequenceAvailability::Unavailable(UnavailableReason::ArtifactUnreadable(e.to_string())),
        }
    }

    /// Pesos vigentes; los iniciales de configuración si no hay archivo
    pub fn load_weights(&self, config: &EnsembleConfig) -> EnsembleWeights {
        match self.load_json::<EnsembleWeights>("ensemble_weights", WEIGHTS_FILE) {
            Ok(weights) => {
                info!(
                    "📂 Ensemble weights v{}: trend={:.3} residual={:.3} sequence={:.3}",
                    weights.version, weights.trend, weights.residual, weights.sequence
                );
                weights
            }
            Err(ForecastError::ModelArtifactMissing { .. }) => {
                info!("📂 No ensemble weights found, starting from configured weights");
                EnsembleWeights::from_config(config)
            }
            Err(e) => {
                warn!("⚠️ Ensemble weights unreadable ({}), starting from configured weights", e);
                EnsembleWeights::from_config(config)
            }
        }
    }

    pub fn save_weights(&self, weights: &EnsembleWeights) -> Result<()> {
        self.save_json(WEIGHTS_FILE, weights)
    }

    /// Pesos por semana de origen, ordenados por semana
    pub fn weights_history(&self) -> Vec<EnsembleWeights> {
        match self.load_json("ensemble_weights_history", WEIGHTS_HISTORY_FILE) {
            Ok(history) => history,
            Err(ForecastError::ModelArtifactMissing { .. }) => Vec::new(),
            Err(e) => {
                warn!("⚠️ Ensemble weights history unreadable ({}), starting a new one", e);
                Vec::new()
            }
        }
    }

    /// Pesos con la mayor versión registrada, en el historial o vigentes
    pub fn latest_weights(&self, config: &EnsembleConfig) -> EnsembleWeights {
        let current = self.load_weights(config);
        self.weights_history()
            .into_iter()
            .filter(|w| w.version > current.version)
            .max_by_key(|w| w.version)
            .unwrap_or(current)
    }

    /// Pesos para pronosticar la semana que empieza en `week_start`: los
    /// derivados de la última semana reconciliada anterior a ella, o los
    /// iniciales de configuración
    pub fn weights_as_of(&self, week_start: NaiveDate, config: &EnsembleConfig) -> EnsembleWeights {
        let mut candidates = self.weights_history();
        if candidates.is_empty() {
            candidates.push(self.load_weights(config));
        }
        match candidates
            .into_iter()
            .filter(|w| w.source_week.map_or(false, |s| s < week_start))
            .max_by_key(|w| w.source_week)
        {
            Some(weights) => weights,
            None => {
                info!("📂 No ensemble weights before {}, using configured weights", week_start);
                EnsembleWeights::from_config(config)
            }
        }
    }

    /// Registrar los pesos derivados de una semana reconciliada.
    ///
    /// Si la semana ya tiene pesos iguales se conserva el registro existente.
    /// `ensemble_weights.json` solo avanza hacia semanas más recientes.
    pub fn record_weights(&self, weights: EnsembleWeights) -> Result<EnsembleWeights> {
        let week = weights.source_week;
        let mut history = self.weights_history();
        if let Some(existing) = history.iter().find(|w| w.source_week == week) {
            if existing.same_weights(&weights) {
                debug!("Ensemble weights for {:?} unchanged, keeping v{}", week, existing.version);
                return Ok(existing.clone());
            }
        }
        history.retain(|w| w.source_week != week);
        history.push(weights.clone());
        history.sort_by_key(|w| w.source_week);
        self.save_json(WEIGHTS_HISTORY_FILE, &history)?;

        if history.last().map(|w| w.source_week) == Some(week) {
            self.save_weights(&weights)?;
        } else {
            info!("📂 Weights for past week {:?} stored in history only", week);
        }
        Ok(weights)
    }

    /// Guardar métricas de entrenamiento
    pub fn append_training_record(&self, record: TrainingRecord) -> Result<()> {
        let mut history = self.load_training_history().unwrap_or_else(|e| {
            warn!("⚠️ Training history unreadable ({}), starting a new one", e);
            Vec::new()
        });
        history.push(record);

        // se conservan los MAX_TRAINING_RECORDS más recientes
        if history.len() > MAX_TRAINING_RECORDS {
            let excess = history.len() - MAX_TRAINING_RECORDS;
            history.drain(..excess);
        }
        self.save_json(TRAINING_HISTORY_FILE, &history)
    }

    /// Cargar historial de entrenamiento
    pub fn load_training_history(&self) -> Result<Vec<TrainingRecord>> {
        match self.load_json("training_history", TRAINING_HISTORY_FILE) {
            Ok(history) => Ok(history),
            Err(ForecastError::ModelArtifactMissing { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::ensemble::ComponentMetric;
    use crate::types::{ComponentKind, Cutoff};
    use tempfile::TempDir;

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    fn record(i: i64) -> TrainingRecord {
        let cutoff = Cutoff::from_date(week());
        TrainingRecord {
            recorded_at: cutoff.instant() + chrono::Duration::minutes(i),
            week_start: week(),
            report: TrainingReport {
                component: ComponentKind::Trend,
                cutoff,
                trained_until: cutoff.instant() - chrono::Duration::hours(1),
                train_rows: 100,
                holdout_rows: 0,
                holdout: None,
                validation: ComponentMetric::Available(50.0),
            },
        }
    }

    #[test]
    fn test_weights_default_then_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        let config = EnsembleConfig::default();

        let initial = store.load_weights(&config);
        assert_eq!(initial.version, 0);
        assert!(initial.is_normalized());

        let mut next = initial.clone();
        next.version = 5;
        next.source_week = Some(week());
        store.save_weights(&next).unwrap();
        assert_eq!(store.load_weights(&config), next);
    }

    #[test]
    fn test_missing_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        assert!(store.weights_history().is_empty());
        let availability = store.load_sequence(&SequenceConfig::default());
        if cfg!(feature = "sequence-model") {
            assert!(matches!(
                availability,
                SequenceAvailability::Unavailable(UnavailableReason::ArtifactMissing(_))
            ));
        }
        let disabled = SequenceConfig {
            enabled: false,
            ..SequenceConfig::default()
        };
        assert!(store.load_sequence(&disabled).model().is_none());
    }

    #[test]
    fn test_unreadable_sequence_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        fs::write(store.models_dir().join(SEQUENCE_FILE), "{not json").unwrap();
        if cfg!(feature = "sequence-model") {
            assert!(matches!(
                store.load_sequence(&SequenceConfig::default()),
                SequenceAvailability::Unavailable(UnavailableReason::ArtifactUnreadable(_))
            ));
        }
    }

    #[test]
    fn test_training_history_is_capped() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        for i in 0..105 {
            store.append_training_record(record(i)).unwrap();
        }
        let history = store.load_training_history().unwrap();
        assert_eq!(history.len(), MAX_TRAINING_RECORDS);
        assert_eq!(history[0], record(5));
    }

    fn weights_for(week_start: NaiveDate, version: u64, trend: f64) -> EnsembleWeights {
        let mut weights = EnsembleWeights {
            trend,
            residual: 1.0 - trend,
            sequence: 0.0,
            version,
            updated_at: None,
            source_week: Some(week_start),
        };
        weights.normalize();
        weights
    }

    #[test]
    fn test_weights_as_of_ignores_later_weeks() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        let config = EnsembleConfig::default();
        let w1 = week();
        let w2 = w1 + chrono::Duration::days(7);

        store.record_weights(weights_for(w1, 1, 0.4)).unwrap();
        store.record_weights(weights_for(w2, 2, 0.6)).unwrap();

        assert_eq!(store.weights_as_of(w1, &config), EnsembleWeights::from_config(&config));
        assert_eq!(store.weights_as_of(w2, &config).source_week, Some(w1));
        assert_eq!(store.weights_as_of(w2 + chrono::Duration::days(7), &config).version, 2);
        assert_eq!(store.latest_weights(&config).version, 2);
    }

    #[test]
    fn test_past_week_weights_keep_current_file() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        let config = EnsembleConfig::default();
        let w1 = week();
        let w2 = w1 + chrono::Duration::days(7);

        store.record_weights(weights_for(w2, 1, 0.6)).unwrap();
        store.record_weights(weights_for(w1, 2, 0.4)).unwrap();

        let current = store.load_weights(&config);
        assert_eq!(current.source_week, Some(w2));
        assert_eq!(current.version, 1);
        assert_eq!(store.weights_history().len(), 2);
    }

    #[test]
    fn test_identical_weights_keep_version() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path()).unwrap();
        let config = EnsembleConfig::default();

        let first = store.record_weights(weights_for(week(), 1, 0.4)).unwrap();
        let again = store.record_weights(weights_for(week(), 2, 0.4)).unwrap();
        assert_eq!(again, first);
        assert_eq!(store.load_weights(&config).version, 1);

        let changed = store.record_weights(weights_for(week(), 3, 0.5)).unwrap();
        assert_eq!(changed.version, 3);
        assert_eq!(store.weights_history().len(), 1);
    }
}

//! Error taxonomy for the forecasting core.
//!
//! Domain operations return [`ForecastError`]; orchestration and I/O layers wrap
//! it in `anyhow` with context.

use chrono::NaiveDateTime;
use thiserror::Error;

/// Result type alias for forecasting operations.
pub type Result<T> = std::result::Result<T, ForecastError>;

/// Errors raised by the feature pipeline, the models and reconciliation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    /// No rows exist in the requested range.
    #[error("no {what} available in [{start}, {end})")]
    DataUnavailable {
        what: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    /// Raw input was empty where at least one row is required.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Inference features diverge from the training-time contract.
    #[error("feature mismatch, missing: {}", missing.join(", "))]
    FeatureMismatch { missing: Vec<String> },

    /// An optional model artifact is absent.
    #[error("{component} artifact missing at {path}")]
    ModelArtifactMissing { component: String, path: String },

    /// A trained artifact saw rows at or after its cutoff.
    #[error("training data reaches {trained_until}, cutoff is {cutoff}")]
    LeakageViolation {
        trained_until: NaiveDateTime,
        cutoff: NaiveDateTime,
    },

    /// Not enough rows to fit or score.
    #[error("insufficient history: need at least {needed}, got {got}")]
    InsufficientHistory { needed: usize, got: usize },

    /// Linear algebra or optimisation produced unusable numbers.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage read/write problem.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for ForecastError {
    fn from(err: std::io::Error) -> Self {
        ForecastError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for ForecastError {
    fn from(err: serde_json::Error) -> Self {
        ForecastError::Persistence(err.to_string())
    }
}

impl From<csv::Error> for ForecastError {
    fn from(err: csv::Error) -> Self {
        ForecastError::Persistence(err.to_string())
    }
}

impl ForecastError {
    /// Non-fatal errors let the weekly cycle continue with reduced capability.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ForecastError::DataUnavailable { .. } | ForecastError::ModelArtifactMissing { .. }
        )
    }
}

//! Error metrics for forecast evaluation.
//!
//! One threshold policy for percentage errors everywhere: a percentage error
//! only exists when the actual price exceeds the low-price threshold, and a
//! set with no qualifying row reports [`MAPE_UNDEFINED`].

use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};

/// MAPE reported when no actual price exceeds the threshold.
pub const MAPE_UNDEFINED: f64 = 0.0;

/// MAE / RMSE / MAPE over a set of matched pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub mape: f64,
    /// Rows that contributed to the MAPE
    pub mape_rows: usize,
    pub count: usize,
}

/// Percentage error, or `None` at or below the threshold.
pub fn percentage_error(actual: f64, predicted: f64, threshold: f64) -> Option<f64> {
    if actual > threshold {
        Some((actual - predicted).abs() / actual * 100.0)
    } else {
        None
    }
}

/// Compute metrics between actual and predicted values.
pub fn evaluate(actual: &[f64], predicted: &[f64], threshold: f64) -> Result<ErrorMetrics> {
    if actual.is_empty() {
        return Err(ForecastError::EmptyInput("metric input".to_string()));
    }
    if actual.len() != predicted.len() {
        return Err(ForecastError::NumericalFailure(format!(
            "metric length mismatch: {} actual vs {} predicted",
            actual.len(),
            predicted.len()
        )));
    }

    let n = actual.len() as f64;
    let mae = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / n;
    let rmse = (actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();

    let pct: Vec<f64> = actual
        .iter()
        .zip(predicted)
        .filter_map(|(a, p)| percentage_error(*a, *p, threshold))
        .collect();
    let mape = if pct.is_empty() {
        MAPE_UNDEFINED
    } else {
        pct.iter().sum::<f64>() / pct.len() as f64
    };

    Ok(ErrorMetrics {
        mae,
        rmse,
        mape,
        mape_rows: pct.len(),
        count: actual.len(),
    })
}

/// Mean absolute error, `None` for empty input.
pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return None;
    }
    Some(
        actual
            .iter()
            .zip(predicted)
            .map(|(a, p)| (a - p).abs())
            .sum::<f64>()
            / actual.len() as f64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn metrics_basic() {
        let actual = [200.0, 400.0, 50.0];
        let predicted = [220.0, 380.0, 60.0];
        let m = evaluate(&actual, &predicted, 100.0).unwrap();
        assert_relative_eq!(m.mae, 50.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.rmse, ((400.0 + 400.0 + 100.0) / 3.0_f64).sqrt(), epsilon = 1e-12);
        // 50 is below the threshold
        assert_eq!(m.mape_rows, 2);
        assert_relative_eq!(m.mape, (10.0 + 5.0) / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn mape_undefined_when_all_below_threshold() {
        let m = evaluate(&[90.0, 100.0], &[80.0, 120.0], 100.0).unwrap();
        assert_eq!(m.mape, MAPE_UNDEFINED);
        assert_eq!(m.mape_rows, 0);
        assert_relative_eq!(m.mae, 15.0);
    }

    #[test]
    fn rejects_empty_and_mismatched() {
        assert!(evaluate(&[], &[], 100.0).is_err());
        assert!(evaluate(&[1.0], &[1.0, 2.0], 100.0).is_err());
        assert_eq!(mean_absolute_error(&[], &[]), None);
    }
}

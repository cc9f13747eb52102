//! Ridge regression via Cholesky on the normal equations.
//!
//! Shared by the trend model (per-column MAP penalties) and the sequence
//! model readout.

use crate::error::{ForecastError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Jitter added to the diagonal so unpenalised columns stay solvable.
const DIAGONAL_JITTER: f64 = 1e-8;

/// Solve `(XᵀX + diag(penalties)) β = Xᵀy`.
///
/// `penalties` has one entry per column of `x`.
pub fn ridge_solve(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    penalties: &[f64],
) -> Result<Array1<f64>> {
    let (n, p) = x.dim();
    if n == 0 || p == 0 {
        return Err(ForecastError::EmptyInput("design matrix".to_string()));
    }
    if y.len() != n || penalties.len() != p {
        return Err(ForecastError::NumericalFailure(format!(
            "shape mismatch: X is {}x{}, y has {}, {} penalties",
            n,
            p,
            y.len(),
            penalties.len()
        )));
    }

    let mut gram: Array2<f64> = x.t().dot(&x);
    for (j, penalty) in penalties.iter().enumerate() {
        gram[[j, j]] += penalty + DIAGONAL_JITTER;
    }
    let rhs: Array1<f64> = x.t().dot(&y);

    solve_symmetric(&gram, &rhs)
        .ok_or_else(|| ForecastError::NumericalFailure("normal equations not positive definite".to_string()))
}

/// Cholesky solve of a symmetric positive-definite system.
pub fn solve_symmetric(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    if n == 0 || a.dim() != (n, n) {
        return None;
    }

    // A = L Lᵀ
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    // L z = b
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[[i, j]] * z[j];
        }
        z[i] = sum / l[[i, i]];
    }

    // Lᵀ x = z
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = z[i];
        for j in (i + 1)..n {
            sum -= l[[j, i]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }

    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn recovers_exact_linear_fit() {
        // y = 2 + 3x
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![2.0, 5.0, 8.0, 11.0];
        let beta = ridge_solve(x.view(), y.view(), &[0.0, 0.0]).unwrap();
        assert_relative_eq!(beta[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(beta[1], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn penalty_shrinks_coefficient() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![2.0, 5.0, 8.0, 11.0];
        let free = ridge_solve(x.view(), y.view(), &[0.0, 0.0]).unwrap();
        let shrunk = ridge_solve(x.view(), y.view(), &[0.0, 100.0]).unwrap();
        assert!(shrunk[1].abs() < free[1].abs());
    }

    #[test]
    fn rejects_shape_mismatch() {
        let x = array![[1.0, 0.0], [1.0, 1.0]];
        let y = array![1.0, 2.0, 3.0];
        assert!(ridge_solve(x.view(), y.view(), &[0.0, 0.0]).is_err());
    }

    #[test]
    fn solve_symmetric_rejects_indefinite() {
        let a = array![[0.0, 1.0], [1.0, 0.0]];
        let b = array![1.0, 1.0];
        assert!(solve_symmetric(&a, &b).is_none());
    }
}

//! Linear least squares on dense design matrices
//!
//! Two solvers are provided:
//! - [`least_squares`]: ordinary least squares through an SVD, refusing
//!   rank-deficient designs instead of returning an arbitrary minimum-norm fit.
//! - [`weighted_ridge`]: weighted least squares with a small ridge penalty,
//!   solved through a Cholesky factorisation of the normal equations.

use crate::{MathError, Result};
use nalgebra::{DMatrix, DVector};

/// Relative tolerance used to decide the numerical rank of a design
const RANK_TOLERANCE: f64 = 1e-10;

/// Result of a least-squares fit
#[derive(Debug, Clone, PartialEq)]
pub struct LeastSquaresFit {
    /// Fitted coefficients, one per design column
    pub coefficients: Vec<f64>,
    /// Fitted values for each design row
    pub fitted: Vec<f64>,
    /// Observed minus fitted
    pub residuals: Vec<f64>,
}

impl LeastSquaresFit {
    /// Evaluate the fit on a new design row
    pub fn predict(&self, row: &[f64]) -> Result<f64> {
        if row.len() != self.coefficients.len() {
            return Err(MathError::InvalidInput(format!(
                "Design row has {} columns, model has {}",
                row.len(),
                self.coefficients.len()
            )));
        }

        Ok(row
            .iter()
            .zip(self.coefficients.iter())
            .map(|(x, b)| x * b)
            .sum())
    }

    /// Residual standard deviation with `n - p` degrees of freedom.
    ///
    /// Returns 0.0 when there are no spare degrees of freedom.
    pub fn residual_std(&self) -> f64 {
        crate::stats::residual_std(&self.residuals, self.coefficients.len())
    }
}

fn design_matrix(rows: &[Vec<f64>], y: &[f64]) -> Result<(DMatrix<f64>, DVector<f64>)> {
    if rows.is_empty() {
        return Err(MathError::InsufficientData(
            "Design matrix has no rows".to_string(),
        ));
    }

    if rows.len() != y.len() {
        return Err(MathError::InvalidInput(format!(
            "Design has {} rows but response has {} values",
            rows.len(),
            y.len()
        )));
    }

    let cols = rows[0].len();
    if cols == 0 || rows.iter().any(|r| r.len() != cols) {
        return Err(MathError::InvalidInput(
            "Design rows must be non-empty and equally sized".to_string(),
        ));
    }

    if rows.iter().flatten().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(MathError::InvalidInput(
            "Design and response must be finite".to_string(),
        ));
    }

    let x = DMatrix::from_fn(rows.len(), cols, |i, j| rows[i][j]);
    let y = DVector::from_column_slice(y);
    Ok((x, y))
}

fn finish(x: &DMatrix<f64>, y: &DVector<f64>, beta: DVector<f64>) -> Result<LeastSquaresFit> {
    if beta.iter().any(|b| !b.is_finite()) {
        return Err(MathError::CalculationError(
            "Solver produced non-finite coefficients".to_string(),
        ));
    }

    let fitted = x * &beta;
    let residuals = y - &fitted;

    Ok(LeastSquaresFit {
        coefficients: beta.iter().copied().collect(),
        fitted: fitted.iter().copied().collect(),
        residuals: residuals.iter().copied().collect(),
    })
}

/// Ordinary least squares.
///
/// Fails with [`MathError::Singular`] when the design does not have full
/// column rank, which includes the case of fewer rows than columns.
pub fn least_squares(rows: &[Vec<f64>], y: &[f64]) -> Result<LeastSquaresFit> {
    let (x, yv) = design_matrix(rows, y)?;
    let cols = x.ncols();

    if x.nrows() < cols {
        return Err(MathError::Singular(format!(
            "{} observations cannot determine {} coefficients",
            x.nrows(),
            cols
        )));
    }

    let svd = x.clone().svd(true, true);
    let max_sv = svd.singular_values.max();
    let tolerance = max_sv * RANK_TOLERANCE * (x.nrows().max(cols) as f64);

    if max_sv <= 0.0 || svd.rank(tolerance) < cols {
        return Err(MathError::Singular(
            "Design matrix is rank deficient".to_string(),
        ));
    }

    let beta = svd
        .solve(&yv, tolerance)
        .map_err(|e| MathError::CalculationError(e.to_string()))?;

    finish(&x, &yv, beta)
}

/// Weighted least squares with an L2 penalty `lambda` on every coefficient.
///
/// A positive `lambda` keeps the normal equations positive definite, so the
/// fit succeeds for short series with more columns than observations.
pub fn weighted_ridge(
    rows: &[Vec<f64>],
    y: &[f64],
    weights: &[f64],
    lambda: f64,
) -> Result<LeastSquaresFit> {
    let (x, yv) = design_matrix(rows, y)?;

    if weights.len() != rows.len() {
        return Err(MathError::InvalidInput(format!(
            "Expected {} weights, got {}",
            rows.len(),
            weights.len()
        )));
    }

    if lambda < 0.0 || !lambda.is_finite() {
        return Err(MathError::InvalidInput(
            "Ridge penalty must be a non-negative finite number".to_string(),
        ));
    }

    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(MathError::InvalidInput(
            "Weights must be non-negative and finite".to_string(),
        ));
    }

    let sqrt_w: Vec<f64> = weights.iter().map(|w| w.sqrt()).collect();
    let xw = DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)] * sqrt_w[i]);
    let yw = DVector::from_fn(yv.len(), |i, _| yv[i] * sqrt_w[i]);

    let xt = xw.transpose();
    let mut normal = &xt * &xw;
    for j in 0..normal.ncols() {
        normal[(j, j)] += lambda;
    }
    let rhs = &xt * &yw;

    let cholesky = normal.cholesky().ok_or_else(|| {
        MathError::Singular("Normal equations are not positive definite".to_string())
    })?;
    let beta = cholesky.solve(&rhs);

    finish(&x, &yv, beta)
}

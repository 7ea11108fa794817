//! Design-matrix rows for trend and seasonality regressors

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Polynomial trend row `[1, t, t^2, ..., t^degree]`
pub fn polynomial_row(t: f64, degree: usize) -> Vec<f64> {
    let mut row = Vec::with_capacity(degree + 1);
    let mut term = 1.0;
    for _ in 0..=degree {
        row.push(term);
        term *= t;
    }
    row
}

/// Fourier seasonality terms for position `t` in a cycle of length `period`.
///
/// Produces `[sin(2πt/P), cos(2πt/P), ..., sin(2πkt/P), cos(2πkt/P)]` for
/// `k = 1..=order`; an order of zero yields an empty row.
pub fn fourier_row(t: f64, period: f64, order: usize) -> Vec<f64> {
    let mut row = Vec::with_capacity(order * 2);
    for k in 1..=order {
        let angle = 2.0 * PI * k as f64 * t / period;
        row.push(angle.sin());
        row.push(angle.cos());
    }
    row
}

/// Min-max scaling parameters for a regressor, so that large period indices
/// do not blow up higher polynomial powers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    /// Value mapped to 0.0
    pub offset: f64,
    /// Width mapped to 1.0
    pub span: f64,
}

impl Scale {
    /// Build the scale covering `values`; a degenerate range maps to span 1.0
    pub fn covering(values: &[f64]) -> Self {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        if !min.is_finite() || !max.is_finite() || (max - min).abs() < f64::EPSILON {
            return Self {
                offset: if min.is_finite() { min } else { 0.0 },
                span: 1.0,
            };
        }

        Self {
            offset: min,
            span: max - min,
        }
    }

    /// Map a raw value into the scaled space
    pub fn apply(&self, value: f64) -> f64 {
        (value - self.offset) / self.span
    }
}

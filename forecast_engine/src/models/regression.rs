//! Regression decomposition, the secondary tier
//!
//! Polynomial trend (quadratic once enough points exist) plus optional
//! per-calendar-month seasonal offsets taken as the mean residual of each
//! month. The band comes from the in-sample residual spread.

use super::{band_margin, ForecastPoint};
use crate::config::TierConfig;
use crate::data::EntitySeries;
use crate::error::{ForecastError, Result};
use crate::period::Month;
use serde::{Deserialize, Serialize};
use series_math::design::{polynomial_row, Scale};
use series_math::{least_squares, stats, MathError};

/// Fitted parameters of the regression decomposition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionFit {
    pub origin: Month,
    pub time_scale: Scale,
    pub degree: usize,
    pub trend: Vec<f64>,
    /// Offsets indexed by calendar month (January first), when seasonal terms were fitted
    pub seasonal: Option<Vec<f64>>,
    pub sigma: f64,
    pub z: f64,
    pub observations: usize,
    pub accuracy: Option<f64>,
}

impl RegressionFit {
    fn estimate(&self, period: Month) -> f64 {
        let row = polynomial_row(self.time_scale.apply(period.ordinal() as f64), self.degree);
        let trend: f64 = row.iter().zip(self.trend.iter()).map(|(x, b)| x * b).sum();
        let offset = self
            .seasonal
            .as_ref()
            .and_then(|s| s.get(period.month() as usize - 1))
            .copied()
            .unwrap_or(0.0);
        trend + offset
    }

    pub fn project(&self, horizon: usize) -> Result<Vec<ForecastPoint>> {
        (0..horizon)
            .map(|step| {
                let period = self.origin.offset(step as i64);
                let estimate = self.estimate(period);
                let margin = band_margin(self.z, self.sigma, step + 1, self.observations);
                ForecastPoint::bounded(period, estimate, estimate - margin, estimate + margin)
            })
            .collect()
    }
}

/// Fit the secondary tier.
///
/// Constant series and singular designs are [`ForecastError::DegenerateFit`].
pub fn fit_regression(
    series: &EntitySeries,
    config: &TierConfig,
    z: f64,
) -> Result<RegressionFit> {
    let usable = series.usable_points();
    let n = usable.len();
    if n < 2 {
        return Err(ForecastError::DegenerateFit(format!(
            "regression needs two usable points, {} has {}",
            series.entity_id(),
            n
        )));
    }

    let y: Vec<f64> = usable.iter().map(|p| p.value).collect();
    let mean = stats::mean(&y).unwrap_or(0.0);
    let variance = stats::variance(&y).unwrap_or(0.0);
    if variance <= 1e-12 * mean.powi(2).max(1.0) {
        return Err(ForecastError::DegenerateFit(format!(
            "series {} is constant",
            series.entity_id()
        )));
    }

    let degree = if n >= config.quadratic_min_points { 2 } else { 1 };
    let ordinals: Vec<f64> = usable.iter().map(|p| p.period.ordinal() as f64).collect();
    let time_scale = Scale::covering(&ordinals);
    let rows: Vec<Vec<f64>> = ordinals
        .iter()
        .map(|&t| polynomial_row(time_scale.apply(t), degree))
        .collect();

    let fit = least_squares(&rows, &y).map_err(|e| match e {
        MathError::Singular(msg) => ForecastError::DegenerateFit(msg),
        other => ForecastError::DegenerateFit(other.to_string()),
    })?;

    let mut params = fit.coefficients.len();
    let seasonal = if n >= config.seasonal_min_points {
        let mut sums = [0.0; 12];
        let mut counts = [0usize; 12];
        for (point, residual) in usable.iter().zip(fit.residuals.iter()) {
            let idx = point.period.month() as usize - 1;
            sums[idx] += residual;
            counts[idx] += 1;
        }
        params += counts.iter().filter(|&&c| c > 0).count();
        Some(
            sums.iter()
                .zip(counts.iter())
                .map(|(s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
                .collect::<Vec<f64>>(),
        )
    } else {
        None
    };

    let mut model = RegressionFit {
        origin: series.forecast_origin(),
        time_scale,
        degree,
        trend: fit.coefficients,
        seasonal,
        sigma: 0.0,
        z,
        observations: n,
        accuracy: None,
    };

    let fitted: Vec<f64> = usable.iter().map(|p| model.estimate(p.period)).collect();
    if fitted.iter().any(|v| !v.is_finite()) {
        return Err(ForecastError::DegenerateFit(format!(
            "regression for {} produced non-finite values",
            series.entity_id()
        )));
    }
    let residuals: Vec<f64> = y.iter().zip(fitted.iter()).map(|(a, f)| a - f).collect();

    model.sigma = stats::residual_std(&residuals, params);
    model.accuracy = stats::mape(&y, &fitted);
    Ok(model)
}

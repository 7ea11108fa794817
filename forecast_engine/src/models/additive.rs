//! Additive trend + yearly seasonality model, the built-in primary engine
//!
//! The series is decomposed as `y(t) = a + b·t + Σ Fourier_k(month)`, with
//! the Fourier order growing with sample size. Coefficients come from
//! iteratively reweighted ridge least squares with Huber weights, so a few
//! extreme months do not drag the trend. Every reweighting iteration is a
//! cancellation checkpoint.

use super::{band_margin, FittedModel, ForecastPoint, PrimaryEngine, PrimaryRequest};
use crate::config::AdditiveConfig;
use crate::error::{ForecastError, Result};
use crate::guard::AttemptContext;
use crate::period::Month;
use serde::{Deserialize, Serialize};
use series_math::design::{fourier_row, Scale};
use series_math::{stats, weighted_ridge, LeastSquaresFit};
use tracing::trace;

const YEAR: f64 = 12.0;

/// Fitted parameters of the additive model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditiveFit {
    pub origin: Month,
    pub time_scale: Scale,
    pub fourier_order: usize,
    pub coefficients: Vec<f64>,
    /// Residual standard deviation
    pub sigma: f64,
    pub z: f64,
    pub observations: usize,
    pub iterations: usize,
    pub accuracy: Option<f64>,
}

impl AdditiveFit {
    fn estimate(&self, period: Month) -> f64 {
        design_row(&self.time_scale, self.fourier_order, period)
            .iter()
            .zip(self.coefficients.iter())
            .map(|(x, b)| x * b)
            .sum()
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

/// Seasonal detail the sample size can support
fn fourier_order(observations: usize) -> usize {
    match observations {
        0..=5 => 0,
        6..=11 => 1,
        _ => 2,
    }
}

fn design_row(scale: &Scale, order: usize, period: Month) -> Vec<f64> {
    let mut row = vec![1.0, scale.apply(period.ordinal() as f64)];
    row.extend(fourier_row((period.month() - 1) as f64, YEAR, order));
    row
}

/// Built-in primary engine
#[derive(Debug, Clone, Default)]
pub struct AdditiveEngine {
    config: AdditiveConfig,
}

impl AdditiveEngine {
    pub fn new(config: AdditiveConfig) -> Self {
        Self { config }
    }

    pub fn fit_request(
        &self,
        request: &PrimaryRequest,
        ctx: &AttemptContext,
    ) -> Result<AdditiveFit> {
        let z = stats::z_for_confidence(request.confidence_level)?;
        let usable = request.series.usable_points();
        let n = usable.len();
        if n < 2 {
            return Err(ForecastError::InsufficientData(format!(
                "additive model needs two usable points, {} has {}",
                request.key, n
            )));
        }

        let order = fourier_order(n);
        let ordinals: Vec<f64> = usable.iter().map(|p| p.period.ordinal() as f64).collect();
        let time_scale = Scale::covering(&ordinals);
        let rows: Vec<Vec<f64>> = usable
            .iter()
            .map(|p| design_row(&time_scale, order, p.period))
            .collect();
        let y: Vec<f64> = usable.iter().map(|p| p.value).collect();

        let mut weights = vec![1.0; n];
        let mut best: Option<LeastSquaresFit> = None;
        let mut iterations = 0;

        for iteration in 1..=self.config.max_iterations {
            ctx.checkpoint()?;

            let fit = weighted_ridge(&rows, &y, &weights, self.config.ridge)?;
            iterations = iteration;

            let converged = match &best {
                Some(prev) => {
                    max_relative_change(&prev.coefficients, &fit.coefficients)
                        < self.config.tolerance
                }
                None => false,
            };
            let scale = stats::robust_scale(&fit.residuals).unwrap_or(0.0);

            if !converged && scale > f64::EPSILON {
                let threshold = self.config.huber_k * scale;
                weights = fit
                    .residuals
                    .iter()
                    .map(|r| {
                        let r = r.abs();
                        if r <= threshold {
                            1.0
                        } else {
                            threshold / r
                        }
                    })
                    .collect();
            }

            let done = converged || scale <= f64::EPSILON;
            best = Some(fit);
            if done {
                break;
            }
        }

        let fit = best.ok_or_else(|| {
            ForecastError::ForecastingError("reweighting loop did not run".to_string())
        })?;

        if fit.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ForecastError::DegenerateFit(
                "additive coefficients are not finite".to_string(),
            ));
        }

        let sigma = stats::residual_std(&fit.residuals, fit.coefficients.len());
        trace!(entity = %request.key, n, order, iterations, sigma, "additive fit");

        Ok(AdditiveFit {
            origin: request.series.forecast_origin(),
            time_scale,
            fourier_order: order,
            coefficients: fit.coefficients,
            sigma,
            z,
            observations: n,
            iterations,
            accuracy: stats::mape(&y, &fit.fitted),
        })
    }
}

fn max_relative_change(previous: &[f64], current: &[f64]) -> f64 {
    previous
        .iter()
        .zip(current.iter())
        .map(|(p, c)| (c - p).abs() / (1.0 + p.abs()))
        .fold(0.0, f64::max)
}

impl PrimaryEngine for AdditiveEngine {
    fn name(&self) -> &str {
        "additive"
    }

    fn fit(&self, request: &PrimaryRequest, ctx: &AttemptContext) -> Result<FittedModel> {
        Ok(FittedModel::Additive(self.fit_request(request, ctx)?))
    }
}

//! Forecasting models for monthly entity series

use crate::data::{EntityKey, EntitySeries, SeriesPoint};
use crate::error::{ForecastError, Result};
use crate::guard::AttemptContext;
use crate::period::Month;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

pub mod additive;
pub mod external;
pub mod regression;
pub mod trend;

pub use additive::{AdditiveEngine, AdditiveFit};
pub use external::{CommandEngine, SnapshotFit};
pub use regression::RegressionFit;
pub use trend::TrendFit;

/// One forecast month with its band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub period: Month,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ForecastPoint {
    /// Build a point from a raw estimate and band.
    ///
    /// The estimate must be finite. The value and both bounds are clamped to
    /// be non-negative, a non-finite bound collapses onto the value, and the
    /// result always satisfies `lower <= value <= upper`.
    pub fn bounded(period: Month, estimate: f64, lower: f64, upper: f64) -> Result<Self> {
        if !estimate.is_finite() {
            return Err(ForecastError::DegenerateFit(format!(
                "non-finite estimate for {}",
                period
            )));
        }

        let value = estimate.max(0.0);
        let lower = if lower.is_finite() {
            lower.min(value).max(0.0)
        } else {
            value
        };
        let upper = if upper.is_finite() {
            upper.max(value)
        } else {
            value
        };

        Ok(Self {
            period,
            value,
            lower,
            upper,
        })
    }
}

/// Half-width of a normal band `step` periods ahead of `n` observations
pub(crate) fn band_margin(z: f64, sigma: f64, step: usize, n: usize) -> f64 {
    z * sigma * (1.0 + step as f64 / n.max(1) as f64).sqrt()
}

/// Which tier produced a forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodTag {
    Primary,
    Secondary,
    Fallback,
}

impl fmt::Display for MethodTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodTag::Primary => "primary",
            MethodTag::Secondary => "secondary",
            MethodTag::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// Serialisable parameters of a trained tier.
///
/// Projection is deterministic, so a cached payload reproduces the forecast
/// it was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedModel {
    Additive(AdditiveFit),
    Regression(RegressionFit),
    Trend(TrendFit),
    Snapshot(SnapshotFit),
}

impl FittedModel {
    /// Forecast `horizon` months starting at the model's origin
    pub fn project(&self, horizon: usize) -> Result<Vec<ForecastPoint>> {
        match self {
            FittedModel::Additive(fit) => fit.project(horizon),
            FittedModel::Regression(fit) => fit.project(horizon),
            FittedModel::Trend(fit) => fit.project(horizon),
            FittedModel::Snapshot(fit) => fit.project(horizon),
        }
    }

    /// In-sample MAPE in percent, when it could be computed
    pub fn accuracy(&self) -> Option<f64> {
        match self {
            FittedModel::Additive(fit) => fit.accuracy,
            FittedModel::Regression(fit) => fit.accuracy,
            FittedModel::Trend(_) => None,
            FittedModel::Snapshot(fit) => fit.accuracy,
        }
    }

    /// First forecast month
    pub fn origin(&self) -> Month {
        match self {
            FittedModel::Additive(fit) => fit.origin,
            FittedModel::Regression(fit) => fit.origin,
            FittedModel::Trend(fit) => fit.origin,
            FittedModel::Snapshot(fit) => fit.origin,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FittedModel::Additive(_) => "additive",
            FittedModel::Regression(_) => "regression",
            FittedModel::Trend(_) => "trend",
            FittedModel::Snapshot(_) => "snapshot",
        }
    }
}

/// Forecast for one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastResult {
    pub key: EntityKey,
    pub historical: Vec<SeriesPoint>,
    pub forecast: Vec<ForecastPoint>,
    pub method: MethodTag,
    pub accuracy: Option<f64>,
    pub from_cache: bool,
}

impl ForecastResult {
    pub fn entity_id(&self) -> &str {
        &self.key.entity_id
    }

    /// Sum of the forecast values
    pub fn forecast_total(&self) -> f64 {
        self.forecast.iter().map(|p| p.value).sum()
    }

    /// Sum of the last `window` historical months, ignoring missing months
    pub fn trailing_total(&self, window: usize) -> f64 {
        let skip = self.historical.len().saturating_sub(window);
        self.historical
            .iter()
            .skip(skip)
            .map(|p| p.value)
            .filter(|v| v.is_finite())
            .sum()
    }
}

/// Everything a primary engine needs for one entity
#[derive(Debug, Clone)]
pub struct PrimaryRequest {
    pub key: EntityKey,
    pub series: EntitySeries,
    pub horizon: usize,
    pub confidence_level: f64,
}

/// The pluggable first tier.
///
/// Implementations run inside the execution guard: long computations should
/// call [`AttemptContext::checkpoint`] regularly, and external processes must
/// be started through [`AttemptContext::spawn`] so they can be reclaimed.
pub trait PrimaryEngine: Send + Sync + Debug {
    /// Name of the engine
    fn name(&self) -> &str;

    /// Fit the series and return a payload able to project the horizon
    fn fit(&self, request: &PrimaryRequest, ctx: &AttemptContext) -> Result<FittedModel>;
}

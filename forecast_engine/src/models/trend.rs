//! Trend extrapolation, the last-resort tier
//!
//! A line through the last two usable points; a single point is carried
//! flat. The band is a fixed fraction of the estimate.

use super::ForecastPoint;
use crate::data::EntitySeries;
use crate::error::{ForecastError, Result};
use crate::period::Month;
use serde::{Deserialize, Serialize};
use series_math::TrendLine;

/// Relative half-width of the fallback band
pub const FALLBACK_BAND: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendFit {
    pub origin: Month,
    /// Last usable month
    pub anchor: Month,
    /// Line value at the anchor
    pub level: f64,
    /// Change per month
    pub slope: f64,
    pub observations: usize,
}

impl TrendFit {
    pub fn project(&self, horizon: usize) -> Result<Vec<ForecastPoint>> {
        (0..horizon)
            .map(|step| {
                let period = self.origin.offset(step as i64);
                let months_ahead = (period.ordinal() - self.anchor.ordinal()) as f64;
                let estimate = self.level + self.slope * months_ahead;
                let margin = FALLBACK_BAND * estimate.abs();
                ForecastPoint::bounded(period, estimate, estimate - margin, estimate + margin)
            })
            .collect()
    }
}

/// Fit the tertiary tier; fails only when there is no usable point
pub fn fit_trend(series: &EntitySeries) -> Result<TrendFit> {
    let usable = series.usable_points();
    let tail: Vec<(f64, f64)> = usable
        .iter()
        .rev()
        .take(2)
        .rev()
        .map(|p| (p.period.ordinal() as f64, p.value))
        .collect();

    let anchor = usable.last().map(|p| p.period).ok_or_else(|| {
        ForecastError::InsufficientData(format!(
            "{} has no usable points",
            series.entity_id()
        ))
    })?;

    let line = TrendLine::from_points(2, &tail)?;
    let level = line.value_at(anchor.ordinal() as f64)?;
    let slope = line.slope()?;

    Ok(TrendFit {
        origin: series.forecast_origin(),
        anchor,
        level,
        slope,
        observations: usable.len(),
    })
}

//! Tiered forecaster: primary -> secondary -> tertiary
//!
//! Each tier is tried in turn until one produces a forecast. Every hand-over
//! is recorded with the reason that triggered it.

use crate::config::TierConfig;
use crate::data::{EntityKey, EntitySeries};
use crate::decision::DecisionReason;
use crate::error::{ForecastError, Result};
use crate::guard::{AttemptOutcome, CrashReason, ExecutionGuard};
use crate::models::regression::fit_regression;
use crate::models::trend::fit_trend;
use crate::models::{FittedModel, ForecastPoint, MethodTag, PrimaryEngine, PrimaryRequest};
use series_math::stats;
use std::sync::Arc;
use tracing::{debug, info};

/// One step of the fallback chain
#[derive(Debug, Clone, PartialEq)]
pub struct TierEvent {
    pub tier: MethodTag,
    pub reason: DecisionReason,
}

/// The tier that served an entity and how it got there
#[derive(Debug, Clone)]
pub struct TierResolution {
    pub method: MethodTag,
    pub model: FittedModel,
    pub forecast: Vec<ForecastPoint>,
    pub events: Vec<TierEvent>,
}

enum TierState {
    Primary,
    Secondary,
    Tertiary,
    Terminal(MethodTag, FittedModel, Vec<ForecastPoint>),
}

#[derive(Debug, Clone)]
pub struct TieredForecaster {
    primary: Arc<dyn PrimaryEngine>,
    guard: ExecutionGuard,
    config: TierConfig,
    z: f64,
}

impl TieredForecaster {
    pub fn new(
        primary: Arc<dyn PrimaryEngine>,
        guard: ExecutionGuard,
        config: TierConfig,
    ) -> Result<Self> {
        let z = stats::z_for_confidence(config.confidence_level)
            .map_err(|e| ForecastError::InvalidParameter(e.to_string()))?;
        Ok(Self {
            primary,
            guard,
            config,
            z,
        })
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    /// Forecast `horizon` months for one entity.
    ///
    /// Only an entity without a single usable point fails, with
    /// [`ForecastError::InsufficientData`].
    pub fn resolve(
        &self,
        key: &EntityKey,
        series: &EntitySeries,
        horizon: usize,
    ) -> Result<TierResolution> {
        let usable = series.usable_count();
        if usable == 0 {
            return Err(ForecastError::InsufficientData(format!(
                "{} has no usable points",
                key
            )));
        }

        let mut events = Vec::new();
        let mut state = if usable >= self.config.primary_min_points {
            TierState::Primary
        } else {
            events.push(TierEvent {
                tier: MethodTag::Primary,
                reason: DecisionReason::InsufficientData {
                    usable,
                    required: self.config.primary_min_points,
                },
            });
            TierState::Tertiary
        };

        loop {
            state = match state {
                TierState::Primary => match self.attempt_primary(key, series, horizon) {
                    Ok((model, forecast)) => {
                        TierState::Terminal(MethodTag::Primary, model, forecast)
                    }
                    Err(reason) => {
                        events.push(TierEvent {
                            tier: MethodTag::Primary,
                            reason,
                        });
                        TierState::Secondary
                    }
                },
                TierState::Secondary => match self.attempt_secondary(series, horizon) {
                    Ok((model, forecast)) => {
                        TierState::Terminal(MethodTag::Secondary, model, forecast)
                    }
                    Err(e) => {
                        debug!(entity = %key, error = %e, "secondary tier failed");
                        events.push(TierEvent {
                            tier: MethodTag::Secondary,
                            reason: DecisionReason::SecondaryFailed {
                                detail: e.to_string(),
                            },
                        });
                        TierState::Tertiary
                    }
                },
                TierState::Tertiary => {
                    let model = FittedModel::Trend(fit_trend(series)?);
                    let forecast = model.project(horizon)?;
                    TierState::Terminal(MethodTag::Fallback, model, forecast)
                }
                TierState::Terminal(method, model, forecast) => {
                    events.push(TierEvent {
                        tier: method,
                        reason: DecisionReason::Served {
                            method,
                            cached: false,
                        },
                    });
                    info!(entity = %key, %method, model = model.kind(), "forecast resolved");
                    return Ok(TierResolution {
                        method,
                        model,
                        forecast,
                        events,
                    });
                }
            };
        }
    }

    fn attempt_primary(
        &self,
        key: &EntityKey,
        series: &EntitySeries,
        horizon: usize,
    ) -> std::result::Result<(FittedModel, Vec<ForecastPoint>), DecisionReason> {
        let request = PrimaryRequest {
            key: key.clone(),
            series: series.clone(),
            horizon,
            confidence_level: self.config.confidence_level,
        };
        let engine = Arc::clone(&self.primary);
        let label = format!("{}-{}", engine.name(), key);

        let outcome = self
            .guard
            .run(&label, move |ctx| engine.fit(&request, ctx));

        match outcome {
            AttemptOutcome::Completed(model) => match model.project(horizon) {
                Ok(forecast) => Ok((model, forecast)),
                Err(e) => Err(DecisionReason::PrimaryFailed {
                    detail: e.to_string(),
                }),
            },
            AttemptOutcome::TimedOut { elapsed } => Err(DecisionReason::PrimaryTimedOut {
                elapsed_ms: elapsed.as_millis() as u64,
            }),
            AttemptOutcome::Crashed(CrashReason::Failed(detail)) => {
                Err(DecisionReason::PrimaryFailed { detail })
            }
            AttemptOutcome::Crashed(reason) => Err(DecisionReason::PrimaryCrashed {
                detail: reason.to_string(),
            }),
        }
    }

    fn attempt_secondary(
        &self,
        series: &EntitySeries,
        horizon: usize,
    ) -> Result<(FittedModel, Vec<ForecastPoint>)> {
        let model = FittedModel::Regression(fit_regression(series, &self.config, self.z)?);
        let forecast = model.project(horizon)?;
        Ok((model, forecast))
    }
}

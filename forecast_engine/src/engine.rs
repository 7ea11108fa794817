//! Forecast pass orchestration
//!
//! raw records -> quality gate -> monthly series per entity -> fingerprint
//! cache -> tiered forecaster (primary under the execution guard) ->
//! aggregator.

use crate::aggregate::{aggregate, ScopeReport};
use crate::config::{EngineConfig, PrimaryConfig};
use crate::data::{EntityKey, EntitySeries, ScopeInput, Transaction};
use crate::decision::{DecisionEntry, DecisionLog, DecisionReason};
use crate::error::{ForecastError, Result};
use crate::fingerprint::{decide, CacheDecision, Fingerprint};
use crate::guard::ExecutionGuard;
use crate::models::{AdditiveEngine, CommandEngine, ForecastResult, MethodTag, PrimaryEngine};
use crate::period::Month;
use crate::quality::{QualityGate, RejectionLedger};
use crate::registry::{ModelRecord, ModelRegistry};
use crate::tiers::TieredForecaster;
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, info_span, warn};

/// One forecasting pass
#[derive(Debug, Clone)]
pub struct ForecastRequest {
    pub scopes: Vec<ScopeInput>,
    pub top_n: usize,
    /// Months to forecast
    pub horizon: usize,
    pub force_retrain: bool,
    /// Anchor date: series run through the month before it and the forecast
    /// starts at its month
    pub as_of: Option<NaiveDate>,
}

impl ForecastRequest {
    pub fn new(scopes: Vec<ScopeInput>, top_n: usize, horizon: usize) -> Self {
        Self {
            scopes,
            top_n,
            horizon,
            force_retrain: false,
            as_of: None,
        }
    }

    /// Company and region scopes from a transaction batch
    pub fn from_transactions(
        transactions: &[Transaction],
        top_n: usize,
        horizon: usize,
    ) -> Self {
        Self::new(Transaction::split_scopes(transactions), top_n, horizon)
    }

    pub fn with_force_retrain(mut self, force_retrain: bool) -> Self {
        self.force_retrain = force_retrain;
        self
    }

    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self
    }

    /// Malformed requests fail the whole pass
    pub fn validate(&self) -> Result<()> {
        if self.scopes.is_empty() {
            return Err(ForecastError::ValidationError(
                "request has no scopes".to_string(),
            ));
        }
        if self.top_n == 0 || self.horizon == 0 {
            return Err(ForecastError::ValidationError(format!(
                "top_n and horizon must be positive, got {} and {}",
                self.top_n, self.horizon
            )));
        }

        let mut names = HashSet::new();
        for scope in &self.scopes {
            if scope.name.trim().is_empty() {
                return Err(ForecastError::ValidationError(
                    "scope name is blank".to_string(),
                ));
            }
            if !names.insert(scope.name.as_str()) {
                return Err(ForecastError::ValidationError(format!(
                    "scope {} appears twice",
                    scope.name
                )));
            }
            if scope.records.is_empty() {
                return Err(ForecastError::ValidationError(format!(
                    "scope {} has no records",
                    scope.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub generated_at: DateTime<Utc>,
    pub horizon: usize,
    pub top_n: usize,
    pub force_retrain: bool,
    pub cache_hits: usize,
    pub retrained: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastResponse {
    pub scopes: BTreeMap<String, ScopeReport>,
    pub decisions: DecisionLog,
    pub quality: BTreeMap<String, RejectionLedger>,
    pub metadata: ResponseMetadata,
}

impl ForecastResponse {
    /// Forecast for one entity, if it was served
    pub fn forecast(&self, key: &EntityKey) -> Option<&ForecastResult> {
        self.scopes
            .get(&key.scope)?
            .forecasts
            .iter()
            .find(|r| &r.key == key)
    }
}

struct EntityOutcome {
    result: Option<ForecastResult>,
    decisions: Vec<DecisionEntry>,
}

/// The orchestration engine
pub struct ForecastEngine {
    config: EngineConfig,
    gate: QualityGate,
    forecaster: TieredForecaster,
    registry: Arc<ModelRegistry>,
    pool: Option<rayon::ThreadPool>,
}

impl ForecastEngine {
    /// Engine with the primary tier named by the configuration
    pub fn new(config: EngineConfig) -> Result<Self> {
        let primary: Arc<dyn PrimaryEngine> = match &config.primary {
            PrimaryConfig::Additive(additive) => Arc::new(AdditiveEngine::new(additive.clone())),
            PrimaryConfig::Command { program, args } => Arc::new(
                CommandEngine::new(program.clone(), args.clone())
                    .with_poll_interval(config.guard.poll_interval()),
            ),
        };
        Self::with_primary(config, primary)
    }

    /// Engine with a caller-supplied primary tier
    pub fn with_primary(config: EngineConfig, primary: Arc<dyn PrimaryEngine>) -> Result<Self> {
        config.validate()?;

        let guard = ExecutionGuard::new(&config.guard);
        let forecaster = TieredForecaster::new(primary, guard, config.tiers.clone())?;

        let pool = if config.workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.workers)
                    .thread_name(|i| format!("forecast-worker-{}", i))
                    .build()
                    .map_err(|e| ForecastError::ConfigError(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(Self {
            gate: QualityGate::new(config.quality.clone()),
            config,
            forecaster,
            registry: Arc::new(ModelRegistry::new()),
            pool,
        })
    }

    /// Share a registry, e.g. one restored from a snapshot
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one pass.
    ///
    /// Fails only on a malformed request or when the quality gate rejects
    /// every record of every scope. A scope with nothing left keeps its
    /// ledger in `quality` but gets no report; per-entity failures are
    /// logged and skipped.
    pub fn run(&self, request: &ForecastRequest) -> Result<ForecastResponse> {
        request.validate()?;
        let generated_at = Utc::now();
        let through = request.as_of.map(|d| Month::from_date(d).pred());

        let mut decisions = DecisionLog::new();
        let mut quality = BTreeMap::new();
        let mut scopes = BTreeMap::new();

        for scope in &request.scopes {
            let span = info_span!("scope", scope = %scope.name);
            let _entered = span.enter();

            let (table, ledger) = match self.gate.inspect(&scope.records)? {
                (Some(table), ledger) => (table, ledger),
                (None, ledger) => {
                    warn!(
                        total = ledger.counts.total,
                        "quality gate rejected every record, scope skipped"
                    );
                    quality.insert(scope.name.clone(), ledger);
                    continue;
                }
            };
            let series = table.monthly_series(self.config.quality.gap_policy, through)?;
            info!(entities = series.len(), "series built");

            let jobs: Vec<(EntityKey, EntitySeries)> = series
                .into_iter()
                .map(|s| (EntityKey::new(&scope.name, s.entity_id()), s))
                .collect();

            let outcomes: Vec<EntityOutcome> = match &self.pool {
                Some(pool) => pool.install(|| {
                    jobs.par_iter()
                        .map(|(key, series)| self.forecast_entity(key, series, request))
                        .collect()
                }),
                None => jobs
                    .iter()
                    .map(|(key, series)| self.forecast_entity(key, series, request))
                    .collect(),
            };

            let mut results = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                decisions.extend(outcome.decisions);
                results.extend(outcome.result);
            }

            let report = aggregate(
                &scope.name,
                &results,
                request.top_n,
                &self.config.aggregate,
                &ledger.counts,
                generated_at,
            );
            scopes.insert(scope.name.clone(), report);
            quality.insert(scope.name.clone(), ledger);
        }

        if scopes.is_empty() {
            let total = request.scopes.iter().map(|s| s.records.len()).sum();
            warn!(total, "quality gate rejected every record of the request");
            return Err(ForecastError::AllRejected { total });
        }

        decisions.sort_by_entity();

        let metadata = ResponseMetadata {
            generated_at,
            horizon: request.horizon,
            top_n: request.top_n,
            force_retrain: request.force_retrain,
            cache_hits: decisions.cache_hits(),
            retrained: decisions.retrains(),
        };
        info!(
            scopes = scopes.len(),
            cache_hits = metadata.cache_hits,
            retrained = metadata.retrained,
            "forecast pass finished"
        );

        Ok(ForecastResponse {
            scopes,
            decisions,
            quality,
            metadata,
        })
    }

    fn forecast_entity(
        &self,
        key: &EntityKey,
        series: &EntitySeries,
        request: &ForecastRequest,
    ) -> EntityOutcome {
        let mut decisions = Vec::new();

        if series.usable_count() == 0 {
            warn!(entity = %key, "no usable points, entity skipped");
            decisions.push(DecisionEntry::new(key, None, DecisionReason::NoData));
            return EntityOutcome {
                result: None,
                decisions,
            };
        }

        let slot = self.registry.slot(key);
        let mut record = slot.lock();
        let fingerprint = Fingerprint::of(series);

        match decide(series, record.as_ref(), request.force_retrain) {
            CacheDecision::Reuse => {
                if let Some(prior) = record.as_ref() {
                    match prior.model.project(request.horizon) {
                        Ok(forecast) => {
                            decisions.push(DecisionEntry::new(
                                key,
                                Some(prior.method),
                                DecisionReason::CacheHit {
                                    fingerprint: fingerprint.clone(),
                                },
                            ));
                            decisions.push(DecisionEntry::new(
                                key,
                                Some(prior.method),
                                DecisionReason::Served {
                                    method: prior.method,
                                    cached: true,
                                },
                            ));
                            info!(entity = %key, method = %prior.method, "served from cache");
                            return EntityOutcome {
                                result: Some(ForecastResult {
                                    key: key.clone(),
                                    historical: series.points().to_vec(),
                                    forecast,
                                    method: prior.method,
                                    accuracy: prior.accuracy,
                                    from_cache: true,
                                }),
                                decisions,
                            };
                        }
                        Err(e) => {
                            info!(entity = %key, error = %e, "cached model cannot cover horizon");
                            decisions.push(DecisionEntry::new(
                                key,
                                Some(prior.method),
                                DecisionReason::CacheCannotCoverHorizon {
                                    horizon: request.horizon,
                                },
                            ));
                        }
                    }
                }
            }
            CacheDecision::Retrain(reason) => {
                info!(entity = %key, %reason, "retraining");
                decisions.push(DecisionEntry::new(
                    key,
                    None,
                    DecisionReason::Retrain { reason },
                ));
            }
        }

        match self.forecaster.resolve(key, series, request.horizon) {
            Ok(resolution) => {
                decisions.extend(
                    resolution
                        .events
                        .into_iter()
                        .map(|event| DecisionEntry::new(key, Some(event.tier), event.reason)),
                );

                let accuracy = resolution.model.accuracy();
                *record = Some(ModelRecord {
                    key: key.clone(),
                    fingerprint,
                    method: resolution.method,
                    model: resolution.model,
                    accuracy,
                    trained_at: Utc::now(),
                });

                EntityOutcome {
                    result: Some(ForecastResult {
                        key: key.clone(),
                        historical: series.points().to_vec(),
                        forecast: resolution.forecast,
                        method: resolution.method,
                        accuracy,
                        from_cache: false,
                    }),
                    decisions,
                }
            }
            Err(e) => {
                warn!(entity = %key, error = %e, "entity could not be forecast");
                decisions.push(DecisionEntry::new(key, None, DecisionReason::NoData));
                EntityOutcome {
                    result: None,
                    decisions,
                }
            }
        }
    }
}

impl std::fmt::Debug for ForecastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastEngine")
            .field("config", &self.config)
            .field("forecaster", &self.forecaster)
            .field("models", &self.registry.len())
            .finish()
    }
}

/// Which tier served each entity of a response, for quick inspection
pub fn methods_by_entity(response: &ForecastResponse) -> BTreeMap<EntityKey, MethodTag> {
    response
        .scopes
        .values()
        .flat_map(|report| report.forecasts.iter())
        .map(|r| (r.key.clone(), r.method))
        .collect()
}

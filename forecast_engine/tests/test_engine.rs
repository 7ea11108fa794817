use chrono::NaiveDate;
use forecast_engine::config::{AdditiveConfig, EngineConfig, GuardConfig};
use forecast_engine::data::{EntityKey, RawRecord, ScopeInput, Transaction};
use forecast_engine::decision::DecisionReason;
use forecast_engine::engine::{methods_by_entity, ForecastEngine, ForecastRequest};
use forecast_engine::error::{ForecastError, Result};
use forecast_engine::fingerprint::RetrainReason;
use forecast_engine::guard::AttemptContext;
use forecast_engine::models::{
    AdditiveEngine, FittedModel, MethodTag, PrimaryEngine, PrimaryRequest,
};
use forecast_engine::period::Month;
use forecast_engine::quality::RejectReason;
use forecast_engine::registry::ModelRegistry;
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn acme_records() -> Vec<RawRecord> {
    vec![
        RawRecord::new("ACME", "2024-01-15", 100.0),
        RawRecord::new("ACME", "2024-02-15", 120.0),
        RawRecord::new("ACME", "2024-03-15", 90.0),
        RawRecord::new("ACME", "2024-04-15", 130.0),
    ]
}

#[fixture]
fn acme() -> Vec<RawRecord> {
    acme_records()
}

fn company(records: Vec<RawRecord>) -> Vec<ScopeInput> {
    vec![ScopeInput::new("company", records)]
}

fn key(entity: &str) -> EntityKey {
    EntityKey::new("company", entity)
}

fn zero_deadline() -> EngineConfig {
    EngineConfig {
        guard: GuardConfig {
            deadline_ms: 0,
            ..GuardConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// Several entities with distinct shapes over the same twelve months
fn portfolio() -> Vec<RawRecord> {
    let mut records = Vec::new();
    for (e, name) in ["ALPHA", "BETA", "GAMMA", "DELTA", "EPSILON", "ZETA"]
        .iter()
        .enumerate()
    {
        for m in 1..=12u32 {
            let base = 100.0 * (e as f64 + 1.0);
            let value = base + 7.0 * m as f64 + ((m * (e as u32 + 3)) % 5) as f64 * 11.0;
            records.push(RawRecord::new(name, &format!("2023-{:02}-05", m), value));
        }
    }
    records
}

#[rstest]
fn test_single_entity_scenario(acme: Vec<RawRecord>) {
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let response = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();

    let result = response.forecast(&key("ACME")).unwrap();
    assert_eq!(result.forecast.len(), 3);
    assert!(result.forecast.iter().all(|p| p.value >= 0.0));
    assert_eq!(result.forecast[0].period, Month::new(2024, 5).unwrap());
    assert_eq!(result.method, MethodTag::Primary);
    assert!(!result.from_cache);

    let report = &response.scopes["company"];
    assert_eq!(report.metadata.entities, vec!["ACME".to_string()]);
    assert_eq!(report.timeline.len(), 7);
    assert_eq!(report.timeline[3].values["ACME"], 130.0);
    assert!(report.timeline[4].is_current_month);
    assert!(!report.timeline[5].is_current_month);
    assert_eq!(
        report.timeline[4].values["ACME_pred"],
        result.forecast[0].value
    );
    assert_eq!(report.kpis.previous_period_total, 130.0);
    assert_eq!(report.kpis.current_period_predicted, result.forecast[0].value);

    assert_eq!(
        response.decisions.served_by(&key("ACME")),
        Some(MethodTag::Primary)
    );
    assert_eq!(engine.registry().len(), 1);
}

#[rstest]
fn test_bad_timestamp_lands_in_ledger(mut acme: Vec<RawRecord>) {
    acme.push(RawRecord::new("ACME", "15/01/2024", 5000.0));
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let response = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();

    let ledger = &response.quality["company"];
    assert_eq!(ledger.count(RejectReason::DateFormat), 1);
    assert_eq!(ledger.rejections[0].index, 4);

    let result = response.forecast(&key("ACME")).unwrap();
    let history: Vec<f64> = result.historical.iter().map(|p| p.value).collect();
    assert_eq!(history, vec![100.0, 120.0, 90.0, 130.0]);
    assert_eq!(response.scopes["company"].kpis.rejection_rate, 20.0);
}

#[test]
fn test_zero_deadline_routes_by_point_count() {
    let records = vec![
        RawRecord::new("MULTI", "2024-01-10", 100.0),
        RawRecord::new("MULTI", "2024-02-10", 120.0),
        RawRecord::new("MULTI", "2024-03-10", 90.0),
        RawRecord::new("MULTI", "2024-04-10", 130.0),
        RawRecord::new("PAIR", "2024-02-10", 40.0),
        RawRecord::new("PAIR", "2024-04-10", 60.0),
        RawRecord::new("SINGLE", "2024-03-10", 75.0),
    ];
    let engine = ForecastEngine::new(zero_deadline()).unwrap();
    let response = engine.run(&ForecastRequest::new(company(records), 3, 3)).unwrap();

    let methods = methods_by_entity(&response);
    assert_eq!(methods[&key("MULTI")], MethodTag::Secondary);
    assert_eq!(methods[&key("PAIR")], MethodTag::Secondary);
    assert_eq!(methods[&key("SINGLE")], MethodTag::Fallback);

    let timed_out = response
        .decisions
        .for_entity(&key("MULTI"))
        .any(|e| matches!(e.reason, DecisionReason::PrimaryTimedOut { .. }));
    assert!(timed_out);

    for result in response.scopes["company"].forecasts.iter() {
        assert_eq!(result.forecast.len(), 3);
        assert!(result.forecast.iter().all(|p| p.value >= 0.0 && p.lower >= 0.0));
    }
}

#[rstest]
fn test_entity_without_usable_records_is_absent(mut acme: Vec<RawRecord>) {
    acme.push(RawRecord::new("GHOST", "2024-01-15", -10.0));
    acme.push(RawRecord::new("GHOST", "2024-02-15", "n/a"));
    acme.push(RawRecord::new("GHOST", "2024-03-15", 0.0));

    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let response = engine.run(&ForecastRequest::new(company(acme), 5, 3)).unwrap();

    assert!(response.forecast(&key("GHOST")).is_none());
    let report = &response.scopes["company"];
    assert_eq!(report.forecasts.len(), 1);
    assert_eq!(report.metadata.entities, vec!["ACME".to_string()]);
    assert!(report
        .timeline
        .iter()
        .all(|row| row.values.keys().all(|k| !k.starts_with("GHOST"))));
    assert_eq!(response.quality["company"].counts.rejected(), 3);
}

#[rstest]
fn test_second_pass_reuses_models(acme: Vec<RawRecord>) {
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let request = ForecastRequest::new(company(acme), 1, 3);

    let first = engine.run(&request).unwrap();
    let second = engine.run(&request).unwrap();

    let a = first.forecast(&key("ACME")).unwrap();
    let b = second.forecast(&key("ACME")).unwrap();
    assert_eq!(a.forecast, b.forecast);
    assert_eq!(a.method, b.method);
    assert!(b.from_cache);

    assert_eq!(first.metadata.retrained, 1);
    assert_eq!(second.metadata.cache_hits, 1);
    assert_eq!(second.metadata.retrained, 0);
    assert_eq!(
        second.decisions.for_entity(&key("ACME")).last().map(|e| &e.reason),
        Some(&DecisionReason::Served {
            method: MethodTag::Primary,
            cached: true
        })
    );
}

#[rstest]
fn test_force_retrain_bypasses_cache(acme: Vec<RawRecord>) {
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    engine.run(&ForecastRequest::new(company(acme.clone()), 1, 3)).unwrap();

    let forced = ForecastRequest::new(company(acme), 1, 3).with_force_retrain(true);
    let response = engine.run(&forced).unwrap();

    assert_eq!(response.metadata.cache_hits, 0);
    assert!(!response.forecast(&key("ACME")).unwrap().from_cache);
    let acme_key = key("ACME");
    let first = response.decisions.for_entity(&acme_key).next().unwrap();
    assert_eq!(
        first.reason,
        DecisionReason::Retrain {
            reason: RetrainReason::Forced
        }
    );
}

#[rstest]
fn test_changed_data_retrains(mut acme: Vec<RawRecord>) {
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    engine.run(&ForecastRequest::new(company(acme.clone()), 1, 3)).unwrap();
    let previous = engine.registry().get(&key("ACME")).unwrap().fingerprint;

    acme.push(RawRecord::new("ACME", "2024-04-20", 15.0));
    let response = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();

    assert_eq!(response.metadata.retrained, 1);
    assert!(response.decisions.for_entity(&key("ACME")).any(|e| {
        e.reason
            == DecisionReason::Retrain {
                reason: RetrainReason::FingerprintChanged {
                    previous: previous.clone(),
                },
            }
    }));
    assert_ne!(
        engine.registry().get(&key("ACME")).unwrap().fingerprint,
        previous
    );
}

#[test]
fn test_parallel_workers_match_sequential() {
    let sequential = ForecastEngine::new(EngineConfig::default()).unwrap();
    let parallel = ForecastEngine::new(EngineConfig {
        workers: 4,
        ..EngineConfig::default()
    })
    .unwrap();
    let request = ForecastRequest::new(company(portfolio()), 3, 6);

    let a = sequential.run(&request).unwrap();
    let b = parallel.run(&request).unwrap();

    assert_eq!(a.scopes["company"].forecasts, b.scopes["company"].forecasts);
    assert_eq!(a.scopes["company"].timeline, b.scopes["company"].timeline);
    assert_eq!(a.decisions, b.decisions);
    assert_eq!(parallel.registry().len(), 6);
}

#[test]
fn test_decisions_are_grouped_by_entity() {
    let engine = ForecastEngine::new(EngineConfig {
        workers: 3,
        ..EngineConfig::default()
    })
    .unwrap();
    let response = engine
        .run(&ForecastRequest::new(company(portfolio()), 2, 3))
        .unwrap();

    let keys: Vec<&EntityKey> = response.decisions.entries().iter().map(|e| &e.key).collect();
    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(response.scopes["company"].metadata.entities.len(), 2);
}

#[rstest]
fn test_as_of_moves_the_forecast_origin(acme: Vec<RawRecord>) {
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let request = ForecastRequest::new(company(acme), 1, 2)
        .with_as_of(NaiveDate::from_ymd_opt(2024, 7, 10).unwrap());

    let response = engine.run(&request).unwrap();
    let result = response.forecast(&key("ACME")).unwrap();

    assert_eq!(result.historical.len(), 6);
    assert_eq!(result.historical[5].value, 0.0);
    assert_eq!(result.forecast[0].period, Month::new(2024, 7).unwrap());
    assert_eq!(
        response.scopes["company"].metadata.current_month,
        Some(Month::new(2024, 7).unwrap())
    );
}

#[test]
fn test_transactions_feed_company_and_region_scopes() {
    let json = r#"[
        {"NameAlpha": "Acme", "State": "TX", "DateTransactionJulian": "2024-01-15", "Orig_Inv_Ttl_Prod_Value": "100"},
        {"NameAlpha": "Acme", "State": "CA", "DateTransactionJulian": "2024-02-15", "Orig_Inv_Ttl_Prod_Value": 120},
        {"NameAlpha": "Bolt", "State": "TX", "DateTransactionJulian": "2024-02-20", "Orig_Inv_Ttl_Prod_Value": 80.5},
        {"company": "Bolt", "region": "CA", "timestamp": "2024-03-01", "value": 95}
    ]"#;
    let transactions: Vec<Transaction> = serde_json::from_str(json).unwrap();

    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let request = ForecastRequest::from_transactions(&transactions, 5, 2);
    let response = engine.run(&request).unwrap();

    assert_eq!(
        response.scopes.keys().cloned().collect::<Vec<_>>(),
        vec!["company".to_string(), "region".to_string()]
    );
    assert!(response.forecast(&EntityKey::new("company", "ACME")).is_some());
    assert!(response.forecast(&EntityKey::new("company", "BOLT")).is_some());
    assert!(response.forecast(&EntityKey::new("region", "TX")).is_some());
    assert!(response.forecast(&EntityKey::new("region", "CA")).is_some());
}

#[test]
fn test_transactions_without_regions_still_forecast_companies() {
    let json = r#"[
        {"NameAlpha": "Acme", "DateTransactionJulian": "2024-01-15", "Orig_Inv_Ttl_Prod_Value": 100},
        {"NameAlpha": "Acme", "DateTransactionJulian": "2024-02-15", "Orig_Inv_Ttl_Prod_Value": 120},
        {"NameAlpha": "Acme", "DateTransactionJulian": "2024-03-15", "Orig_Inv_Ttl_Prod_Value": 90}
    ]"#;
    let transactions: Vec<Transaction> = serde_json::from_str(json).unwrap();

    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let response = engine
        .run(&ForecastRequest::from_transactions(&transactions, 5, 3))
        .unwrap();

    assert_eq!(
        response.scopes.keys().cloned().collect::<Vec<_>>(),
        vec!["company".to_string()]
    );
    assert_eq!(
        response.forecast(&EntityKey::new("company", "ACME")).unwrap().forecast.len(),
        3
    );

    let region = &response.quality["region"];
    assert_eq!(region.counts.total, 3);
    assert_eq!(region.counts.accepted, 0);
    assert_eq!(region.count(RejectReason::MissingEntity), 3);
    assert_eq!(response.quality["company"].counts.accepted, 3);
}

#[test]
fn test_every_scope_rejected_fails_the_pass() {
    let json = r#"[
        {"NameAlpha": "Acme", "DateTransactionJulian": "15/01/2024", "Orig_Inv_Ttl_Prod_Value": 100},
        {"NameAlpha": "Bolt", "DateTransactionJulian": "2024-02-15", "Orig_Inv_Ttl_Prod_Value": -4}
    ]"#;
    let transactions: Vec<Transaction> = serde_json::from_str(json).unwrap();

    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    assert!(matches!(
        engine.run(&ForecastRequest::from_transactions(&transactions, 5, 3)),
        Err(ForecastError::AllRejected { total: 4 })
    ));
}

#[rstest]
#[case(ForecastRequest::new(Vec::new(), 1, 3))]
#[case(ForecastRequest::new(company(acme_records()), 0, 3))]
#[case(ForecastRequest::new(company(acme_records()), 1, 0))]
#[case(ForecastRequest::new(company(Vec::new()), 1, 3))]
#[case(ForecastRequest::new(
    vec![ScopeInput::new("company", acme_records()), ScopeInput::new("company", acme_records())],
    1,
    3
))]
fn test_malformed_requests_fail_the_pass(#[case] request: ForecastRequest) {
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    assert!(matches!(
        engine.run(&request),
        Err(ForecastError::ValidationError(_))
    ));
}

#[test]
fn test_scope_with_nothing_valid_fails_the_pass() {
    let records = vec![
        RawRecord::new("ACME", "2024/01/15", 100.0),
        RawRecord::new("", "2024-01-15", 100.0),
    ];
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();

    assert!(matches!(
        engine.run(&ForecastRequest::new(company(records), 1, 3)),
        Err(ForecastError::AllRejected { total: 2 })
    ));
}

#[rstest]
fn test_response_serializes_timeline_keys(acme: Vec<RawRecord>) {
    let engine = ForecastEngine::new(EngineConfig::default()).unwrap();
    let response = engine.run(&ForecastRequest::new(company(acme), 1, 2)).unwrap();

    let value = serde_json::to_value(&response).unwrap();
    let timeline = &value["scopes"]["company"]["timeline"];
    assert_eq!(timeline[0]["label"], "Jan 2024");
    assert_eq!(timeline[0]["isHistorical"], true);
    assert_eq!(timeline[0]["ACME"], 100.0);
    assert!(timeline[4]["ACME_pred"].is_number());
    assert_eq!(timeline[4]["isCurrentMonth"], true);

    let decisions = value["decisions"].as_array().unwrap();
    assert_eq!(decisions[0]["event"], "retrain");
    assert_eq!(decisions[0]["reason"]["cause"], "no_prior_model");
}

#[cfg(unix)]
mod command_engine {
    use super::*;
    use pretty_assertions::assert_eq;
    use forecast_engine::config::PrimaryConfig;

    fn shell(script: &str) -> EngineConfig {
        EngineConfig {
            primary: PrimaryConfig::Command {
                program: "sh".into(),
                args: vec!["-c".to_string(), script.to_string()],
            },
            ..EngineConfig::default()
        }
    }

    const THREE_POINTS: &str = r#"printf '{"points":[{"value":10},{"value":11,"lower":9,"upper":13},{"value":12}],"accuracy":4.5}' > "$FORECAST_OUTPUT""#;

    #[rstest]
    fn test_external_engine_serves_primary(acme: Vec<RawRecord>) {
        let engine = ForecastEngine::new(shell(THREE_POINTS)).unwrap();
        let response = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();

        let result = response.forecast(&key("ACME")).unwrap();
        assert_eq!(result.method, MethodTag::Primary);
        let values: Vec<f64> = result.forecast.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![10.0, 11.0, 12.0]);
        assert_eq!(result.forecast[1].lower, 9.0);
        assert_eq!(result.forecast[1].upper, 13.0);
        assert_eq!(result.accuracy, Some(4.5));
    }

    const NULL_THIRD_POINT: &str = r#"printf '{"points":[{"value":10},{"value":11},{"value":null}]}' > "$FORECAST_OUTPUT""#;

    #[rstest]
    fn test_bad_point_past_horizon_is_dropped(acme: Vec<RawRecord>) {
        let engine = ForecastEngine::new(shell(NULL_THIRD_POINT)).unwrap();
        let response = engine
            .run(&ForecastRequest::new(company(acme.clone()), 1, 2))
            .unwrap();

        let result = response.forecast(&key("ACME")).unwrap();
        assert_eq!(result.method, MethodTag::Primary);
        let values: Vec<f64> = result.forecast.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![10.0, 11.0]);

        let longer = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();
        let acme_key = key("ACME");
        let first = longer.decisions.for_entity(&acme_key).next().unwrap();
        assert_eq!(first.reason, DecisionReason::CacheCannotCoverHorizon { horizon: 3 });
    }

    #[rstest]
    fn test_bad_point_inside_horizon_fails_primary(acme: Vec<RawRecord>) {
        let engine = ForecastEngine::new(shell(NULL_THIRD_POINT)).unwrap();
        let response = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();

        assert_eq!(
            response.forecast(&key("ACME")).unwrap().method,
            MethodTag::Secondary
        );
    }

    #[rstest]
    fn test_longer_horizon_than_snapshot_retrains(acme: Vec<RawRecord>) {
        let engine = ForecastEngine::new(shell(THREE_POINTS)).unwrap();
        engine
            .run(&ForecastRequest::new(company(acme.clone()), 1, 3))
            .unwrap();

        let response = engine.run(&ForecastRequest::new(company(acme), 1, 5)).unwrap();
        let acme_key = key("ACME");
        let reasons: Vec<&DecisionReason> = response
            .decisions
            .for_entity(&acme_key)
            .map(|e| &e.reason)
            .collect();

        assert_eq!(reasons[0], &DecisionReason::CacheCannotCoverHorizon { horizon: 5 });
        assert_eq!(
            response.forecast(&key("ACME")).unwrap().method,
            MethodTag::Secondary
        );
    }

    #[rstest]
    fn test_crashing_engine_falls_back(acme: Vec<RawRecord>) {
        let engine = ForecastEngine::new(shell("echo 'model exploded' >&2; exit 3")).unwrap();
        let response = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();

        assert_eq!(
            response.forecast(&key("ACME")).unwrap().method,
            MethodTag::Secondary
        );
        let crash = response
            .decisions
            .for_entity(&key("ACME"))
            .find_map(|e| match &e.reason {
                DecisionReason::PrimaryCrashed { detail } => Some(detail.clone()),
                _ => None,
            })
            .unwrap();
        assert!(crash.contains("exited with status 3"));
        assert!(crash.contains("model exploded"));
    }

    #[rstest]
    fn test_hung_engine_is_cut_off(acme: Vec<RawRecord>) {
        let mut config = shell("sleep 30");
        config.guard.deadline_ms = 200;
        let engine = ForecastEngine::new(config).unwrap();

        let started = std::time::Instant::now();
        let response = engine.run(&ForecastRequest::new(company(acme), 1, 3)).unwrap();

        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(
            response.forecast(&key("ACME")).unwrap().method,
            MethodTag::Secondary
        );
    }
}

/// Additive primary that takes its time and counts how often it trains
#[derive(Debug)]
struct CountingEngine {
    inner: AdditiveEngine,
    calls: Arc<AtomicUsize>,
}

impl PrimaryEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    fn fit(&self, request: &PrimaryRequest, ctx: &AttemptContext) -> Result<FittedModel> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        self.inner.fit(request, ctx)
    }
}

#[test]
fn test_shared_registry_trains_an_entity_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ModelRegistry::new());

    let engines: Vec<ForecastEngine> = (0..2)
        .map(|_| {
            let primary = Arc::new(CountingEngine {
                inner: AdditiveEngine::new(AdditiveConfig::default()),
                calls: Arc::clone(&calls),
            });
            ForecastEngine::with_primary(EngineConfig::default(), primary)
                .unwrap()
                .with_registry(Arc::clone(&registry))
        })
        .collect();
    let request = ForecastRequest::new(company(acme_records()), 1, 3);
    let request = &request;

    let responses: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = engines
            .iter()
            .map(|engine| s.spawn(move || engine.run(request).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let retrained: usize = responses.iter().map(|r| r.metadata.retrained).sum();
    let cache_hits: usize = responses.iter().map(|r| r.metadata.cache_hits).sum();
    assert_eq!((retrained, cache_hits), (1, 1));

    let hit = responses
        .iter()
        .find(|r| r.metadata.cache_hits == 1)
        .unwrap();
    assert!(matches!(
        hit.decisions.for_entity(&key("ACME")).next().map(|e| &e.reason),
        Some(DecisionReason::CacheHit { .. })
    ));
    assert_eq!(
        responses[0].forecast(&key("ACME")).unwrap().forecast,
        responses[1].forecast(&key("ACME")).unwrap().forecast
    );

    assert_eq!(registry.len(), 1);
    let record = registry.get(&key("ACME")).unwrap();
    assert_eq!(record.method, MethodTag::Primary);
    assert_eq!(record.model.project(3).unwrap().len(), 3);
}

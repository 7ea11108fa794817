use approx::assert_relative_eq;
use chrono::Utc;
use forecast_engine::aggregate::{aggregate, build_timeline, compute_kpis, rank, PRED_SUFFIX};
use forecast_engine::config::{AggregateConfig, RankingMetric};
use forecast_engine::data::{EntityKey, SeriesPoint};
use forecast_engine::models::{ForecastPoint, ForecastResult, MethodTag};
use forecast_engine::period::Month;
use forecast_engine::quality::RejectionCounts;
use pretty_assertions::assert_eq;

fn month(y: i32, m: u32) -> Month {
    Month::new(y, m).unwrap()
}

/// History from Jan 2024, forecast right after it
fn result(entity: &str, history: &[f64], forecast: &[f64]) -> ForecastResult {
    let start = month(2024, 1);
    let origin = start.offset(history.len() as i64);
    ForecastResult {
        key: EntityKey::new("company", entity),
        historical: history
            .iter()
            .enumerate()
            .map(|(i, &value)| SeriesPoint {
                period: start.offset(i as i64),
                value,
            })
            .collect(),
        forecast: forecast
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                ForecastPoint::bounded(origin.offset(i as i64), v, v * 0.9, v * 1.1).unwrap()
            })
            .collect(),
        method: MethodTag::Secondary,
        accuracy: None,
        from_cache: false,
    }
}

fn counts(total: usize, non_positive: usize) -> RejectionCounts {
    RejectionCounts {
        total,
        accepted: total - non_positive,
        non_positive,
        ..RejectionCounts::default()
    }
}

#[test]
fn test_rank_by_trailing_total() {
    let results = vec![
        result("SMALL", &[10.0, 10.0, 10.0], &[500.0]),
        result("LARGE", &[100.0, 100.0, 100.0], &[1.0]),
        result("MID", &[50.0, 50.0, 50.0], &[1.0]),
    ];

    let ranked = rank(&results, &AggregateConfig::default(), 2);
    let ids: Vec<&str> = ranked.iter().map(|r| r.entity_id()).collect();
    assert_eq!(ids, vec!["LARGE", "MID"]);
}

#[test]
fn test_rank_by_forecast_total() {
    let results = vec![
        result("SMALL", &[10.0], &[500.0]),
        result("LARGE", &[100.0], &[1.0]),
    ];
    let config = AggregateConfig {
        ranking: RankingMetric::ForecastTotal,
        ..AggregateConfig::default()
    };

    let ranked = rank(&results, &config, 1);
    assert_eq!(ranked[0].entity_id(), "SMALL");
}

#[test]
fn test_rank_ties_break_on_entity_id() {
    let results = vec![
        result("ZULU", &[10.0], &[1.0]),
        result("ALPHA", &[10.0], &[1.0]),
        result("MIKE", &[10.0], &[1.0]),
    ];

    let ranked = rank(&results, &AggregateConfig::default(), 3);
    let ids: Vec<&str> = ranked.iter().map(|r| r.entity_id()).collect();
    assert_eq!(ids, vec!["ALPHA", "MIKE", "ZULU"]);
}

#[test]
fn test_trailing_window_ignores_old_history() {
    let config = AggregateConfig {
        ranking_window: 2,
        ..AggregateConfig::default()
    };
    let results = vec![
        result("FADING", &[1000.0, 1.0, 1.0], &[1.0]),
        result("RISING", &[1.0, 20.0, 20.0], &[1.0]),
    ];

    assert_eq!(rank(&results, &config, 1)[0].entity_id(), "RISING");
}

#[test]
fn test_timeline_shape() {
    let history: Vec<f64> = (1..=15).map(|v| v as f64 * 10.0).collect();
    let a = result("ACME", &history, &[200.0, 210.0, 220.0]);
    let b = result("BOLT", &history, &[20.0, 21.0, 22.0]);

    let timeline = build_timeline(&[&a, &b], 12);

    assert_eq!(timeline.len(), 15);
    assert_eq!(timeline[0].period, month(2024, 4));
    assert_eq!(timeline[0].label, "Apr 2024");
    assert_eq!(timeline[0].values["ACME"], 40.0);
    assert!(timeline[..12].iter().all(|r| r.is_historical && !r.is_current_month));

    let current = &timeline[12];
    assert_eq!(current.period, month(2025, 4));
    assert!(current.is_current_month && !current.is_historical);
    assert_eq!(current.values[&format!("ACME{}", PRED_SUFFIX)], 200.0);
    assert_eq!(current.values["BOLT_pred"], 20.0);
    assert!(!timeline[13].is_current_month);
}

#[test]
fn test_timeline_skips_missing_history_values() {
    let a = result("ACME", &[10.0, f64::NAN, 30.0], &[40.0]);

    let timeline = build_timeline(&[&a], 12);

    assert!(!timeline[1].values.contains_key("ACME"));
    assert_eq!(timeline[2].values["ACME"], 30.0);
}

#[test]
fn test_kpis() {
    let a = result("ACME", &[80.0, 100.0], &[110.0, 99.0, 120.0]);
    let b = result("BOLT", &[10.0, 20.0], &[20.0, 11.0, 10.0]);
    let timeline = build_timeline(&[&a, &b], 12);

    let kpis = compute_kpis(&timeline, 2, &counts(8, 1));

    assert_eq!(kpis.previous_period_total, 120.0);
    assert_eq!(kpis.current_period_predicted, 130.0);
    assert_eq!(kpis.next_period_predicted, 110.0);
    assert_eq!(kpis.growth_current_vs_previous, 8.3);
    assert_eq!(kpis.growth_next_vs_current, -15.4);
    assert_eq!(kpis.horizon_total, 370.0);
    assert_relative_eq!(kpis.average_per_period, 370.0 / 3.0, epsilon = 1e-9);
    assert_eq!(kpis.entity_count, 2);
    assert_eq!(kpis.rejection_rate, 12.5);
}

#[test]
fn test_kpis_with_zero_previous_period() {
    let a = result("ACME", &[0.0], &[50.0]);
    let timeline = build_timeline(&[&a], 12);

    let kpis = compute_kpis(&timeline, 1, &RejectionCounts::default());

    assert_eq!(kpis.growth_current_vs_previous, 0.0);
    assert_eq!(kpis.next_period_predicted, 0.0);
    assert_eq!(kpis.growth_next_vs_current, -100.0);
    assert_eq!(kpis.rejection_rate, 0.0);
}

#[test]
fn test_aggregate_report() {
    let results = vec![
        result("BOLT", &[10.0, 20.0], &[25.0, 30.0]),
        result("ACME", &[50.0, 60.0], &[65.0, 70.0]),
        result("CORE", &[1.0, 2.0], &[3.0, 4.0]),
    ];

    let report = aggregate(
        "company",
        &results,
        2,
        &AggregateConfig::default(),
        &counts(6, 0),
        Utc::now(),
    );

    assert_eq!(report.scope, "company");
    assert_eq!(report.metadata.entities, vec!["ACME", "BOLT"]);
    assert_eq!(report.metadata.historical_months, 2);
    assert_eq!(report.metadata.forecast_months, 2);
    assert_eq!(report.metadata.current_month, Some(month(2024, 3)));
    let range = report.metadata.date_range.as_ref().unwrap();
    assert_eq!((range.start, range.end), (month(2024, 1), month(2024, 4)));

    let ids: Vec<&str> = report.forecasts.iter().map(|r| r.entity_id()).collect();
    assert_eq!(ids, vec!["ACME", "BOLT", "CORE"]);
    assert!(report
        .timeline
        .iter()
        .all(|row| !row.values.keys().any(|k| k.starts_with("CORE"))));
}

#[test]
fn test_empty_scope_report() {
    let report = aggregate(
        "region",
        &[],
        5,
        &AggregateConfig::default(),
        &RejectionCounts::default(),
        Utc::now(),
    );

    assert!(report.timeline.is_empty());
    assert!(report.metadata.date_range.is_none());
    assert_eq!(report.kpis.horizon_total, 0.0);
    assert_eq!(report.kpis.average_per_period, 0.0);
}

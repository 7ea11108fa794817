//! Ranked top-N view, dashboard timeline and KPIs for one scope
//!
//! Everything here is a pure function of the per-entity results.

use crate::config::{AggregateConfig, RankingMetric};
use crate::models::ForecastResult;
use crate::period::Month;
use crate::quality::RejectionCounts;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Suffix of forecast value keys in timeline rows
pub const PRED_SUFFIX: &str = "_pred";

/// One month of the dashboard timeline.
///
/// Historical rows carry `<entity>: value`, forecast rows carry
/// `<entity>_pred: value`, both flattened next to the fixed fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRow {
    pub period: Month,
    pub label: String,
    pub is_historical: bool,
    pub is_current_month: bool,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    /// Actual total of the last historical month
    pub previous_period_total: f64,
    /// Forecast total of the first forecast month
    pub current_period_predicted: f64,
    pub next_period_predicted: f64,
    /// Percent, one decimal
    pub growth_current_vs_previous: f64,
    /// Percent, one decimal
    pub growth_next_vs_current: f64,
    pub horizon_total: f64,
    pub average_per_period: f64,
    pub entity_count: usize,
    /// Share of input records the quality gate rejected, percent, one decimal
    pub rejection_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: Month,
    pub end: Month,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMetadata {
    /// Ranked entities shown in the timeline
    pub entities: Vec<String>,
    pub date_range: Option<DateRange>,
    pub historical_months: usize,
    pub forecast_months: usize,
    pub current_month: Option<Month>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeReport {
    pub scope: String,
    pub timeline: Vec<TimelineRow>,
    pub kpis: Kpis,
    pub metadata: ScopeMetadata,
    /// Every forecast of the scope, ordered by entity
    pub forecasts: Vec<ForecastResult>,
}

/// Round to one decimal place
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn growth(from: f64, to: f64) -> f64 {
    if from > 0.0 {
        round1((to - from) / from * 100.0)
    } else {
        0.0
    }
}

/// Top `top_n` results by the configured metric, ties broken by entity id
pub fn rank<'a>(
    results: &'a [ForecastResult],
    config: &AggregateConfig,
    top_n: usize,
) -> Vec<&'a ForecastResult> {
    let metric = |r: &ForecastResult| match config.ranking {
        RankingMetric::TrailingTotal => r.trailing_total(config.ranking_window),
        RankingMetric::ForecastTotal => r.forecast_total(),
    };

    let mut ranked: Vec<(&ForecastResult, f64)> = results.iter().map(|r| (r, metric(r))).collect();
    ranked.sort_by(|(a, ma), (b, mb)| {
        mb.total_cmp(ma)
            .then_with(|| a.entity_id().cmp(b.entity_id()))
    });
    ranked.into_iter().take(top_n).map(|(r, _)| r).collect()
}

/// Historical rows for the last `history_months` months followed by the forecast rows
pub fn build_timeline(selected: &[&ForecastResult], history_months: usize) -> Vec<TimelineRow> {
    let historical: BTreeSet<Month> = selected
        .iter()
        .flat_map(|r| r.historical.iter().map(|p| p.period))
        .collect();
    let skip = historical.len().saturating_sub(history_months);

    let mut rows = Vec::new();
    for period in historical.into_iter().skip(skip) {
        let mut values = BTreeMap::new();
        for result in selected {
            let value = result
                .historical
                .iter()
                .find(|p| p.period == period)
                .map_or(0.0, |p| p.value);
            if value.is_finite() {
                values.insert(result.entity_id().to_string(), value);
            }
        }
        rows.push(TimelineRow {
            period,
            label: period.label(),
            is_historical: true,
            is_current_month: false,
            values,
        });
    }

    let forecast: BTreeSet<Month> = selected
        .iter()
        .flat_map(|r| r.forecast.iter().map(|p| p.period))
        .collect();

    for (i, period) in forecast.into_iter().enumerate() {
        let mut values = BTreeMap::new();
        for result in selected {
            let value = result
                .forecast
                .iter()
                .find(|p| p.period == period)
                .map_or(0.0, |p| p.value);
            values.insert(format!("{}{}", result.entity_id(), PRED_SUFFIX), value);
        }
        rows.push(TimelineRow {
            period,
            label: period.label(),
            is_historical: false,
            is_current_month: i == 0,
            values,
        });
    }

    rows
}

fn row_total(row: &TimelineRow) -> f64 {
    row.values.values().sum()
}

/// KPIs over a timeline
pub fn compute_kpis(
    timeline: &[TimelineRow],
    entity_count: usize,
    counts: &RejectionCounts,
) -> Kpis {
    let previous = timeline
        .iter()
        .filter(|r| r.is_historical)
        .last()
        .map_or(0.0, row_total);

    let forecast: Vec<&TimelineRow> = timeline.iter().filter(|r| !r.is_historical).collect();
    let current = forecast.first().map_or(0.0, |r| row_total(r));
    let next = forecast.get(1).map_or(0.0, |r| row_total(r));
    let horizon_total: f64 = forecast.iter().map(|r| row_total(r)).sum();
    let average = if forecast.is_empty() {
        0.0
    } else {
        horizon_total / forecast.len() as f64
    };

    let rejection_rate = if counts.total > 0 {
        round1(counts.rejected() as f64 / counts.total as f64 * 100.0)
    } else {
        0.0
    };

    Kpis {
        previous_period_total: previous,
        current_period_predicted: current,
        next_period_predicted: next,
        growth_current_vs_previous: growth(previous, current),
        growth_next_vs_current: growth(current, next),
        horizon_total,
        average_per_period: average,
        entity_count,
        rejection_rate,
    }
}

/// Rank, build the timeline and compute the KPIs of one scope
pub fn aggregate(
    scope: &str,
    results: &[ForecastResult],
    top_n: usize,
    config: &AggregateConfig,
    counts: &RejectionCounts,
    generated_at: DateTime<Utc>,
) -> ScopeReport {
    let selected = rank(results, config, top_n);
    let timeline = build_timeline(&selected, config.history_months);
    let kpis = compute_kpis(&timeline, selected.len(), counts);

    let metadata = ScopeMetadata {
        entities: selected.iter().map(|r| r.entity_id().to_string()).collect(),
        date_range: match (timeline.first(), timeline.last()) {
            (Some(first), Some(last)) => Some(DateRange {
                start: first.period,
                end: last.period,
            }),
            _ => None,
        },
        historical_months: timeline.iter().filter(|r| r.is_historical).count(),
        forecast_months: timeline.iter().filter(|r| !r.is_historical).count(),
        current_month: timeline.iter().find(|r| r.is_current_month).map(|r| r.period),
        generated_at,
    };

    let mut forecasts = results.to_vec();
    forecasts.sort_by(|a, b| a.key.cmp(&b.key));

    ScopeReport {
        scope: scope.to_string(),
        timeline,
        kpis,
        metadata,
        forecasts,
    }
}

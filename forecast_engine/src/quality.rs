//! Quality gate: validation, normalisation, de-duplication and outlier
//! screening of raw records.
//!
//! Per-record failures never abort the pass. Each one lands in the
//! [`RejectionLedger`] with its input position and reason, and the gate only
//! fails when nothing at all survives.

use crate::config::{OutlierPolicy, QualityConfig};
use crate::data::{CleanRecord, CleanTable, RawRecord, RawValue};
use crate::error::{ForecastError, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use series_math::stats;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Why a record was excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingEntity,
    DateFormat,
    NonNumeric,
    NonPositive,
    Duplicate,
    Outlier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Position of the record in the input
    pub index: usize,
    pub entity_id: Option<String>,
    pub timestamp: Option<String>,
    pub reason: RejectReason,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierAction {
    Flagged,
    Capped,
    Dropped,
}

/// A value outside its entity's IQR fences
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlierFlag {
    pub index: usize,
    pub entity_id: String,
    pub value: f64,
    pub lower_fence: f64,
    pub upper_fence: f64,
    pub action: OutlierAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionCounts {
    pub total: usize,
    pub accepted: usize,
    pub missing_entity: usize,
    pub date_format: usize,
    pub non_numeric: usize,
    pub non_positive: usize,
    pub duplicate: usize,
    /// Outliers removed under [`OutlierPolicy::Drop`]
    pub outlier: usize,
    /// Outliers kept (flagged or capped)
    pub flagged_outliers: usize,
}

impl RejectionCounts {
    pub fn rejected(&self) -> usize {
        self.missing_entity
            + self.date_format
            + self.non_numeric
            + self.non_positive
            + self.duplicate
            + self.outlier
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionLedger {
    pub rejections: Vec<Rejection>,
    pub outliers: Vec<OutlierFlag>,
    pub counts: RejectionCounts,
}

impl RejectionLedger {
    fn reject(&mut self, index: usize, record: &RawRecord, reason: RejectReason, detail: String) {
        let counter = match reason {
            RejectReason::MissingEntity => &mut self.counts.missing_entity,
            RejectReason::DateFormat => &mut self.counts.date_format,
            RejectReason::NonNumeric => &mut self.counts.non_numeric,
            RejectReason::NonPositive => &mut self.counts.non_positive,
            RejectReason::Duplicate => &mut self.counts.duplicate,
            RejectReason::Outlier => &mut self.counts.outlier,
        };
        *counter += 1;

        self.rejections.push(Rejection {
            index,
            entity_id: record.entity_id.clone(),
            timestamp: record.timestamp.clone(),
            reason,
            detail,
        });
    }

    pub fn count(&self, reason: RejectReason) -> usize {
        self.rejections.iter().filter(|r| r.reason == reason).count()
    }

    pub fn by_reason(&self, reason: RejectReason) -> impl Iterator<Item = &Rejection> {
        self.rejections.iter().filter(move |r| r.reason == reason)
    }
}

/// Validates raw records and produces the clean table
#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Clean a batch of records.
    ///
    /// Returns [`ForecastError::AllRejected`] when no record survives.
    pub fn clean(&self, records: &[RawRecord]) -> Result<(CleanTable, RejectionLedger)> {
        match self.inspect(records)? {
            (Some(table), ledger) => Ok((table, ledger)),
            (None, _) => {
                warn!(total = records.len(), "quality gate rejected every record");
                Err(ForecastError::AllRejected {
                    total: records.len(),
                })
            }
        }
    }

    /// Like [`QualityGate::clean`], but keeps the ledger of a batch with no
    /// surviving record and returns no table for it.
    pub fn inspect(
        &self,
        records: &[RawRecord],
    ) -> Result<(Option<CleanTable>, RejectionLedger)> {
        let mut ledger = RejectionLedger::default();
        ledger.counts.total = records.len();

        let mut seen: HashSet<(String, NaiveDateTime, u64)> = HashSet::new();
        let mut accepted: Vec<(usize, CleanRecord)> = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            let entity_id = match record.entity_id.as_deref().map(normalize_entity) {
                Some(id) if !id.is_empty() => id,
                _ => {
                    ledger.reject(
                        index,
                        record,
                        RejectReason::MissingEntity,
                        "entity id is missing or blank".to_string(),
                    );
                    continue;
                }
            };

            let timestamp = match parse_timestamp(record.timestamp.as_deref().unwrap_or("")) {
                Ok(ts) => ts,
                Err(detail) => {
                    ledger.reject(index, record, RejectReason::DateFormat, detail);
                    continue;
                }
            };

            let value = match record.value.as_ref().and_then(RawValue::as_number) {
                Some(v) if v.is_finite() => v,
                _ => {
                    ledger.reject(
                        index,
                        record,
                        RejectReason::NonNumeric,
                        format!("value {:?} is not a finite number", record.value),
                    );
                    continue;
                }
            };

            if value <= 0.0 {
                ledger.reject(
                    index,
                    record,
                    RejectReason::NonPositive,
                    format!("value {} is not positive", value),
                );
                continue;
            }

            if !seen.insert((entity_id.clone(), timestamp, value.to_bits())) {
                ledger.reject(
                    index,
                    record,
                    RejectReason::Duplicate,
                    "exact repeat of an earlier record".to_string(),
                );
                continue;
            }

            accepted.push((
                index,
                CleanRecord {
                    entity_id,
                    timestamp,
                    value,
                    outlier: false,
                },
            ));
        }

        let accepted = self.screen_outliers(accepted, records, &mut ledger);

        if accepted.is_empty() {
            return Ok((None, ledger));
        }

        ledger.counts.accepted = accepted.len();
        info!(
            total = ledger.counts.total,
            accepted = ledger.counts.accepted,
            rejected = ledger.counts.rejected(),
            outliers = ledger.outliers.len(),
            "quality gate finished"
        );

        let table = CleanTable::from_records(&accepted)?;
        Ok((Some(table), ledger))
    }

    fn screen_outliers(
        &self,
        mut accepted: Vec<(usize, CleanRecord)>,
        raw: &[RawRecord],
        ledger: &mut RejectionLedger,
    ) -> Vec<CleanRecord> {
        let mut by_entity: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (pos, (_, record)) in accepted.iter().enumerate() {
            by_entity
                .entry(record.entity_id.clone())
                .or_default()
                .push(pos);
        }

        let mut dropped = vec![false; accepted.len()];
        for (entity_id, positions) in by_entity {
            let values: Vec<f64> = positions.iter().map(|&p| accepted[p].1.value).collect();
            let Some((lower, upper)) = stats::iqr_fences(
                &values,
                self.config.outlier_iqr_multiplier,
                self.config.outlier_min_records,
            ) else {
                continue;
            };

            for &pos in &positions {
                let (index, record) = &mut accepted[pos];
                let value = record.value;
                if value >= lower && value <= upper {
                    continue;
                }

                let action = match self.config.outlier_policy {
                    OutlierPolicy::KeepAndFlag => {
                        record.outlier = true;
                        OutlierAction::Flagged
                    }
                    OutlierPolicy::Cap => {
                        record.value = value.clamp(lower, upper);
                        record.outlier = true;
                        OutlierAction::Capped
                    }
                    OutlierPolicy::Drop => {
                        dropped[pos] = true;
                        ledger.reject(
                            *index,
                            &raw[*index],
                            RejectReason::Outlier,
                            format!("value {} outside [{:.3}, {:.3}]", value, lower, upper),
                        );
                        OutlierAction::Dropped
                    }
                };

                if action != OutlierAction::Dropped {
                    ledger.counts.flagged_outliers += 1;
                }
                debug!(entity = %entity_id, value, lower, upper, ?action, "outlier");
                ledger.outliers.push(OutlierFlag {
                    index: *index,
                    entity_id: entity_id.clone(),
                    value,
                    lower_fence: lower,
                    upper_fence: upper,
                    action,
                });
            }
        }

        accepted
            .into_iter()
            .zip(dropped)
            .filter(|(_, drop)| !drop)
            .map(|((_, record), _)| record)
            .collect()
    }
}

/// Trim and upper-case an entity id
pub fn normalize_entity(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Strictly parse a timestamp.
///
/// Only `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` and `YYYY-MM-DDTHH:MM:SS.fraction`
/// are accepted, and the date must exist on the calendar.
pub fn parse_timestamp(raw: &str) -> std::result::Result<NaiveDateTime, String> {
    let text = raw.trim();
    if !has_allowed_shape(text) {
        return Err(format!(
            "'{}' is not YYYY-MM-DD[THH:MM:SS[.fraction]]",
            text
        ));
    }

    let date = NaiveDate::parse_from_str(&text[..10], "%Y-%m-%d")
        .map_err(|e| format!("'{}' is not a calendar date: {}", text, e))?;

    if text.len() == 10 {
        return date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("'{}' has no midnight", text));
    }

    let time = NaiveTime::parse_from_str(&text[11..], "%H:%M:%S%.f")
        .map_err(|e| format!("'{}' has an invalid time of day: {}", text, e))?;
    Ok(date.and_time(time))
}

fn has_allowed_shape(text: &str) -> bool {
    let b = text.as_bytes();
    let digits = |from: usize, to: usize| {
        b.get(from..to)
            .map_or(false, |s| s.iter().all(u8::is_ascii_digit))
    };

    let date = b.len() >= 10
        && digits(0, 4)
        && b[4] == b'-'
        && digits(5, 7)
        && b[7] == b'-'
        && digits(8, 10);
    if !date {
        return false;
    }

    let time = || {
        b.len() >= 19
            && b[10] == b'T'
            && digits(11, 13)
            && b[13] == b':'
            && digits(14, 16)
            && b[16] == b':'
            && digits(17, 19)
    };

    match b.len() {
        10 => true,
        19 => time(),
        n if n > 20 => time() && b[19] == b'.' && digits(20, n),
        _ => false,
    }
}

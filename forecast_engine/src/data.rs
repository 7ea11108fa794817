//! Records, the cleaned columnar table and per-entity monthly series

use crate::config::GapPolicy;
use crate::error::{ForecastError, Result};
use crate::period::Month;
use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scope name for entities keyed by company
pub const COMPANY_SCOPE: &str = "company";
/// Scope name for entities keyed by region
pub const REGION_SCOPE: &str = "region";

const ENTITY_COLUMN: &str = "entity_id";
const TIMESTAMP_COLUMN: &str = "timestamp_ms";
const VALUE_COLUMN: &str = "value";
const OUTLIER_COLUMN: &str = "outlier";

/// A value as it arrived: a JSON number or a string that may hold one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    /// Numeric reading of the value; numeric strings are coerced
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RawValue::Number(v) => Some(*v),
            RawValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

/// An unvalidated input record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    pub entity_id: Option<String>,
    pub timestamp: Option<String>,
    pub value: Option<RawValue>,
}

impl RawRecord {
    pub fn new(entity_id: &str, timestamp: &str, value: impl Into<RawValue>) -> Self {
        Self {
            entity_id: Some(entity_id.to_string()),
            timestamp: Some(timestamp.to_string()),
            value: Some(value.into()),
        }
    }
}

/// A sales transaction carrying both a company and a region.
///
/// The aliases accept the upload column names of the dashboard export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    #[serde(alias = "NameAlpha")]
    pub company: Option<String>,
    #[serde(alias = "State")]
    pub region: Option<String>,
    #[serde(alias = "DateTransactionJulian")]
    pub timestamp: Option<String>,
    #[serde(alias = "Orig_Inv_Ttl_Prod_Value")]
    pub value: Option<RawValue>,
}

impl Transaction {
    /// Split a batch into a company scope and a region scope
    pub fn split_scopes(transactions: &[Transaction]) -> Vec<ScopeInput> {
        let mut companies = Vec::with_capacity(transactions.len());
        let mut regions = Vec::with_capacity(transactions.len());

        for tx in transactions {
            companies.push(RawRecord {
                entity_id: tx.company.clone(),
                timestamp: tx.timestamp.clone(),
                value: tx.value.clone(),
            });
            regions.push(RawRecord {
                entity_id: tx.region.clone(),
                timestamp: tx.timestamp.clone(),
                value: tx.value.clone(),
            });
        }

        vec![
            ScopeInput::new(COMPANY_SCOPE, companies),
            ScopeInput::new(REGION_SCOPE, regions),
        ]
    }
}

/// Raw records of one grouping (company, region, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeInput {
    pub name: String,
    pub records: Vec<RawRecord>,
}

impl ScopeInput {
    pub fn new(name: &str, records: Vec<RawRecord>) -> Self {
        Self {
            name: name.to_string(),
            records,
        }
    }
}

/// Identity of an entity within its scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub scope: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(scope: &str, entity_id: &str) -> Self {
        Self {
            scope: scope.to_string(),
            entity_id: entity_id.to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.entity_id)
    }
}

/// A record that passed the quality gate
#[derive(Debug, Clone, PartialEq)]
pub struct CleanRecord {
    /// Trimmed, upper-cased entity id
    pub entity_id: String,
    pub timestamp: NaiveDateTime,
    /// Finite and positive
    pub value: f64,
    pub outlier: bool,
}

/// Columnar table of accepted records
#[derive(Debug, Clone)]
pub struct CleanTable {
    df: DataFrame,
}

impl CleanTable {
    pub fn from_records(records: &[CleanRecord]) -> Result<Self> {
        let entities: Vec<String> = records.iter().map(|r| r.entity_id.clone()).collect();
        let stamps: Vec<i64> = records
            .iter()
            .map(|r| r.timestamp.and_utc().timestamp_millis())
            .collect();
        let values: Vec<f64> = records.iter().map(|r| r.value).collect();
        let flags: Vec<bool> = records.iter().map(|r| r.outlier).collect();

        let df = DataFrame::new(vec![
            Series::new(ENTITY_COLUMN, entities),
            Series::new(TIMESTAMP_COLUMN, stamps),
            Series::new(VALUE_COLUMN, values),
            Series::new(OUTLIER_COLUMN, flags),
        ])?;

        Ok(Self { df })
    }

    /// Get the underlying DataFrame
    pub fn dataframe(&self) -> &DataFrame {
        &self.df
    }

    pub fn len(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    /// Read the rows back in table order
    pub fn records(&self) -> Result<Vec<CleanRecord>> {
        let entities = self.df.column(ENTITY_COLUMN)?.utf8()?;
        let stamps = self.df.column(TIMESTAMP_COLUMN)?.i64()?;
        let values = self.df.column(VALUE_COLUMN)?.f64()?;
        let flags = self.df.column(OUTLIER_COLUMN)?.bool()?;

        let mut records = Vec::with_capacity(self.len());
        for (((entity, stamp), value), flag) in entities
            .into_iter()
            .zip(stamps.into_iter())
            .zip(values.into_iter())
            .zip(flags.into_iter())
        {
            let (Some(entity), Some(stamp), Some(value)) = (entity, stamp, value) else {
                return Err(ForecastError::DataError(
                    "clean table contains a null cell".to_string(),
                ));
            };
            let timestamp = DateTime::from_timestamp_millis(stamp)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| {
                    ForecastError::DataError(format!("timestamp out of range: {}", stamp))
                })?;

            records.push(CleanRecord {
                entity_id: entity.to_string(),
                timestamp,
                value,
                outlier: flag.unwrap_or(false),
            });
        }

        Ok(records)
    }

    /// Sorted distinct entity ids
    pub fn entities(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .df
            .column(ENTITY_COLUMN)?
            .utf8()?
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Fold the records into one contiguous monthly series per entity.
    ///
    /// All series of the table share the same period range: from the earliest
    /// month with data to the latest, extended through `extend_through` when
    /// that is later. Months without records are filled per `gap_policy`.
    /// Series come back sorted by entity id.
    pub fn monthly_series(
        &self,
        gap_policy: GapPolicy,
        extend_through: Option<Month>,
    ) -> Result<Vec<EntitySeries>> {
        let records = self.records()?;

        let (Some(first), Some(last)) = (
            records.iter().map(|r| Month::from_datetime(&r.timestamp)).min(),
            records.iter().map(|r| Month::from_datetime(&r.timestamp)).max(),
        ) else {
            return Ok(Vec::new());
        };
        let last = match extend_through {
            Some(through) if through > last => through,
            _ => last,
        };

        let mut per_entity: BTreeMap<String, Vec<(NaiveDateTime, f64)>> = BTreeMap::new();
        for record in records {
            per_entity
                .entry(record.entity_id)
                .or_default()
                .push((record.timestamp, record.value));
        }

        let fill = match gap_policy {
            GapPolicy::Zero => 0.0,
            GapPolicy::Missing => f64::NAN,
        };

        let mut series = Vec::with_capacity(per_entity.len());
        for (entity_id, mut observations) in per_entity {
            // Canonical order, so the floating-point sums do not depend on input order
            observations.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));

            let mut sums: BTreeMap<Month, f64> = BTreeMap::new();
            for (timestamp, value) in observations {
                *sums.entry(Month::from_datetime(&timestamp)).or_insert(0.0) += value;
            }

            let points = Month::range_inclusive(first, last)
                .map(|period| SeriesPoint {
                    period,
                    value: sums.get(&period).copied().unwrap_or(fill),
                })
                .collect();
            series.push(EntitySeries::new(&entity_id, points)?);
        }

        Ok(series)
    }
}

/// One month of an entity series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub period: Month,
    pub value: f64,
}

impl SeriesPoint {
    /// Finite and strictly positive
    pub fn is_usable(&self) -> bool {
        self.value.is_finite() && self.value > 0.0
    }
}

/// Contiguous monthly totals for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySeries {
    entity_id: String,
    points: Vec<SeriesPoint>,
}

impl EntitySeries {
    /// Build a series; periods must be ascending and contiguous
    pub fn new(entity_id: &str, points: Vec<SeriesPoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(ForecastError::DataError(format!(
                "series for {} has no periods",
                entity_id
            )));
        }

        for pair in points.windows(2) {
            if pair[1].period != pair[0].period.succ() {
                return Err(ForecastError::DataError(format!(
                    "series for {} is not contiguous at {} -> {}",
                    entity_id, pair[0].period, pair[1].period
                )));
            }
        }

        Ok(Self {
            entity_id: entity_id.to_string(),
            points,
        })
    }

    /// Series of consecutive months starting at `start`
    pub fn from_values(entity_id: &str, start: Month, values: &[f64]) -> Result<Self> {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, &value)| SeriesPoint {
                period: start.offset(i as i64),
                value,
            })
            .collect();
        Self::new(entity_id, points)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first_period(&self) -> Month {
        self.points[0].period
    }

    pub fn last_period(&self) -> Month {
        self.points[self.points.len() - 1].period
    }

    /// First month to forecast
    pub fn forecast_origin(&self) -> Month {
        self.last_period().succ()
    }

    pub fn usable_points(&self) -> Vec<SeriesPoint> {
        self.points.iter().copied().filter(SeriesPoint::is_usable).collect()
    }

    pub fn usable_count(&self) -> usize {
        self.points.iter().filter(|p| p.is_usable()).count()
    }
}

//! Content fingerprints of entity series and the reuse/retrain decision

use crate::data::EntitySeries;
use crate::registry::ModelRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

/// Version tag mixed into every fingerprint; bump when the canonical text changes
pub const FINGERPRINT_VERSION: &str = "series-fp/1";

/// SHA-256 (hex) of a series' canonical text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a series.
    ///
    /// Series are already folded in canonical order, so two inputs that
    /// describe the same monthly totals hash identically whatever the record
    /// order or timestamp spelling.
    pub fn of(series: &EntitySeries) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_text(series).as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_text(series: &EntitySeries) -> String {
    let mut text = String::with_capacity(32 + series.len() * 24);
    text.push_str(FINGERPRINT_VERSION);
    text.push('\n');
    text.push_str(series.entity_id());
    text.push('\n');
    for point in series.points() {
        let _ = writeln!(text, "{}|{}", point.period, canonical_number(point.value));
    }
    text
}

fn canonical_number(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    let formatted = format!("{:.6}", value);
    // -0.000000 and 0.000000 are the same month total
    if formatted.trim_start_matches('-').chars().all(|c| c == '0' || c == '.') {
        "0.000000".to_string()
    } else {
        formatted
    }
}

/// Why a model has to be trained
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum RetrainReason {
    Forced,
    NoPriorModel,
    FingerprintChanged { previous: Fingerprint },
}

impl fmt::Display for RetrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrainReason::Forced => f.write_str("forced retrain"),
            RetrainReason::NoPriorModel => f.write_str("no prior model"),
            RetrainReason::FingerprintChanged { .. } => f.write_str("fingerprint changed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    Reuse,
    Retrain(RetrainReason),
}

/// Reuse only when not forced and the prior model was trained on identical data
pub fn decide(
    series: &EntitySeries,
    prior: Option<&ModelRecord>,
    force_retrain: bool,
) -> CacheDecision {
    if force_retrain {
        return CacheDecision::Retrain(RetrainReason::Forced);
    }

    match prior {
        None => CacheDecision::Retrain(RetrainReason::NoPriorModel),
        Some(record) if record.fingerprint == Fingerprint::of(series) => CacheDecision::Reuse,
        Some(record) => CacheDecision::Retrain(RetrainReason::FingerprintChanged {
            previous: record.fingerprint.clone(),
        }),
    }
}

//! Per-entity decision log

use crate::data::EntityKey;
use crate::fingerprint::{Fingerprint, RetrainReason};
use crate::models::MethodTag;
use serde::Serialize;
use std::fmt;

/// What happened at one step of an entity's pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DecisionReason {
    CacheHit { fingerprint: Fingerprint },
    Retrain { reason: RetrainReason },
    /// The cached payload cannot produce the requested horizon
    CacheCannotCoverHorizon { horizon: usize },
    InsufficientData { usable: usize, required: usize },
    PrimaryTimedOut { elapsed_ms: u64 },
    PrimaryCrashed { detail: String },
    PrimaryFailed { detail: String },
    SecondaryFailed { detail: String },
    /// Terminal: the entity was served
    Served { method: MethodTag, cached: bool },
    /// Terminal: no usable point, the entity is left out
    NoData,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::CacheHit { .. } => f.write_str("cache hit"),
            DecisionReason::Retrain { reason } => write!(f, "retrain: {}", reason),
            DecisionReason::CacheCannotCoverHorizon { horizon } => {
                write!(f, "cached model cannot cover {} months", horizon)
            }
            DecisionReason::InsufficientData { usable, required } => {
                write!(f, "{} usable points, primary needs {}", usable, required)
            }
            DecisionReason::PrimaryTimedOut { elapsed_ms } => {
                write!(f, "primary timed out after {} ms", elapsed_ms)
            }
            DecisionReason::PrimaryCrashed { detail } => write!(f, "primary crashed: {}", detail),
            DecisionReason::PrimaryFailed { detail } => write!(f, "primary failed: {}", detail),
            DecisionReason::SecondaryFailed { detail } => {
                write!(f, "secondary failed: {}", detail)
            }
            DecisionReason::Served { method, cached } => {
                write!(f, "served by {}{}", method, if *cached { " (cached)" } else { "" })
            }
            DecisionReason::NoData => f.write_str("no usable data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEntry {
    pub key: EntityKey,
    /// Tier the step belongs to, when it belongs to one
    pub tier: Option<MethodTag>,
    #[serde(flatten)]
    pub reason: DecisionReason,
}

impl DecisionEntry {
    pub fn new(key: &EntityKey, tier: Option<MethodTag>, reason: DecisionReason) -> Self {
        Self {
            key: key.clone(),
            tier,
            reason,
        }
    }
}

/// Ordered record of every decision of a pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DecisionLog {
    entries: Vec<DecisionEntry>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: DecisionEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = DecisionEntry>) {
        self.entries.extend(entries);
    }

    /// Stable sort by entity key; steps of one entity keep their order
    pub fn sort_by_entity(&mut self) {
        self.entries.sort_by(|a, b| a.key.cmp(&b.key));
    }

    pub fn entries(&self) -> &[DecisionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_entity<'a>(
        &'a self,
        key: &'a EntityKey,
    ) -> impl Iterator<Item = &'a DecisionEntry> {
        self.entries.iter().filter(move |e| &e.key == key)
    }

    /// Tier that served `key`, if it was served
    pub fn served_by(&self, key: &EntityKey) -> Option<MethodTag> {
        self.for_entity(key).find_map(|e| match e.reason {
            DecisionReason::Served { method, .. } => Some(method),
            _ => None,
        })
    }

    pub fn cache_hits(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.reason, DecisionReason::CacheHit { .. }))
            .count()
    }

    pub fn retrains(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.reason, DecisionReason::Retrain { .. }))
            .count()
    }
}

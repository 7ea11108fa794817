//! Registry of trained models, one slot per entity key
//!
//! Each slot has its own lock. The engine holds it across decide, train and
//! write, so two attempts for the same entity serialize while different
//! entities never contend. Records are replaced whole, never edited.

use crate::data::EntityKey;
use crate::fingerprint::Fingerprint;
use crate::models::{FittedModel, MethodTag};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A trained model together with the data fingerprint it was trained on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub key: EntityKey,
    pub fingerprint: Fingerprint,
    pub method: MethodTag,
    pub model: FittedModel,
    pub accuracy: Option<f64>,
    pub trained_at: DateTime<Utc>,
}

pub type ModelSlot = Arc<Mutex<Option<ModelRecord>>>;

#[derive(Debug, Default)]
pub struct ModelRegistry {
    slots: RwLock<HashMap<EntityKey, ModelSlot>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated from a snapshot
    pub fn from_records(records: Vec<ModelRecord>) -> Self {
        let registry = Self::new();
        registry.restore(records);
        registry
    }

    /// The slot for `key`, created empty on first use
    pub fn slot(&self, key: &EntityKey) -> ModelSlot {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    pub fn get(&self, key: &EntityKey) -> Option<ModelRecord> {
        let slot = self.slots.read().get(key).cloned()?;
        let record = slot.lock().clone();
        record
    }

    /// Number of stored models
    pub fn len(&self) -> usize {
        let slots: Vec<ModelSlot> = self.slots.read().values().cloned().collect();
        slots.iter().filter(|s| s.lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored models, ordered by key
    pub fn snapshot(&self) -> Vec<ModelRecord> {
        let slots: Vec<ModelSlot> = self.slots.read().values().cloned().collect();
        let mut records: Vec<ModelRecord> = slots.iter().filter_map(|s| s.lock().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Load records, replacing whatever the slots held
    pub fn restore(&self, records: Vec<ModelRecord>) {
        for record in records {
            let slot = self.slot(&record.key);
            *slot.lock() = Some(record);
        }
    }

    pub fn remove(&self, key: &EntityKey) -> Option<ModelRecord> {
        let slot = self.slots.read().get(key).cloned()?;
        let record = slot.lock().take();
        record
    }
}

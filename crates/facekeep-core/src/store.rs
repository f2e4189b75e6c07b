//! Persistent label store.
//!
//! Records live in a key-value backend under `faceData_<label>` keys, as
//! JSON documents of the shape
//! `{ "name", "samples": [{ "landmarks", "descriptor", "timestamp" }], "dateCollected" }`.
//! Unrelated keys in the same backend are ignored.

use crate::types::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved namespace prefix for every label key.
pub const KEY_PREFIX: &str = "faceData_";

/// Errors raised by a key-value backend.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("store is full: {0}")]
    Full(String),
    #[error("backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid label {0:?}: labels must be non-empty and free of control characters")]
    InvalidLabel(String),
    #[error("storage rejected write of {key}: {source}")]
    StorageQuota {
        key: String,
        #[source]
        source: KvError,
    },
    #[error("no record for label {0:?}")]
    NotFound(String),
    #[error("corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage read failed: {0}")]
    Backend(#[source] KvError),
}

/// All samples collected for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    #[serde(rename = "name")]
    pub label: String,
    pub samples: Vec<Sample>,
    #[serde(rename = "dateCollected")]
    pub collected_at: DateTime<Utc>,
}

/// Reject empty, whitespace-only and control-character labels.
pub fn validate_label(label: &str) -> Result<(), StoreError> {
    if label.trim().is_empty() || label.chars().any(char::is_control) {
        return Err(StoreError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

/// Storage key for a label.
pub fn record_key(label: &str) -> String {
    format!("{KEY_PREFIX}{label}")
}

/// Minimal string key-value medium a [`KvLabelStore`] is layered on.
pub trait KeyValue: Send {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    /// Store `value` under `key`, replacing any previous value. A failed
    /// write must leave the previous value in place.
    fn set(&mut self, key: &str, value: &str) -> Result<(), KvError>;
    /// Returns false when the key was absent.
    fn remove(&mut self, key: &str) -> Result<bool, KvError>;
    /// All keys, in the backend's iteration order.
    fn keys(&self) -> Result<Vec<String>, KvError>;
}

/// Label → record persistence, independent of the backing medium.
pub trait LabelStore: Send {
    /// Write `record` under its label, replacing any existing record.
    fn put(&mut self, record: &LabelRecord) -> Result<(), StoreError>;
    fn get(&self, label: &str) -> Result<LabelRecord, StoreError>;
    /// Lazily yield every readable record. Corrupt entries are logged and skipped.
    fn get_all(&self) -> Result<Box<dyn Iterator<Item = LabelRecord> + '_>, StoreError>;
    fn remove(&mut self, label: &str) -> Result<(), StoreError>;
    /// Labels of every readable record, in `get_all` order.
    fn labels(&self) -> Result<Vec<String>, StoreError>;
}

/// [`LabelStore`] over any [`KeyValue`] backend using the JSON record format.
pub struct KvLabelStore<B> {
    backend: B,
}

impl<B: KeyValue> KvLabelStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn prefixed_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .backend
            .keys()
            .map_err(StoreError::Backend)?
            .into_iter()
            .filter(|k| k.starts_with(KEY_PREFIX))
            .collect())
    }

    fn load(&self, key: &str) -> Option<LabelRecord> {
        let value = match self.backend.get(key) {
            Ok(Some(value)) => value,
            // Removed between listing and loading.
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read label record; skipping");
                return None;
            }
        };
        match decode(key, &value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key, error = %e, "skipping corrupt label record");
                None
            }
        }
    }
}

fn decode(key: &str, value: &str) -> Result<LabelRecord, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptRecord {
        key: key.to_string(),
        reason,
    };
    let record: LabelRecord = serde_json::from_str(value).map_err(|e| corrupt(e.to_string()))?;
    if record_key(&record.label) != key {
        return Err(corrupt(format!("record name {:?} does not match its key", record.label)));
    }
    validate_label(&record.label).map_err(|e| corrupt(e.to_string()))?;
    Ok(record)
}

impl<B: KeyValue> LabelStore for KvLabelStore<B> {
    fn put(&mut self, record: &LabelRecord) -> Result<(), StoreError> {
        validate_label(&record.label)?;
        // Serialize fully before touching the backend so a failure never
        // leaves a partial write behind.
        let value = serde_json::to_string(record)?;
        let key = record_key(&record.label);
        self.backend
            .set(&key, &value)
            .map_err(|source| StoreError::StorageQuota {
                key: key.clone(),
                source,
            })?;
        tracing::info!(
            label = %record.label,
            samples = record.samples.len(),
            bytes = value.len(),
            "label record stored"
        );
        Ok(())
    }

    fn get(&self, label: &str) -> Result<LabelRecord, StoreError> {
        let key = record_key(label);
        let value = self
            .backend
            .get(&key)
            .map_err(StoreError::Backend)?
            .ok_or_else(|| StoreError::NotFound(label.to_string()))?;
        decode(&key, &value)
    }

    fn get_all(&self) -> Result<Box<dyn Iterator<Item = LabelRecord> + '_>, StoreError> {
        let keys = self.prefixed_keys()?;
        Ok(Box::new(keys.into_iter().filter_map(move |key| self.load(&key))))
    }

    fn remove(&mut self, label: &str) -> Result<(), StoreError> {
        let removed = self
            .backend
            .remove(&record_key(label))
            .map_err(StoreError::Backend)?;
        if !removed {
            return Err(StoreError::NotFound(label.to_string()));
        }
        tracing::info!(label, "label record removed");
        Ok(())
    }

    fn labels(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.get_all()?.map(|record| record.label).collect())
    }
}

/// In-memory backend preserving insertion order, with an optional byte capacity.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Vec<(String, String)>,
    capacity: Option<usize>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects writes once keys plus values exceed `bytes`.
    pub fn with_capacity_bytes(bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: Some(bytes),
        }
    }

    /// Bytes currently used by keys and values.
    pub fn used_bytes(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

impl KeyValue for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.position(key).map(|i| self.entries[i].1.clone()))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        let existing = self.position(key);
        if let Some(capacity) = self.capacity {
            let replaced = existing.map_or(0, |i| key.len() + self.entries[i].1.len());
            let needed = self.used_bytes() - replaced + key.len() + value.len();
            if needed > capacity {
                return Err(KvError::Full(format!(
                    "{needed} bytes needed, capacity is {capacity}"
                )));
            }
        }
        match existing {
            Some(i) => self.entries[i].1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, KvError> {
        Ok(match self.position(key) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        })
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        Ok(self.entries.iter().map(|(k, _)| k.clone()).collect())
    }
}

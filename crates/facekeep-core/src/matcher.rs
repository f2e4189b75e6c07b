use crate::store::{LabelStore, StoreError};
use crate::types::Descriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Distance threshold above which a match is reported as unknown.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Label reported when no stored descriptor is close enough.
pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("label store has no usable labels; collect samples before recognizing")]
    EmptyStore,
    #[error("query descriptor has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to read label store: {0}")]
    Store(#[from] StoreError),
}

/// Distance between two descriptors, as defined by the oracle's model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Euclidean,
    /// 1 − cosine similarity.
    Cosine,
}

impl Metric {
    pub fn distance(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        match self {
            Metric::Euclidean => a.euclidean_distance(b),
            Metric::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric {other:?} (expected euclidean or cosine)")),
        }
    }
}

/// All descriptors stored for one label.
#[derive(Debug, Clone)]
pub struct LabeledDescriptors {
    pub label: String,
    pub descriptors: Vec<Descriptor>,
}

/// Result of matching one query descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Closest label, or `None` when the closest distance exceeds the threshold.
    pub label: Option<String>,
    pub distance: f32,
}

impl MatchResult {
    pub fn is_known(&self) -> bool {
        self.label.is_some()
    }

    pub fn label_or_unknown(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.label_or_unknown(), self.distance)
    }
}

/// Builds a [`MatcherIndex`] from the full contents of a label store.
#[derive(Debug, Clone)]
pub struct MatcherBuilder {
    threshold: f32,
    metric: Metric,
    descriptor_len: Option<usize>,
}

impl Default for MatcherBuilder {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            metric: Metric::default(),
            descriptor_len: None,
        }
    }
}

impl MatcherBuilder {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Only index descriptors of exactly this length. Without it the length
    /// of the first descriptor read wins.
    pub fn descriptor_len(mut self, len: usize) -> Self {
        self.descriptor_len = Some(len);
        self
    }

    pub fn build<S: LabelStore + ?Sized>(&self, store: &S) -> Result<MatcherIndex, MatcherError> {
        let mut dim = self.descriptor_len;
        let mut entries = Vec::new();

        for record in store.get_all()? {
            let mut descriptors = Vec::with_capacity(record.samples.len());
            for sample in record.samples {
                if sample.descriptor.is_empty() {
                    tracing::warn!(label = %record.label, "skipping empty descriptor");
                    continue;
                }
                let expected = *dim.get_or_insert(sample.descriptor.len());
                if sample.descriptor.len() != expected {
                    tracing::warn!(
                        label = %record.label,
                        expected,
                        actual = sample.descriptor.len(),
                        "skipping descriptor with unexpected length"
                    );
                    continue;
                }
                descriptors.push(sample.descriptor);
            }
            if descriptors.is_empty() {
                tracing::warn!(label = %record.label, "label has no usable descriptors; skipping");
                continue;
            }
            entries.push(LabeledDescriptors {
                label: record.label,
                descriptors,
            });
        }

        let Some(dim) = dim.filter(|_| !entries.is_empty()) else {
            return Err(MatcherError::EmptyStore);
        };

        tracing::info!(
            labels = entries.len(),
            descriptors = entries.iter().map(|e| e.descriptors.len()).sum::<usize>(),
            dim,
            threshold = self.threshold,
            metric = ?self.metric,
            "matcher index built"
        );

        Ok(MatcherIndex {
            entries,
            dim,
            threshold: self.threshold,
            metric: self.metric,
        })
    }
}

/// Read-only nearest-label index for one recognition session.
#[derive(Debug, Clone)]
pub struct MatcherIndex {
    entries: Vec<LabeledDescriptors>,
    dim: usize,
    threshold: f32,
    metric: Metric,
}

impl MatcherIndex {
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn label_count(&self) -> usize {
        self.entries.len()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the label of the globally closest stored descriptor.
    ///
    /// On equal distances the descriptor met first in store order wins.
    pub fn find_best_match(&self, query: &Descriptor) -> Result<MatchResult, MatcherError> {
        if query.len() != self.dim {
            return Err(MatcherError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }

        let mut best: Option<(&str, f32)> = None;
        for entry in &self.entries {
            for descriptor in &entry.descriptors {
                let distance = self.metric.distance(query, descriptor);
                if best.map_or(true, |(_, d)| distance < d) {
                    best = Some((&entry.label, distance));
                }
            }
        }

        // Entries are never empty, so a best candidate always exists.
        let (label, distance) = best.ok_or(MatcherError::EmptyStore)?;
        Ok(MatchResult {
            label: (distance <= self.threshold).then(|| label.to_string()),
            distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValue, KvLabelStore, LabelRecord, MemoryKv};
    use crate::types::Sample;
    use chrono::DateTime;

    fn put(store: &mut KvLabelStore<MemoryKv>, label: &str, descriptors: &[&[f32]]) {
        let at = DateTime::from_timestamp_millis(0).unwrap();
        let record = LabelRecord {
            label: label.to_string(),
            samples: descriptors
                .iter()
                .map(|d| Sample::new(vec![], Descriptor::new(d.to_vec()), at))
                .collect(),
            collected_at: at,
        };
        store.put(&record).unwrap();
    }

    fn q(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    #[test]
    fn test_empty_store() {
        let store = KvLabelStore::new(MemoryKv::new());
        assert!(matches!(MatcherBuilder::default().build(&store), Err(MatcherError::EmptyStore)));
    }

    #[test]
    fn test_store_with_only_corrupt_entries_is_empty() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        store.backend_mut().set("faceData_X", "garbage").unwrap();
        assert!(matches!(MatcherBuilder::default().build(&store), Err(MatcherError::EmptyStore)));
    }

    #[test]
    fn test_exact_match_distance_zero() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "Alice", &[&[0.1, 0.2, 0.3]]);
        let index = MatcherBuilder::default().build(&store).unwrap();
        let m = index.find_best_match(&q(&[0.1, 0.2, 0.3])).unwrap();
        assert_eq!(m.label.as_deref(), Some("Alice"));
        assert_eq!(m.distance, 0.0);
    }

    #[test]
    fn test_nearest_label_and_unknown() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "A", &[&[0.0, 0.0]]);
        put(&mut store, "B", &[&[10.0, 10.0]]);

        let index = MatcherBuilder::new(5.0).build(&store).unwrap();
        let m = index.find_best_match(&q(&[1.0, 1.0])).unwrap();
        assert_eq!(m.label.as_deref(), Some("A"));
        assert!((m.distance - 2.0f32.sqrt()).abs() < 1e-6);

        let far = index.find_best_match(&q(&[20.0, 20.0])).unwrap();
        assert!(!far.is_known());
        assert_eq!(far.label_or_unknown(), "unknown");
        assert!((far.distance - 200.0f32.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn test_global_nearest_across_samples() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "A", &[&[5.0, 5.0], &[0.0, 0.0]]);
        put(&mut store, "B", &[&[1.5, 1.5]]);
        let index = MatcherBuilder::new(10.0).build(&store).unwrap();
        let m = index.find_best_match(&q(&[0.5, 0.5])).unwrap();
        assert_eq!(m.label.as_deref(), Some("A"));
    }

    #[test]
    fn test_tie_picks_first_in_store_order() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "First", &[&[1.0, 0.0]]);
        put(&mut store, "Second", &[&[-1.0, 0.0]]);
        let index = MatcherBuilder::new(10.0).build(&store).unwrap();
        let m = index.find_best_match(&q(&[0.0, 0.0])).unwrap();
        assert_eq!(m.label.as_deref(), Some("First"));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "A", &[&[0.0, 0.0]]);
        let index = MatcherBuilder::new(1.0).build(&store).unwrap();
        assert!(index.find_best_match(&q(&[1.0, 0.0])).unwrap().is_known());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "A", &[&[0.0, 0.0]]);
        let index = MatcherBuilder::default().build(&store).unwrap();
        let err = index.find_best_match(&q(&[0.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, MatcherError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_wrong_length_descriptors_skipped() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "Short", &[&[0.0]]);
        put(&mut store, "Good", &[&[0.0, 0.0]]);
        let index = MatcherBuilder::default().descriptor_len(2).build(&store).unwrap();
        assert_eq!(index.labels().collect::<Vec<_>>(), vec!["Good"]);
    }

    #[test]
    fn test_cosine_metric() {
        let mut store = KvLabelStore::new(MemoryKv::new());
        put(&mut store, "Right", &[&[1.0, 0.0]]);
        put(&mut store, "Up", &[&[0.0, 1.0]]);
        let index = MatcherBuilder::new(0.5).metric(Metric::Cosine).build(&store).unwrap();
        let m = index.find_best_match(&q(&[5.0, 0.5])).unwrap();
        assert_eq!(m.label.as_deref(), Some("Right"));
        assert!(m.distance < 0.01);
    }

    #[test]
    fn test_display() {
        let known = MatchResult { label: Some("Alice".into()), distance: 0.4213 };
        let unknown = MatchResult { label: None, distance: 0.9 };
        assert_eq!(known.to_string(), "Alice (0.42)");
        assert_eq!(unknown.to_string(), "unknown (0.90)");
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert!("manhattan".parse::<Metric>().is_err());
    }
}

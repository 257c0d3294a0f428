//! Live weight store with snapshots and quality-gated rollback.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::WeightSettings;
use crate::error::{ContinualError, Result};

/// Name-keyed flat weight buffers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightStore {
    tensors: BTreeMap<String, Vec<f32>>,
}

impl WeightStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.tensors.get(name).map(Vec::as_slice)
    }

    /// Mutable buffer for `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<f32>> {
        self.tensors.get_mut(name)
    }

    /// Buffer for `name`, which must hold exactly `len` values.
    ///
    /// # Errors
    ///
    /// Returns a shape error (with `actual = 0` when missing).
    pub fn require(&self, name: &str, len: usize) -> Result<&[f32]> {
        match self.tensors.get(name) {
            Some(t) if t.len() == len => Ok(t),
            Some(t) => Err(ContinualError::shape(name, len, t.len())),
            None => Err(ContinualError::shape(name, len, 0)),
        }
    }

    /// Insert or replace a buffer.
    pub fn set(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.tensors.insert(name.into(), values);
    }

    /// Whether `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.tensors.iter()
    }

    /// Tensor names in order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of values.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(Vec::len).sum()
    }

    /// Owned name to buffer map.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, Vec<f32>> {
        self.tensors.clone()
    }
}

impl From<BTreeMap<String, Vec<f32>>> for WeightStore {
    fn from(tensors: BTreeMap<String, Vec<f32>>) -> Self {
        Self { tensors }
    }
}

/// Quality figures attached to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Training loss.
    pub loss: f32,
    /// Accuracy, if measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
}

impl QualityMetrics {
    /// Metrics carrying only a loss.
    #[must_use]
    pub fn from_loss(loss: f32) -> Self {
        Self {
            loss,
            accuracy: None,
        }
    }
}

/// Immutable deep copy of all weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    /// Monotonic id.
    pub id: u64,
    /// Creation time (ms).
    pub timestamp: i64,
    /// Copied weights.
    pub weights: WeightStore,
    /// Metrics at snapshot time.
    pub metrics: Option<QualityMetrics>,
}

/// Sole writer of the live weights.
#[derive(Debug, Clone)]
pub struct WeightUpdater {
    store: WeightStore,
    snapshots: VecDeque<WeightSnapshot>,
    max_snapshots: usize,
    rollback_threshold: f32,
    last_metrics: Option<QualityMetrics>,
    next_id: u64,
}

impl WeightUpdater {
    /// Wrap an initial weight set.
    #[must_use]
    pub fn new(store: WeightStore, settings: &WeightSettings) -> Self {
        Self {
            store,
            snapshots: VecDeque::new(),
            max_snapshots: settings.max_snapshots.max(1),
            rollback_threshold: settings.rollback_threshold,
            last_metrics: None,
            next_id: 0,
        }
    }

    /// Live weights.
    #[must_use]
    pub fn weights(&self) -> &WeightStore {
        &self.store
    }

    /// Live buffer for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.store.get(name)
    }

    /// `weight += alpha · delta`. Returns `false` (and logs) for unknown names.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `delta` has the wrong length.
    pub fn apply_update(&mut self, name: &str, delta: &[f32], alpha: f32) -> Result<bool> {
        let Some(weight) = self.store.get_mut(name) else {
            warn!(name, "update for unknown weight ignored");
            return Ok(false);
        };
        if weight.len() != delta.len() {
            return Err(ContinualError::shape(name, weight.len(), delta.len()));
        }
        for (w, d) in weight.iter_mut().zip(delta) {
            *w += alpha * d;
        }
        Ok(true)
    }

    /// Replace a buffer outright. Returns `false` for unknown names.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `values` has the wrong length.
    pub fn replace(&mut self, name: &str, values: Vec<f32>) -> Result<bool> {
        let Some(weight) = self.store.get_mut(name) else {
            warn!(name, "replacement for unknown weight ignored");
            return Ok(false);
        };
        if weight.len() != values.len() {
            return Err(ContinualError::shape(name, weight.len(), values.len()));
        }
        *weight = values;
        Ok(true)
    }

    /// Deep-copy the live weights. The oldest snapshot is evicted past the limit.
    pub fn create_snapshot(&mut self, metrics: Option<QualityMetrics>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.snapshots.push_back(WeightSnapshot {
            id,
            timestamp: crate::clock::now_ms(),
            weights: self.store.clone(),
            metrics,
        });
        while self.snapshots.len() > self.max_snapshots {
            if let Some(old) = self.snapshots.pop_front() {
                debug!(snapshot = old.id, "evicted oldest snapshot");
            }
        }
        if metrics.is_some() {
            self.last_metrics = metrics;
        }
        info!(snapshot = id, loss = ?metrics.map(|m| m.loss), "created weight snapshot");
        id
    }

    /// Whether `current` is worse than the last recorded metrics by more than
    /// the rollback threshold.
    #[must_use]
    pub fn should_rollback(&self, current: &QualityMetrics) -> bool {
        let Some(last) = self.last_metrics else {
            return false;
        };
        let t = self.rollback_threshold;
        if current.loss > last.loss * (1.0 + t) {
            return true;
        }
        matches!(
            (current.accuracy, last.accuracy),
            (Some(now), Some(before)) if now < before * (1.0 - t)
        )
    }

    /// Restore weights from snapshot `index` (oldest is 0), or the most recent.
    /// Returns `false` if there is no such snapshot.
    pub fn rollback(&mut self, index: Option<usize>) -> bool {
        let idx = match index {
            Some(i) => i,
            None if self.snapshots.is_empty() => {
                warn!("rollback requested but no snapshots exist");
                return false;
            }
            None => self.snapshots.len() - 1,
        };
        let Some(snapshot) = self.snapshots.get(idx) else {
            warn!(index = idx, available = self.snapshots.len(), "rollback index out of range");
            return false;
        };
        self.store = snapshot.weights.clone();
        self.last_metrics = snapshot.metrics;
        info!(snapshot = snapshot.id, "rolled back weights");
        true
    }

    /// Snapshots, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> &VecDeque<WeightSnapshot> {
        &self.snapshots
    }

    /// Metrics the next rollback decision compares against.
    #[must_use]
    pub fn last_metrics(&self) -> Option<QualityMetrics> {
        self.last_metrics
    }

    /// Copy of every live buffer.
    #[must_use]
    pub fn export_weights(&self) -> BTreeMap<String, Vec<f32>> {
        self.store.to_map()
    }

    /// Replace the live weights and snapshot the result.
    pub fn import_weights(&mut self, weights: BTreeMap<String, Vec<f32>>) -> u64 {
        info!(tensors = weights.len(), "importing weights");
        self.store = WeightStore::from(weights);
        self.create_snapshot(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updater() -> WeightUpdater {
        let mut store = WeightStore::new();
        store.set("w", vec![1.0, 2.0, 3.0]);
        WeightUpdater::new(store, &WeightSettings::default())
    }

    #[test]
    fn test_snapshot_update_rollback() {
        let mut u = updater();
        u.create_snapshot(None);
        assert!(u.apply_update("w", &[1.0, 1.0, 1.0], 1.0).unwrap());
        assert_eq!(u.get("w").unwrap(), &[2.0, 3.0, 4.0]);
        assert!(u.rollback(None));
        assert_eq!(u.get("w").unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_unknown_name_is_noop() {
        let mut u = updater();
        assert!(!u.apply_update("missing", &[1.0], 1.0).unwrap());
        assert!(u.apply_update("w", &[1.0], 1.0).is_err());
    }

    #[test]
    fn test_rollback_without_snapshots_fails() {
        let mut u = updater();
        assert!(!u.rollback(None));
        u.create_snapshot(None);
        assert!(!u.rollback(Some(3)));
        assert!(u.rollback(Some(0)));
    }

    #[test]
    fn test_snapshots_are_bounded() {
        let mut store = WeightStore::new();
        store.set("w", vec![0.0]);
        let mut u = WeightUpdater::new(
            store,
            &WeightSettings {
                max_snapshots: 2,
                ..Default::default()
            },
        );
        for i in 0..5 {
            u.apply_update("w", &[1.0], 1.0).unwrap();
            assert_eq!(u.create_snapshot(None), i);
        }
        assert_eq!(u.snapshots().len(), 2);
        assert_eq!(u.snapshots()[0].id, 3);
        assert!(u.rollback(Some(0)));
        assert_eq!(u.get("w").unwrap(), &[4.0]);
    }

    #[test]
    fn test_should_rollback() {
        let mut u = updater();
        assert!(!u.should_rollback(&QualityMetrics::from_loss(100.0)));

        u.create_snapshot(Some(QualityMetrics {
            loss: 1.0,
            accuracy: Some(0.8),
        }));
        assert!(!u.should_rollback(&QualityMetrics::from_loss(1.05)));
        assert!(u.should_rollback(&QualityMetrics::from_loss(1.2)));
        assert!(u.should_rollback(&QualityMetrics {
            loss: 1.0,
            accuracy: Some(0.7),
        }));
        assert!(!u.should_rollback(&QualityMetrics {
            loss: 1.0,
            accuracy: Some(0.75),
        }));
    }

    #[test]
    fn test_rollback_restores_snapshot_metrics() {
        let mut u = updater();
        u.create_snapshot(Some(QualityMetrics::from_loss(2.0)));
        u.create_snapshot(Some(QualityMetrics::from_loss(1.0)));
        assert!(u.rollback(Some(0)));
        assert_eq!(u.last_metrics().unwrap().loss, 2.0);
    }

    #[test]
    fn test_import_creates_snapshot() {
        let mut u = updater();
        let mut map = BTreeMap::new();
        map.insert("x".to_string(), vec![9.0]);
        u.import_weights(map.clone());
        assert_eq!(u.snapshots().len(), 1);
        assert_eq!(u.export_weights(), map);
        assert!(!u.weights().contains("w"));
    }
}

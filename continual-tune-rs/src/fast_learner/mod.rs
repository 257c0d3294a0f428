//! Fast learning: episodic recall plus a plastic spiking network.
//!
//! Examples that closely match a stored memory are recalled and skip gradient
//! descent entirely. New examples are stored and imprinted on the spiking
//! network with one Hebbian update.
//!
//! # Example
//!
//! ```rust
//! use continual_tune_rs::config::FastLearnerSettings;
//! use continual_tune_rs::example::{ExampleSource, Priority, TrainingExample};
//! use continual_tune_rs::fast_learner::FastLearner;
//!
//! let mut learner = FastLearner::new(&FastLearnerSettings::default());
//! let ex = TrainingExample::new("what is rust?", "a language", Priority::High, ExampleSource::Chat);
//!
//! let first = learner.learn_fast(&ex, 0);
//! let second = learner.learn_fast(&ex, 1);
//! assert!(first.learned && !first.recall);
//! assert!(!second.learned && second.recall);
//! ```

pub mod encoding;
pub mod memory;
pub mod spiking;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use encoding::{cosine_similarity, encode_text, rmse, ENCODING_DIM};
pub use memory::{EpisodicMemory, MemoryStore};
pub use spiking::{Connection, NetworkStats, SpikingNetwork};

use crate::config::FastLearnerSettings;
use crate::error::{ContinualError, Result};
use crate::example::TrainingExample;

/// Serialization version of [`FastLearnerState`].
pub const FAST_LEARNER_STATE_VERSION: u32 = 1;

/// Bounds for the adaptive meta learning rate.
pub const META_RATE_MIN: f32 = 0.001;
/// Upper bound for the adaptive meta learning rate.
pub const META_RATE_MAX: f32 = 0.1;

const TREND_WINDOW: usize = 10;
const HISTORY_LIMIT: usize = 1000;

/// Result of [`FastLearner::learn_fast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LearnOutcome {
    /// A new memory was stored.
    pub learned: bool,
    /// An existing memory matched.
    pub recall: bool,
}

/// Result of [`FastLearner::meta_learn`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetaLearnReport {
    /// Mean prediction RMSE over the batch.
    pub mean_error: f32,
    /// Examples whose error exceeded the adaptive threshold.
    pub updates: usize,
    /// Meta learning rate after adaptation.
    pub learning_rate: f32,
}

/// Read-only projection of fast learner counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FastLearnerStats {
    /// Stored memories.
    pub memories: usize,
    /// Mean importance across memories.
    pub mean_importance: f32,
    /// Current meta learning rate.
    pub meta_learning_rate: f32,
    /// Length of the learning history.
    pub history_len: usize,
    /// Most recent mean error, if any.
    pub last_error: Option<f32>,
    /// Network counters.
    pub network: NetworkStats,
}

/// Persisted fast learner state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastLearnerState {
    /// Schema version.
    pub version: u32,
    /// Episodic memories.
    pub memories: Vec<EpisodicMemory>,
    /// Mean error per meta-learning batch, oldest first.
    pub learning_history: Vec<f32>,
    /// Adapted meta learning rate.
    pub meta_learning_rate: f32,
    /// Spiking network connectivity.
    pub connections: Vec<Connection>,
}

/// Episodic memory plus spiking network.
#[derive(Debug, Clone)]
pub struct FastLearner {
    settings: FastLearnerSettings,
    memory: MemoryStore,
    network: SpikingNetwork,
    learning_history: VecDeque<f32>,
    meta_learning_rate: f32,
}

impl FastLearner {
    /// Create a learner with an empty memory and a freshly wired network.
    #[must_use]
    pub fn new(settings: &FastLearnerSettings) -> Self {
        Self {
            memory: MemoryStore::new(settings.memory_capacity, settings.similarity_threshold),
            network: SpikingNetwork::new(settings),
            learning_history: VecDeque::new(),
            meta_learning_rate: settings
                .meta_learning_rate
                .clamp(META_RATE_MIN, META_RATE_MAX),
            settings: settings.clone(),
        }
    }

    /// Recall `example` if a similar memory exists, otherwise store it.
    pub fn learn_fast(&mut self, example: &TrainingExample, now: i64) -> LearnOutcome {
        let input = encode_text(&example.input);

        if let Some(hit) = self.memory.recall(&input, now) {
            debug!(id = %example.id, memory = %hit.id, "fast learner recall");
            return LearnOutcome {
                learned: false,
                recall: true,
            };
        }

        let output = encode_text(&example.output);
        self.network
            .hebbian_learning(&input, &output, self.settings.plasticity_rate);
        self.memory.push(EpisodicMemory {
            id: example.id.clone(),
            input_encoding: input,
            output_encoding: output,
            context: example.output.clone(),
            timestamp: now,
            access_count: 1,
            last_accessed: now,
            importance: 1.0,
        });

        if self.memory.over_capacity() {
            let dropped = self.memory.consolidate(now);
            let pruned = self.network.prune_connections(self.settings.prune_threshold);
            debug!(dropped, pruned, "consolidated episodic memory");
        }

        LearnOutcome {
            learned: true,
            recall: false,
        }
    }

    /// Error threshold above which an example gets another Hebbian update.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn adaptive_threshold(&self) -> f32 {
        if self.learning_history.is_empty() {
            return self.settings.meta_error_threshold;
        }
        let recent: Vec<f32> = self
            .learning_history
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .copied()
            .collect();
        recent.iter().sum::<f32>() / recent.len() as f32
    }

    /// Predict, measure, and reinforce on each example, then adapt the meta rate.
    #[allow(clippy::cast_precision_loss)]
    pub fn meta_learn(&mut self, batch: &[TrainingExample]) -> MetaLearnReport {
        if batch.is_empty() {
            return MetaLearnReport {
                mean_error: 0.0,
                updates: 0,
                learning_rate: self.meta_learning_rate,
            };
        }

        let threshold = self.adaptive_threshold();
        let mut total_error = 0.0;
        let mut updates = 0;
        for example in batch {
            let input = encode_text(&example.input);
            let target = encode_text(&example.output);
            let prediction = self.network.forward(&input);
            let error = rmse(&prediction, &target);
            total_error += error;
            if error > threshold {
                self.network
                    .hebbian_learning(&input, &target, self.meta_learning_rate);
                updates += 1;
            }
        }

        let mean_error = total_error / batch.len() as f32;
        self.learning_history.push_back(mean_error);
        while self.learning_history.len() > HISTORY_LIMIT {
            self.learning_history.pop_front();
        }
        self.adapt_meta_rate();

        debug!(
            mean_error,
            updates,
            meta_lr = self.meta_learning_rate,
            "meta-learning pass"
        );
        MetaLearnReport {
            mean_error,
            updates,
            learning_rate: self.meta_learning_rate,
        }
    }

    fn adapt_meta_rate(&mut self) {
        let n = self.learning_history.len();
        if n < TREND_WINDOW {
            return;
        }
        let first = self.learning_history[n - TREND_WINDOW];
        let last = self.learning_history[n - 1];
        let factor = if last - first < 0.0 { 1.05 } else { 0.95 };
        self.meta_learning_rate = (self.meta_learning_rate * factor).clamp(META_RATE_MIN, META_RATE_MAX);
    }

    /// Network prediction (firing histogram) for `input`.
    pub fn predict(&mut self, input: &str) -> Vec<f32> {
        self.network.forward(&encode_text(input))
    }

    /// Remove weak connections from the network.
    pub fn prune_connections(&mut self, threshold: f32) -> usize {
        self.network.prune_connections(threshold)
    }

    /// Stored memories.
    #[must_use]
    pub fn memories(&self) -> &[EpisodicMemory] {
        self.memory.memories()
    }

    /// The spiking network.
    #[must_use]
    pub fn network(&self) -> &SpikingNetwork {
        &self.network
    }

    /// Current meta learning rate.
    #[must_use]
    pub fn meta_learning_rate(&self) -> f32 {
        self.meta_learning_rate
    }

    /// Mean error per meta-learning batch.
    #[must_use]
    pub fn learning_history(&self) -> &VecDeque<f32> {
        &self.learning_history
    }

    /// Counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> FastLearnerStats {
        let memories = self.memory.memories();
        let mean_importance = if memories.is_empty() {
            0.0
        } else {
            memories.iter().map(|m| m.importance).sum::<f32>() / memories.len() as f32
        };
        FastLearnerStats {
            memories: memories.len(),
            mean_importance,
            meta_learning_rate: self.meta_learning_rate,
            history_len: self.learning_history.len(),
            last_error: self.learning_history.back().copied(),
            network: self.network.stats(),
        }
    }

    /// Snapshot memories, history, meta rate, and connectivity.
    #[must_use]
    pub fn export_state(&self) -> FastLearnerState {
        FastLearnerState {
            version: FAST_LEARNER_STATE_VERSION,
            memories: self.memory.memories().to_vec(),
            learning_history: self.learning_history.iter().copied().collect(),
            meta_learning_rate: self.meta_learning_rate,
            connections: self.network.export_connections(),
        }
    }

    /// Restore a state produced by [`FastLearner::export_state`].
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] if the state's schema version
    /// does not match.
    pub fn import_state(&mut self, state: FastLearnerState) -> Result<()> {
        if state.version != FAST_LEARNER_STATE_VERSION {
            return Err(ContinualError::Checkpoint(format!(
                "fast learner state version {} (expected {FAST_LEARNER_STATE_VERSION})",
                state.version
            )));
        }
        info!(
            memories = state.memories.len(),
            connections = state.connections.len(),
            "restoring fast learner state"
        );
        self.memory.replace(state.memories);
        self.learning_history = state.learning_history.into();
        self.meta_learning_rate = state.meta_learning_rate.clamp(META_RATE_MIN, META_RATE_MAX);
        self.network.import_connections(&state.connections);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::{ExampleSource, Priority};

    fn ex(id: &str, input: &str, output: &str) -> TrainingExample {
        TrainingExample::new(input, output, Priority::Medium, ExampleSource::Manual).with_id(id)
    }

    #[test]
    fn test_idempotent_recall() {
        let mut learner = FastLearner::new(&FastLearnerSettings::default());
        let e = ex("e1", "the quick brown fox", "jumps");

        assert_eq!(
            learner.learn_fast(&e, 10),
            LearnOutcome {
                learned: true,
                recall: false
            }
        );
        assert_eq!(
            learner.learn_fast(&e, 20),
            LearnOutcome {
                learned: false,
                recall: true
            }
        );
        assert_eq!(learner.memories().len(), 1);
        assert_eq!(learner.memories()[0].access_count, 2);
        assert_eq!(learner.memories()[0].last_accessed, 20);
    }

    #[test]
    fn test_dissimilar_input_is_learned() {
        let mut learner = FastLearner::new(&FastLearnerSettings::default());
        learner.learn_fast(&ex("a", "aaaaaaa", "x"), 0);
        let outcome = learner.learn_fast(&ex("b", "zzzz 9999", "y"), 1);
        assert!(outcome.learned);
        assert_eq!(learner.memories().len(), 2);
    }

    #[test]
    fn test_consolidation_bounds_memory() {
        let settings = FastLearnerSettings {
            memory_capacity: 3,
            ..Default::default()
        };
        let mut learner = FastLearner::new(&settings);
        let texts = ["aaaa", "bbbb", "cccc", "dddd", "eeee"];
        for (i, t) in texts.iter().enumerate() {
            learner.learn_fast(&ex(t, t, "o"), i as i64 * 100);
        }
        assert_eq!(learner.memories().len(), 3);
    }

    #[test]
    fn test_threshold_defaults_then_tracks_history() {
        let mut learner = FastLearner::new(&FastLearnerSettings::default());
        assert!((learner.adaptive_threshold() - 0.05).abs() < 1e-6);
        let report = learner.meta_learn(&[ex("a", "hello", "world")]);
        assert!((learner.adaptive_threshold() - report.mean_error).abs() < 1e-6);
        assert_eq!(learner.learning_history().len(), 1);
    }

    #[test]
    fn test_meta_rate_adapts_and_clamps() {
        let mut learner = FastLearner::new(&FastLearnerSettings::default());
        // Rising errors: rate decays.
        learner.learning_history = (0..10).map(|i| i as f32).collect();
        learner.adapt_meta_rate();
        assert!((learner.meta_learning_rate() - 0.0095).abs() < 1e-6);

        // Falling errors: rate grows, but never past the cap.
        learner.learning_history = (0..10).rev().map(|i| i as f32).collect();
        for _ in 0..200 {
            learner.adapt_meta_rate();
        }
        assert!((learner.meta_learning_rate() - META_RATE_MAX).abs() < 1e-6);

        learner.learning_history = (0..10).map(|i| i as f32).collect();
        for _ in 0..500 {
            learner.adapt_meta_rate();
        }
        assert!((learner.meta_learning_rate() - META_RATE_MIN).abs() < 1e-6);
    }

    #[test]
    fn test_meta_learn_empty_batch() {
        let mut learner = FastLearner::new(&FastLearnerSettings::default());
        let report = learner.meta_learn(&[]);
        assert_eq!(report.updates, 0);
        assert!(learner.learning_history().is_empty());
    }

    #[test]
    fn test_state_roundtrip() {
        let mut learner = FastLearner::new(&FastLearnerSettings::default());
        learner.learn_fast(&ex("a", "abc", "def"), 5);
        learner.meta_learn(&[ex("b", "ghi", "jkl")]);
        let state = learner.export_state();

        let json = serde_json::to_string(&state).unwrap();
        let restored: FastLearnerState = serde_json::from_str(&json).unwrap();

        let mut other = FastLearner::new(&FastLearnerSettings {
            seed: 7,
            ..Default::default()
        });
        other.import_state(restored).unwrap();
        assert_eq!(other.memories(), learner.memories());
        assert_eq!(other.learning_history(), learner.learning_history());
        assert_eq!(
            other.network().export_connections(),
            learner.network().export_connections()
        );

        let mut bad = learner.export_state();
        bad.version = 99;
        assert!(other.import_state(bad).is_err());
    }
}

//! Episodic memory store with similarity recall and consolidation.

use serde::{Deserialize, Serialize};

use super::encoding::cosine_similarity;

/// One remembered input/output pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicMemory {
    /// Id of the example that created the memory.
    pub id: String,
    /// Encoded input text.
    pub input_encoding: Vec<f32>,
    /// Encoded output text.
    pub output_encoding: Vec<f32>,
    /// Output text kept for inspection.
    pub context: String,
    /// Creation time (ms).
    pub timestamp: i64,
    /// Number of times this memory was stored or recalled. Always >= 1.
    pub access_count: u32,
    /// Last recall time (ms).
    pub last_accessed: i64,
    /// Importance weight, scaled up on every recall.
    pub importance: f32,
}

impl EpisodicMemory {
    /// Retention score: `importance * ln(access_count + 1) / (now - last_accessed + 1)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn consolidation_score(&self, now: i64) -> f32 {
        let age = (now - self.last_accessed).max(0) as f32;
        self.importance * (self.access_count as f32 + 1.0).ln() / (age + 1.0)
    }
}

/// Growth factor applied to importance on recall.
pub const RECALL_IMPORTANCE_GAIN: f32 = 1.1;

/// Flat list of memories searched by cosine similarity.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    memories: Vec<EpisodicMemory>,
    capacity: usize,
    similarity_threshold: f32,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(capacity: usize, similarity_threshold: f32) -> Self {
        Self {
            memories: Vec::new(),
            capacity,
            similarity_threshold,
        }
    }

    /// Index and similarity of the best memory at or above the threshold.
    #[must_use]
    pub fn best_match(&self, encoding: &[f32]) -> Option<(usize, f32)> {
        self.memories
            .iter()
            .enumerate()
            .map(|(i, m)| (i, cosine_similarity(&m.input_encoding, encoding)))
            .filter(|&(_, sim)| sim >= self.similarity_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Try to recall `encoding`. On a hit, refreshes the memory and returns it.
    pub fn recall(&mut self, encoding: &[f32], now: i64) -> Option<&EpisodicMemory> {
        let (idx, _) = self.best_match(encoding)?;
        let memory = &mut self.memories[idx];
        memory.access_count = memory.access_count.saturating_add(1);
        memory.last_accessed = now;
        memory.importance *= RECALL_IMPORTANCE_GAIN;
        Some(memory)
    }

    /// Append a memory.
    pub fn push(&mut self, memory: EpisodicMemory) {
        self.memories.push(memory);
    }

    /// Whether the store holds more than its capacity.
    #[must_use]
    pub fn over_capacity(&self) -> bool {
        self.memories.len() > self.capacity
    }

    /// Keep the `capacity` highest-scoring memories. Returns how many were dropped.
    pub fn consolidate(&mut self, now: i64) -> usize {
        if !self.over_capacity() {
            return 0;
        }
        let before = self.memories.len();
        self.memories.sort_by(|a, b| {
            b.consolidation_score(now)
                .total_cmp(&a.consolidation_score(now))
        });
        self.memories.truncate(self.capacity);
        before - self.memories.len()
    }

    /// All memories.
    #[must_use]
    pub fn memories(&self) -> &[EpisodicMemory] {
        &self.memories
    }

    /// Replace all memories.
    pub fn replace(&mut self, memories: Vec<EpisodicMemory>) {
        self.memories = memories;
    }

    /// Number of memories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memories.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

//! Priority-ordered, deduplicated example queue.
//!
//! The queue is always sorted by `(priority desc, timestamp desc)`. Ids stay
//! blocked while the example is enqueued and, after [`ExampleQueue::remove_batch`],
//! for as long as they remain in the bounded processed history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::QueueSettings;
use crate::example::{ExampleSource, Priority, TrainingExample};

/// Bounded FIFO set of ids that have already been trained on.
#[derive(Debug, Default)]
struct ProcessedIds {
    order: VecDeque<String>,
    members: HashSet<String>,
    limit: usize,
}

impl ProcessedIds {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            limit,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    fn insert(&mut self, id: String) {
        if self.limit == 0 || !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Read-only projection of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Enqueued examples.
    pub total: usize,
    /// Enqueued examples per priority.
    pub by_priority: HashMap<Priority, usize>,
    /// Enqueued examples per source.
    pub by_source: HashMap<ExampleSource, usize>,
    /// Ids remembered as processed.
    pub processed_ids: usize,
    /// Configured capacity.
    pub capacity: usize,
}

/// Priority queue of training examples.
#[derive(Debug)]
pub struct ExampleQueue {
    items: Vec<TrainingExample>,
    enqueued: HashSet<String>,
    processed: ProcessedIds,
    capacity: usize,
}

impl ExampleQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            items: Vec::new(),
            enqueued: HashSet::new(),
            processed: ProcessedIds::new(settings.processed_history),
            capacity: settings.capacity.max(1),
        }
    }

    /// Create a queue with the given capacity and default history.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&QueueSettings {
            capacity,
            ..Default::default()
        })
    }

    /// Insert an example. Returns `false` if its id was already seen, or if
    /// the queue was full and the example itself ranked lowest and was evicted.
    pub fn add(&mut self, example: TrainingExample) -> bool {
        if self.enqueued.contains(&example.id) || self.processed.contains(&example.id) {
            debug!(id = %example.id, "skipping duplicate example");
            return false;
        }

        let id = example.id.clone();
        self.enqueued.insert(id.clone());
        let pos = self
            .items
            .partition_point(|existing| existing.rank() >= example.rank());
        self.items.insert(pos, example);

        if self.items.len() > self.capacity {
            if let Some(evicted) = self.items.pop() {
                debug!(id = %evicted.id, "queue full, evicting lowest-ranked example");
                self.enqueued.remove(&evicted.id);
                return evicted.id != id;
            }
        }
        true
    }

    /// Insert examples one by one. Returns how many were accepted.
    pub fn add_batch(&mut self, examples: impl IntoIterator<Item = TrainingExample>) -> usize {
        examples
            .into_iter()
            .map(|e| self.add(e))
            .filter(|&added| added)
            .count()
    }

    /// First `n` examples in queue order, without removing them.
    #[must_use]
    pub fn get_batch(&self, n: usize) -> Vec<TrainingExample> {
        self.items.iter().take(n).cloned().collect()
    }

    /// Remove the given ids and remember them as processed.
    pub fn remove_batch<S: AsRef<str>>(&mut self, ids: &[S]) {
        let ids: HashSet<&str> = ids.iter().map(AsRef::as_ref).collect();
        self.items.retain(|e| !ids.contains(e.id.as_str()));
        for id in ids {
            self.enqueued.remove(id);
            self.processed.insert(id.to_string());
        }
    }

    /// Number of enqueued examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop all examples and forget all ids.
    pub fn clear(&mut self) {
        self.items.clear();
        self.enqueued.clear();
        self.processed.clear();
    }

    /// Counters by priority and source.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.items.len(),
            processed_ids: self.processed.len(),
            capacity: self.capacity,
            ..Default::default()
        };
        for item in &self.items {
            *stats.by_priority.entry(item.priority).or_default() += 1;
            *stats.by_source.entry(item.metadata.source).or_default() += 1;
        }
        stats
    }
}

/// Queue handle shared between producers and the single training consumer.
///
/// Every operation takes the one mutex around the queue state.
#[derive(Debug, Clone)]
pub struct SharedQueue {
    inner: Arc<Mutex<ExampleQueue>>,
}

impl SharedQueue {
    /// Wrap a queue.
    #[must_use]
    pub fn new(queue: ExampleQueue) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
        }
    }

    /// See [`ExampleQueue::add`].
    pub fn add(&self, example: TrainingExample) -> bool {
        self.inner.lock().add(example)
    }

    /// See [`ExampleQueue::add_batch`].
    pub fn add_batch(&self, examples: impl IntoIterator<Item = TrainingExample>) -> usize {
        self.inner.lock().add_batch(examples)
    }

    /// See [`ExampleQueue::get_batch`].
    #[must_use]
    pub fn get_batch(&self, n: usize) -> Vec<TrainingExample> {
        self.inner.lock().get_batch(n)
    }

    /// See [`ExampleQueue::remove_batch`].
    pub fn remove_batch<S: AsRef<str>>(&self, ids: &[S]) {
        self.inner.lock().remove_batch(ids);
    }

    /// Number of enqueued examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// See [`ExampleQueue::clear`].
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// See [`ExampleQueue::stats`].
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats()
    }
}

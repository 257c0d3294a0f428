//! Activity-aware batch sizing.
//!
//! The host reports user input through [`ActivityTracker::notify_activity`]
//! and advances time with [`ActivityTracker::tick`]. While the user is
//! active, batches stay small so training never competes for long with the
//! foreground; once the activity timeout elapses they grow.

use serde::Serialize;
use tracing::debug;

use crate::config::BatchSettings;
use crate::example::TrainingExample;
use crate::queue::SharedQueue;

/// Coarse user-activity state with an inactivity timeout.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    timeout_ms: u64,
    last_activity: Option<i64>,
    active: bool,
}

impl ActivityTracker {
    /// Tracker that starts idle.
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            last_activity: None,
            active: false,
        }
    }

    /// Record a user input event at `now` (ms).
    pub fn notify_activity(&mut self, now: i64) {
        if !self.active {
            debug!("user became active");
        }
        self.last_activity = Some(now);
        self.active = true;
    }

    /// Advance to `now`; returns whether the user still counts as active.
    pub fn tick(&mut self, now: i64) -> bool {
        if let Some(last) = self.last_activity {
            let elapsed = u64::try_from(now.saturating_sub(last)).unwrap_or(0);
            if self.active && elapsed >= self.timeout_ms {
                debug!(elapsed_ms = elapsed, "user went idle");
                self.active = false;
            }
        }
        self.active
    }

    /// Current state, as of the last tick.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Time of the last input event.
    #[must_use]
    pub fn last_activity(&self) -> Option<i64> {
        self.last_activity
    }
}

/// Read-only projection of batch manager state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// User activity state.
    pub user_active: bool,
    /// Size the next batch would have with an unlimited queue.
    pub adaptive_size: usize,
    /// Batches handed out.
    pub batches_served: u64,
    /// Last input event (ms).
    pub last_activity: Option<i64>,
}

/// Chooses how many examples to train on next.
#[derive(Debug, Clone)]
pub struct BatchManager {
    settings: BatchSettings,
    activity: ActivityTracker,
    batches_served: u64,
}

impl BatchManager {
    /// Create a manager that starts in the idle state.
    #[must_use]
    pub fn new(settings: &BatchSettings) -> Self {
        Self {
            activity: ActivityTracker::new(settings.activity_timeout_ms),
            settings: settings.clone(),
            batches_served: 0,
        }
    }

    /// See [`ActivityTracker::notify_activity`].
    pub fn notify_activity(&mut self, now: i64) {
        self.activity.notify_activity(now);
    }

    /// See [`ActivityTracker::tick`].
    pub fn tick(&mut self, now: i64) -> bool {
        self.activity.tick(now)
    }

    /// Whether the user counts as active.
    #[must_use]
    pub fn is_user_active(&self) -> bool {
        self.activity.is_active()
    }

    /// Batch size for the current activity state.
    #[must_use]
    pub fn adaptive_size(&self) -> usize {
        let size = if self.activity.is_active() {
            self.settings.active_batch_size
        } else {
            self.settings.idle_batch_size
        };
        size.min(self.settings.max_batch_size)
    }

    /// Whether `queue_len` reaches the minimum batch size.
    #[must_use]
    pub fn has_enough_examples(&self, queue_len: usize) -> bool {
        queue_len >= self.settings.min_batch_size
    }

    /// Queue length required before training.
    #[must_use]
    pub fn min_batch_size(&self) -> usize {
        self.settings.min_batch_size
    }

    /// `min(adaptive size, queue length, max batch size)`.
    #[must_use]
    pub fn recommended_size(&self, queue_len: usize) -> usize {
        self.adaptive_size()
            .min(queue_len)
            .min(self.settings.max_batch_size)
    }

    /// Order by priority weight, then most recent first.
    pub fn sort_batch(batch: &mut [TrainingExample]) {
        batch.sort_by(|a, b| {
            b.priority
                .weight()
                .cmp(&a.priority.weight())
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
    }

    /// Read the next batch from `queue` without removing it.
    pub fn next_batch(&mut self, queue: &SharedQueue) -> Vec<TrainingExample> {
        let size = self.recommended_size(queue.len());
        if size == 0 {
            return Vec::new();
        }
        let mut batch = queue.get_batch(size);
        Self::sort_batch(&mut batch);
        self.batches_served += 1;
        debug!(size = batch.len(), user_active = self.is_user_active(), "selected batch");
        batch
    }

    /// Read-only counters.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            user_active: self.activity.is_active(),
            adaptive_size: self.adaptive_size(),
            batches_served: self.batches_served,
            last_activity: self.activity.last_activity(),
        }
    }
}

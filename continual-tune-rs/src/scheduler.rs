//! Cooperative background training scheduler.
//!
//! The host calls [`TrainingScheduler::tick`] on its own cadence (every
//! `check_interval_ms`) and passes an [`IdleDeadline`] describing how much
//! idle time the current slot has left. A tick either runs one bounded
//! training burst or returns the reason it declined. Nothing here spawns
//! threads or loops; the host owns the yield points.
//!
//! Inference and training never overlap: the host holds an
//! [`InferenceGuard`] around every inference call and ticks skip while any
//! guard is alive.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{BatchManager, BatchStats};
use crate::clock;
use crate::config::{ContinualConfig, SchedulerSettings};
use crate::engine::{BatchReport, TrainingEngine};
use crate::error::Result;
use crate::queue::{QueueStats, SharedQueue};

/// How much idle time the current scheduling slot has left.
pub trait IdleDeadline {
    /// Remaining idle time (ms).
    fn time_remaining_ms(&self) -> u64;
}

/// A slot with a fixed amount of idle time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBudget(pub u64);

impl IdleDeadline for FixedBudget {
    fn time_remaining_ms(&self) -> u64 {
        self.0
    }
}

/// A slot that ends at a wall-clock instant.
#[derive(Debug, Clone, Copy)]
pub struct InstantDeadline {
    until: Instant,
}

impl InstantDeadline {
    /// Slot ending `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            until: Instant::now() + budget,
        }
    }
}

impl IdleDeadline for InstantDeadline {
    fn time_remaining_ms(&self) -> u64 {
        let left = self.until.saturating_duration_since(Instant::now());
        u64::try_from(left.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Shared flag the host raises around inference calls.
#[derive(Debug, Clone, Default)]
pub struct InferenceSignal {
    in_flight: Arc<AtomicUsize>,
}

impl InferenceSignal {
    /// Mark an inference call as in flight until the guard drops.
    #[must_use = "inference is only signalled while the guard is alive"]
    pub fn begin(&self) -> InferenceGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InferenceGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Whether any inference call is in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }
}

/// Clears its share of the [`InferenceSignal`] on drop.
#[derive(Debug)]
pub struct InferenceGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InferenceGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Why a tick did not train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The scheduler is stopped.
    Stopped,
    /// A burst is already running.
    AlreadyTraining,
    /// An inference call is in flight.
    InferenceActive,
    /// The queue is below the minimum batch size.
    NotEnoughExamples {
        /// Examples queued.
        queued: usize,
        /// Examples required.
        required: usize,
    },
    /// The minimum spacing since the last burst has not elapsed.
    TooSoon {
        /// Time until the next burst is allowed (ms).
        wait_ms: u64,
    },
    /// The idle slot is too short to start a burst.
    BudgetExhausted {
        /// Idle time left (ms).
        remaining_ms: u64,
    },
}

/// What a burst did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstReport {
    /// Engine report for the batch.
    pub batch: BatchReport,
    /// Examples removed from the queue.
    pub removed: usize,
    /// Snapshot taken after this burst.
    pub snapshot: Option<u64>,
    /// Whether quality dropped and the engine rolled back.
    pub rolled_back: bool,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// A burst ran.
    Trained(BurstReport),
    /// The tick declined to train.
    Skipped(SkipReason),
}

impl TickOutcome {
    /// Whether a burst ran.
    #[must_use]
    pub fn trained(&self) -> bool {
        matches!(self, Self::Trained(_))
    }
}

/// Read-only projection of scheduler counters.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Whether ticks may train.
    pub running: bool,
    /// Whether a burst is in flight.
    pub training: bool,
    /// Whether inference is in flight.
    pub inference_active: bool,
    /// Ticks observed.
    pub ticks: u64,
    /// Bursts run.
    pub bursts: u64,
    /// Ticks that declined.
    pub skipped: u64,
    /// Reason of the most recent skip.
    pub last_skip: Option<SkipReason>,
    /// Time of the last burst (ms).
    pub last_training_ms: Option<i64>,
    /// Snapshots taken by the scheduler.
    pub snapshots: u64,
    /// Rollbacks triggered by the scheduler.
    pub rollbacks: u64,
    /// Minimum spacing between bursts (ms).
    pub min_interval_ms: u64,
    /// Queue counters.
    pub queue: QueueStats,
    /// Batch manager counters.
    pub batch: BatchStats,
}

/// Summary of [`TrainingScheduler::run_until_drained`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DrainSummary {
    /// Bursts run.
    pub bursts: u64,
    /// Examples removed from the queue.
    pub examples: usize,
    /// Loss of the last burst.
    pub last_loss: Option<f32>,
    /// Whether the queue is empty.
    pub drained: bool,
}

/// Runs training bursts during idle time.
#[derive(Debug)]
pub struct TrainingScheduler {
    settings: SchedulerSettings,
    engine: Arc<Mutex<TrainingEngine>>,
    queue: SharedQueue,
    batch: BatchManager,
    inference: InferenceSignal,
    training: Arc<AtomicBool>,
    running: bool,
    last_training_ms: Option<i64>,
    ticks: u64,
    bursts: u64,
    skipped: u64,
    last_skip: Option<SkipReason>,
    snapshots: u64,
    rollbacks: u64,
}

impl TrainingScheduler {
    /// Scheduler that owns `engine`. Starts stopped.
    #[must_use]
    pub fn new(config: &ContinualConfig, engine: TrainingEngine, queue: SharedQueue) -> Self {
        Self::with_shared_engine(config, Arc::new(Mutex::new(engine)), queue)
    }

    /// Scheduler over an engine the host also holds.
    #[must_use]
    pub fn with_shared_engine(
        config: &ContinualConfig,
        engine: Arc<Mutex<TrainingEngine>>,
        queue: SharedQueue,
    ) -> Self {
        Self {
            settings: config.scheduler.clone(),
            engine,
            queue,
            batch: BatchManager::new(&config.batch),
            inference: InferenceSignal::default(),
            training: Arc::new(AtomicBool::new(false)),
            running: false,
            last_training_ms: None,
            ticks: 0,
            bursts: 0,
            skipped: 0,
            last_skip: None,
            snapshots: 0,
            rollbacks: 0,
        }
    }

    /// Allow ticks to train.
    pub fn start(&mut self) {
        if !self.running {
            info!(
                check_interval_ms = self.settings.check_interval_ms,
                min_interval_ms = self.settings.min_training_interval_ms(),
                "training scheduler started"
            );
        }
        self.running = true;
    }

    /// Stop future bursts. A burst already running completes.
    pub fn stop(&mut self) {
        if self.running {
            info!(bursts = self.bursts, "training scheduler stopped");
        }
        self.running = false;
    }

    /// Whether ticks may train.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether a burst is in flight.
    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    /// Handle the host uses to signal inference.
    #[must_use]
    pub fn inference_signal(&self) -> InferenceSignal {
        self.inference.clone()
    }

    /// Record a user input event.
    pub fn notify_activity(&mut self, now: i64) {
        self.batch.notify_activity(now);
    }

    /// Delay the host should wait before the next tick.
    #[must_use]
    pub fn next_check_delay(&self) -> Duration {
        Duration::from_millis(self.settings.check_interval_ms)
    }

    /// The engine handle.
    #[must_use]
    pub fn engine(&self) -> Arc<Mutex<TrainingEngine>> {
        Arc::clone(&self.engine)
    }

    /// The queue handle.
    #[must_use]
    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    fn skip(&mut self, reason: SkipReason) -> TickOutcome {
        self.skipped += 1;
        self.last_skip = Some(reason);
        debug!(?reason, "tick skipped");
        TickOutcome::Skipped(reason)
    }

    /// One cooperative check at `now` (ms).
    ///
    /// # Errors
    ///
    /// Propagates engine contract violations. The batch stays queued.
    pub fn tick(&mut self, now: i64, deadline: &dyn IdleDeadline) -> Result<TickOutcome> {
        self.ticks += 1;
        self.batch.tick(now);

        if !self.running {
            return Ok(self.skip(SkipReason::Stopped));
        }
        if self.inference.is_active() {
            return Ok(self.skip(SkipReason::InferenceActive));
        }
        if self.is_training() {
            return Ok(self.skip(SkipReason::AlreadyTraining));
        }
        let queued = self.queue.len();
        if !self.batch.has_enough_examples(queued) {
            return Ok(self.skip(SkipReason::NotEnoughExamples {
                queued,
                required: self.batch.min_batch_size(),
            }));
        }
        if let Some(last) = self.last_training_ms {
            let elapsed = u64::try_from(now.saturating_sub(last)).unwrap_or(0);
            let min = self.settings.min_training_interval_ms();
            if elapsed < min {
                return Ok(self.skip(SkipReason::TooSoon {
                    wait_ms: min - elapsed,
                }));
            }
        }
        let remaining_ms = deadline.time_remaining_ms();
        if remaining_ms < self.settings.min_idle_budget_ms {
            return Ok(self.skip(SkipReason::BudgetExhausted { remaining_ms }));
        }

        match self.burst(now)? {
            Some(report) => Ok(TickOutcome::Trained(report)),
            None => Ok(self.skip(SkipReason::AlreadyTraining)),
        }
    }

    /// Train one batch. `None` if another holder of the engine is training.
    fn burst(&mut self, now: i64) -> Result<Option<BurstReport>> {
        let handle = Arc::clone(&self.engine);
        let Some(mut engine) = handle.try_lock() else {
            return Ok(None);
        };
        let examples = self.batch.next_batch(&self.queue);
        if examples.is_empty() {
            return Ok(None);
        }

        self.training.store(true, Ordering::SeqCst);
        let result = engine.train_batch(&examples);
        self.training.store(false, Ordering::SeqCst);
        let batch = result?;

        let ids: Vec<&str> = examples.iter().map(|e| e.id.as_str()).collect();
        self.queue.remove_batch(&ids);
        self.last_training_ms = Some(now);
        self.bursts += 1;

        let mut report = BurstReport {
            batch,
            removed: ids.len(),
            snapshot: None,
            rolled_back: false,
        };

        let interval = self.settings.snapshot_interval.max(1);
        if self.bursts % interval == 0 {
            let window = usize::try_from(interval).unwrap_or(usize::MAX);
            if let Some(quality) = engine.recent_quality(window) {
                if engine.should_rollback(&quality) {
                    warn!(loss = quality.loss, "quality dropped, rolling back");
                    report.rolled_back = engine.rollback(None)?;
                    if report.rolled_back {
                        self.rollbacks += 1;
                    }
                } else {
                    report.snapshot = Some(engine.create_snapshot(Some(quality)));
                    self.snapshots += 1;
                }
            }
        }

        debug!(
            burst = self.bursts,
            examples = report.removed,
            loss = report.batch.metrics.loss,
            "training burst finished"
        );
        Ok(Some(report))
    }

    /// Tick on the wall clock until the queue is empty or `max_ticks` pass,
    /// sleeping between ticks. A final batch below the minimum size is
    /// trained as well.
    ///
    /// # Errors
    ///
    /// Propagates engine contract violations.
    pub fn run_until_drained(&mut self, max_ticks: u64, progress: bool) -> Result<DrainSummary> {
        let total = self.queue.len() as u64;
        let bar = if progress {
            ProgressBar::new(total)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} examples | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let was_running = self.running;
        self.start();
        let mut summary = DrainSummary::default();
        let budget = FixedBudget(u64::MAX);

        for _ in 0..max_ticks {
            if self.queue.is_empty() {
                break;
            }
            let now = clock::now_ms();
            let burst = match self.tick(now, &budget)? {
                TickOutcome::Trained(report) => Some(report),
                TickOutcome::Skipped(SkipReason::NotEnoughExamples { queued, .. }) if queued > 0 => {
                    self.burst(now)?
                }
                TickOutcome::Skipped(SkipReason::TooSoon { wait_ms }) => {
                    std::thread::sleep(Duration::from_millis(wait_ms));
                    None
                }
                TickOutcome::Skipped(_) => {
                    std::thread::sleep(self.next_check_delay());
                    None
                }
            };
            if let Some(report) = burst {
                summary.bursts += 1;
                summary.examples += report.removed;
                summary.last_loss = Some(report.batch.metrics.loss);
                bar.inc(report.removed as u64);
                bar.set_message(format!("loss: {:.4}", report.batch.metrics.loss));
            }
        }

        summary.drained = self.queue.is_empty();
        bar.finish_with_message(format!(
            "{} bursts, {} examples",
            summary.bursts, summary.examples
        ));
        if !was_running {
            self.stop();
        }
        Ok(summary)
    }

    /// Read-only counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running,
            training: self.is_training(),
            inference_active: self.inference.is_active(),
            ticks: self.ticks,
            bursts: self.bursts,
            skipped: self.skipped,
            last_skip: self.last_skip,
            last_training_ms: self.last_training_ms,
            snapshots: self.snapshots,
            rollbacks: self.rollbacks,
            min_interval_ms: self.settings.min_training_interval_ms(),
            queue: self.queue.stats(),
            batch: self.batch.stats(),
        }
    }
}

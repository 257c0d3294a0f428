//! Batch training orchestration.
//!
//! A batch moves through `Idle → FastPass → TraditionalPass → WeightUpdate →
//! MetricsEmit → Idle`. Examples the fast learner recalls skip gradient
//! descent. The rest are forwarded through the model, backpropagated, and
//! applied either to the LoRA adapters or, in full mode, to the base weights.
//!
//! # Example
//!
//! ```rust
//! use continual_tune_rs::example::{ExampleSource, Priority, TrainingExample};
//! use continual_tune_rs::{ContinualConfig, TrainingEngine};
//!
//! # fn main() -> continual_tune_rs::Result<()> {
//! let mut engine = TrainingEngine::with_reference_model(ContinualConfig::tiny_preset())?;
//! let batch = vec![TrainingExample::new("hi", "hello", Priority::High, ExampleSource::Chat)];
//!
//! let report = engine.train_batch(&batch)?;
//! assert_eq!(report.metrics.step, 1);
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{select_backend, ComputeBackend};
use crate::clock;
use crate::config::{ContinualConfig, ModelSettings, TrainingMode};
use crate::error::{ContinualError, Result};
use crate::example::TrainingExample;
use crate::fast_learner::{FastLearner, FastLearnerState, FastLearnerStats};
use crate::gradients::{self, clip_global_norm, cross_entropy};
use crate::lora::{LoraAdapter, LoraState};
use crate::lr_scheduler::LrSchedule;
use crate::model::{layer_param, names, parameter_shapes, InferenceEngine, TinyTransformer};
use crate::optimizer::AdamConfig;
use crate::tensor_ops;
use crate::weights::{QualityMetrics, WeightStore, WeightUpdater};

/// Serialization version of [`EngineState`].
pub const ENGINE_STATE_VERSION: u32 = 1;

/// Where the engine is inside a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    /// No batch in flight.
    #[default]
    Idle,
    /// Episodic recall and one-shot imprinting.
    FastPass,
    /// Forward, loss, and backward over the remaining examples.
    TraditionalPass,
    /// Optimizer step.
    WeightUpdate,
    /// Recording metrics and the upgrade decision.
    MetricsEmit,
}

/// One record of the append-only metrics log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Batch counter, starting at 1.
    pub step: u64,
    /// Mean loss over the examples that reached gradient descent.
    pub loss: f32,
    /// Learning rate used for this step.
    pub learning_rate: f32,
    /// Mean per-example gradient norm at the logits.
    pub grad_norm: f32,
    /// Examples in the batch.
    pub examples_processed: usize,
    /// Wall-clock time (ms).
    pub timestamp: i64,
    /// No example reached gradient descent; `loss` holds the configured floor.
    #[serde(default)]
    pub short_circuited: bool,
}

/// Cumulative routing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastLearningCounters {
    /// Examples stored as new memories.
    pub one_shot: u64,
    /// Examples recalled, which skipped gradient descent.
    pub recalled: u64,
    /// Examples that went through gradient descent.
    pub traditional: u64,
}

impl FastLearningCounters {
    /// Share of examples that bypassed gradient descent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f32 {
        let total = self.recalled + self.traditional;
        if total == 0 {
            0.0
        } else {
            self.recalled as f32 / total as f32
        }
    }
}

/// Outcome of [`TrainingEngine::train_batch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// Metrics record appended for this batch.
    pub metrics: TrainingMetrics,
    /// Examples newly stored by the fast learner.
    pub one_shot: usize,
    /// Examples recalled by the fast learner.
    pub recalled: usize,
    /// Examples that went through gradient descent.
    pub traditional: usize,
    /// Examples too short to produce a training target.
    pub skipped: usize,
    /// Whether the gradient pass was skipped entirely.
    pub short_circuited: bool,
    /// Whether this batch triggered the hybrid to full upgrade.
    pub upgraded: bool,
}

/// Read-only projection of engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Current mode.
    pub mode: TrainingMode,
    /// Current phase.
    pub phase: TrainingPhase,
    /// Batches trained.
    pub step: u64,
    /// Optimizer updates applied.
    pub optimizer_steps: u64,
    /// Length of the metrics log.
    pub metrics_recorded: usize,
    /// Most recent loss.
    pub last_loss: Option<f32>,
    /// Routing counters.
    pub counters: FastLearningCounters,
    /// Share of examples that bypassed gradient descent.
    pub fast_learning_ratio: f32,
    /// Base parameters.
    pub base_parameters: usize,
    /// Trainable LoRA parameters (0 in full mode).
    pub lora_parameters: usize,
    /// Weight snapshots held.
    pub snapshots: usize,
    /// Compute backend name.
    pub backend: String,
    /// Fast learner counters, when enabled.
    pub fast_learner: Option<FastLearnerStats>,
}

/// Everything needed to resume training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    /// Schema version.
    pub version: u32,
    /// Mode at save time.
    pub mode: TrainingMode,
    /// Batch counter.
    pub step: u64,
    /// Optimizer update counter.
    pub optimizer_steps: u64,
    /// Metrics log.
    pub metrics: Vec<TrainingMetrics>,
    /// Routing counters.
    pub counters: FastLearningCounters,
    /// Base weights.
    pub weights: BTreeMap<String, Vec<f32>>,
    /// Adapter weights, when training through LoRA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraState>,
    /// Fast learner memories and connectivity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_learner: Option<FastLearnerState>,
}

impl EngineState {
    /// Read a state file written by [`EngineState::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not a valid state.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ContinualError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        let state: Self = serde_json::from_str(&json)?;
        if state.version != ENGINE_STATE_VERSION {
            return Err(ContinualError::Checkpoint(format!(
                "engine state version {} (expected {ENGINE_STATE_VERSION})",
                state.version
            )));
        }
        Ok(state)
    }

    /// Write as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AdapterSnapshot {
    id: u64,
    mode: TrainingMode,
    lora: Option<LoraState>,
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Training orchestrator.
#[derive(Debug)]
pub struct TrainingEngine {
    config: ContinualConfig,
    mode: TrainingMode,
    phase: TrainingPhase,
    model: Box<dyn InferenceEngine>,
    backend: Arc<dyn ComputeBackend>,
    weights: WeightUpdater,
    lora: Option<LoraAdapter>,
    adapter_snapshots: VecDeque<AdapterSnapshot>,
    fast_learner: Option<FastLearner>,
    schedule: LrSchedule,
    adam: AdamConfig,
    full_moments: BTreeMap<String, Moments>,
    step: u64,
    optimizer_steps: u64,
    metrics: Vec<TrainingMetrics>,
    counters: FastLearningCounters,
}

impl TrainingEngine {
    /// Build an engine around `model` and its initial weights.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Config`] for an invalid configuration (for
    /// example LoRA or hybrid mode without a `lora` section) and a shape error
    /// if `initial_weights` does not match the model dimensions.
    pub fn new(
        config: ContinualConfig,
        model: Box<dyn InferenceEngine>,
        initial_weights: WeightStore,
    ) -> Result<Self> {
        config.validate()?;
        check_weights(model.dims(), &initial_weights)?;

        let backend = select_backend(config.backend)?;
        let lora = if config.mode.uses_lora() {
            let settings = config.lora.as_ref().ok_or_else(|| {
                ContinualError::Config(format!("{:?} mode requires a lora section", config.mode))
            })?;
            let mut adapter = LoraAdapter::new(settings, Arc::clone(&backend), config.seed);
            attach_adapters(&mut adapter, model.dims());
            Some(adapter)
        } else {
            None
        };
        let fast_learner = config
            .fast_learner
            .enabled
            .then(|| FastLearner::new(&config.fast_learner));

        info!(
            mode = ?config.mode,
            backend = backend.name(),
            base_parameters = initial_weights.parameter_count(),
            lora_parameters = lora.as_ref().map_or(0, LoraAdapter::parameter_count),
            fast_learner = fast_learner.is_some(),
            "training engine ready"
        );

        Ok(Self {
            mode: config.mode,
            phase: TrainingPhase::Idle,
            weights: WeightUpdater::new(initial_weights, &config.weights),
            schedule: LrSchedule::from_settings(&config.training),
            adam: AdamConfig::from(&config.training),
            model,
            backend,
            lora,
            adapter_snapshots: VecDeque::new(),
            fast_learner,
            full_moments: BTreeMap::new(),
            step: 0,
            optimizer_steps: 0,
            metrics: Vec::new(),
            counters: FastLearningCounters::default(),
            config,
        })
    }

    /// Engine over a freshly initialised [`TinyTransformer`].
    ///
    /// # Errors
    ///
    /// Same as [`TrainingEngine::new`].
    pub fn with_reference_model(config: ContinualConfig) -> Result<Self> {
        let model = TinyTransformer::new(config.model.clone())?;
        let weights = model.init_weights(config.seed);
        Self::new(config, Box::new(model), weights)
    }

    /// Train on one batch.
    ///
    /// # Errors
    ///
    /// Returns an error only for collaborator contract violations (malformed
    /// activations or weights) and backend failures.
    pub fn train_batch(&mut self, examples: &[TrainingExample]) -> Result<BatchReport> {
        let result = self.run_batch(examples);
        self.set_phase(TrainingPhase::Idle);
        result
    }

    fn set_phase(&mut self, phase: TrainingPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "phase transition");
            self.phase = phase;
        }
    }

    fn run_batch(&mut self, examples: &[TrainingExample]) -> Result<BatchReport> {
        self.step += 1;
        let learning_rate = self.schedule.lr_at(usize::try_from(self.step).unwrap_or(usize::MAX));
        let mut report = BatchReport {
            metrics: TrainingMetrics {
                step: self.step,
                loss: self.config.training.min_loss,
                learning_rate,
                grad_norm: 0.0,
                examples_processed: examples.len(),
                timestamp: clock::now_ms(),
                short_circuited: true,
            },
            one_shot: 0,
            recalled: 0,
            traditional: 0,
            skipped: 0,
            short_circuited: true,
            upgraded: false,
        };

        self.set_phase(TrainingPhase::FastPass);
        let remaining: Vec<&TrainingExample> = match self.fast_learner.as_mut() {
            Some(learner) => {
                let now = report.metrics.timestamp;
                let mut remaining = Vec::with_capacity(examples.len());
                for example in examples {
                    let outcome = learner.learn_fast(example, now);
                    if outcome.recall {
                        report.recalled += 1;
                    } else {
                        if outcome.learned {
                            report.one_shot += 1;
                        }
                        remaining.push(example);
                    }
                }
                remaining
            }
            None => examples.iter().collect(),
        };

        if !remaining.is_empty() {
            self.set_phase(TrainingPhase::TraditionalPass);
            if let Some(learner) = self.fast_learner.as_mut() {
                let owned: Vec<TrainingExample> = remaining.iter().map(|e| (*e).clone()).collect();
                learner.meta_learn(&owned);
            }
            let pass = self.gradient_pass(&remaining)?;
            report.traditional = pass.processed;
            report.skipped = pass.skipped;
            if pass.processed > 0 {
                report.short_circuited = false;
                report.metrics.short_circuited = false;
                report.metrics.loss = pass.loss;
                report.metrics.grad_norm = pass.grad_norm;
                self.set_phase(TrainingPhase::WeightUpdate);
                self.apply_gradients(pass, learning_rate)?;
            }
        }

        self.set_phase(TrainingPhase::MetricsEmit);
        self.counters.one_shot += report.one_shot as u64;
        self.counters.recalled += report.recalled as u64;
        self.counters.traditional += report.traditional as u64;
        self.metrics.push(report.metrics);
        if self.mode == TrainingMode::Hybrid && self.should_upgrade() {
            self.upgrade_to_full()?;
            report.upgraded = true;
        }

        debug!(
            step = report.metrics.step,
            loss = report.metrics.loss,
            lr = learning_rate,
            one_shot = report.one_shot,
            recalled = report.recalled,
            traditional = report.traditional,
            "batch trained"
        );
        Ok(report)
    }

    /// `(tokens, (position, next token) targets)` for an example.
    ///
    /// Targets cover the output continuation. Examples whose input fills the
    /// context fall back to next-token targets over the whole sequence.
    fn encode_example(&self, example: &TrainingExample) -> Option<(Vec<u32>, Vec<(usize, u32)>)> {
        let prompt = self.model.tokenize(&example.input);
        let mut tokens = prompt.clone();
        tokens.extend(self.model.tokenize(&example.output));
        tokens.truncate(self.model.dims().max_seq_len);
        if tokens.len() < 2 {
            return None;
        }
        let last = tokens.len() - 1;
        let start = prompt.len().saturating_sub(1);
        let start = if start < last { start } else { 0 };
        let targets = (start..last).map(|t| (t, tokens[t + 1])).collect();
        Some((tokens, targets))
    }

    /// Base weights with every adapter merged in.
    fn effective_weights(&self) -> Result<Cow<'_, WeightStore>> {
        let Some(lora) = self.lora.as_ref() else {
            return Ok(Cow::Borrowed(self.weights.weights()));
        };
        let mut merged = self.weights.weights().clone();
        for name in lora.layer_names() {
            let (Some(layer), Some(base)) = (lora.layer(&name), self.weights.get(&name)) else {
                continue;
            };
            let values =
                lora.merge_into_base(&name, base, layer.out_features(), layer.in_features())?;
            merged.set(name, values);
        }
        Ok(Cow::Owned(merged))
    }

    #[allow(clippy::cast_precision_loss)]
    fn gradient_pass(&mut self, examples: &[&TrainingExample]) -> Result<GradientPass> {
        let mut pass = GradientPass::default();
        if let Some(lora) = self.lora.as_mut() {
            lora.zero_gradients();
        }
        let effective = self.effective_weights()?.into_owned();
        let dims = self.model.dims().clone();

        for example in examples {
            let Some((tokens, targets)) = self.encode_example(example) else {
                debug!(id = %example.id, "example too short to train on");
                pass.skipped += 1;
                continue;
            };
            let cache =
                self.model
                    .forward_with_cache(self.weights.weights(), self.lora.as_ref(), &tokens)?;
            let (loss, d_logits) = cross_entropy(&cache.logits, &targets)?;
            let grad_norm = d_logits
                .iter()
                .flatten()
                .map(|g| g * g)
                .sum::<f32>()
                .sqrt();
            let grads = gradients::backward(&dims, &effective, &cache, &d_logits)?;

            match self.lora.as_mut() {
                Some(lora) => {
                    for (i, (layer_cache, layer_grads)) in
                        cache.layers.iter().zip(&grads.layers).enumerate()
                    {
                        for suffix in names::PROJECTIONS {
                            let name = layer_param(i, suffix);
                            if !lora.has_layer(&name) {
                                continue;
                            }
                            let short = suffix.rsplit('.').next().unwrap_or(suffix);
                            let Some((inputs, grads_out)) =
                                layer_grads.projection_io(layer_cache, short)
                            else {
                                continue;
                            };
                            for (x, dy) in inputs.iter().zip(grads_out) {
                                lora.backward(&name, x, dy)?;
                            }
                        }
                    }
                }
                None => {
                    for (name, g) in grads.weights {
                        match pass.full.get_mut(&name) {
                            Some(acc) => gradients::accumulate(acc, &g)?,
                            None => {
                                pass.full.insert(name, g);
                            }
                        }
                    }
                }
            }

            pass.loss += loss;
            pass.grad_norm += grad_norm;
            pass.processed += 1;
        }

        if pass.processed > 0 {
            let n = pass.processed as f32;
            pass.loss /= n;
            pass.grad_norm /= n;
        }
        Ok(pass)
    }

    #[allow(clippy::cast_precision_loss)]
    fn apply_gradients(&mut self, mut pass: GradientPass, learning_rate: f32) -> Result<()> {
        let scale = 1.0 / pass.processed as f32;
        let max_norm = self.config.training.max_grad_norm;
        self.optimizer_steps += 1;
        let step = self.adam.at_step(learning_rate, self.optimizer_steps);

        if let Some(lora) = self.lora.as_mut() {
            lora.scale_gradients(scale);
            let norm = lora.clip_gradients(max_norm);
            lora.update_parameters(&step)?;
            debug!(grad_norm = norm, "LoRA update applied");
            return Ok(());
        }

        for g in pass.full.values_mut() {
            tensor_ops::scale(g, scale);
        }
        let norm = clip_global_norm(pass.full.values_mut(), max_norm);
        for (name, grad) in &pass.full {
            let Some(current) = self.weights.get(name) else {
                warn!(name = %name, "gradient for unknown weight ignored");
                continue;
            };
            let mut updated = current.to_vec();
            let moments = self.full_moments.entry(name.clone()).or_insert_with(|| Moments {
                m: vec![0.0; grad.len()],
                v: vec![0.0; grad.len()],
            });
            self.backend
                .adam_step(&mut updated, grad, &mut moments.m, &mut moments.v, &step)?;
            let delta: Vec<f32> = updated.iter().zip(current).map(|(u, c)| u - c).collect();
            self.weights.apply_update(name, &delta, 1.0)?;
        }
        debug!(grad_norm = norm, tensors = pass.full.len(), "full update applied");
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn should_upgrade(&self) -> bool {
        let training = &self.config.training;
        let window = training.upgrade_window;
        if window == 0 || self.metrics.len() < training.upgrade_min_metrics.max(2 * window) {
            return false;
        }
        let n = self.metrics.len();
        let mean = |slice: &[TrainingMetrics]| {
            slice.iter().map(|m| m.loss).sum::<f32>() / slice.len() as f32
        };
        let recent = mean(&self.metrics[n - window..]);
        let previous = mean(&self.metrics[n - 2 * window..n - window]);
        let improvement = if previous > 0.0 {
            (previous - recent) / previous
        } else {
            0.0
        };
        debug!(recent, previous, improvement, "upgrade check");
        improvement < training.upgrade_min_improvement
    }

    /// Merge every adapter into the base weights and continue in full mode.
    fn upgrade_to_full(&mut self) -> Result<()> {
        let Some(lora) = self.lora.take() else {
            self.mode = TrainingMode::Full;
            return Ok(());
        };
        let mut merged = 0;
        for name in lora.layer_names() {
            let (Some(layer), Some(base)) = (lora.layer(&name), self.weights.get(&name)) else {
                continue;
            };
            let values =
                lora.merge_into_base(&name, base, layer.out_features(), layer.in_features())?;
            self.weights.replace(&name, values)?;
            merged += 1;
        }
        self.mode = TrainingMode::Full;
        self.full_moments.clear();
        info!(
            step = self.step,
            merged_layers = merged,
            "loss plateaued, upgraded from hybrid LoRA to full fine-tuning"
        );
        Ok(())
    }

    /// Mean loss over the last `window` metrics records that ran a gradient
    /// pass. `None` when every record in the window was short-circuited.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recent_quality(&self, window: usize) -> Option<QualityMetrics> {
        let window = window.max(1).min(self.metrics.len());
        let trained: Vec<f32> = self.metrics[self.metrics.len() - window..]
            .iter()
            .filter(|m| !m.short_circuited)
            .map(|m| m.loss)
            .collect();
        if trained.is_empty() {
            return None;
        }
        let loss = trained.iter().sum::<f32>() / trained.len() as f32;
        Some(QualityMetrics::from_loss(loss))
    }

    /// Snapshot the base weights and, in lockstep, the adapters.
    pub fn create_snapshot(&mut self, metrics: Option<QualityMetrics>) -> u64 {
        let id = self.weights.create_snapshot(metrics);
        self.adapter_snapshots.push_back(AdapterSnapshot {
            id,
            mode: self.mode,
            lora: self.lora.as_ref().map(LoraAdapter::export_state),
        });
        let oldest = self.weights.snapshots().front().map_or(id, |s| s.id);
        while self.adapter_snapshots.front().is_some_and(|s| s.id < oldest) {
            self.adapter_snapshots.pop_front();
        }
        id
    }

    /// Whether `current` is worse than the last snapshot's metrics.
    #[must_use]
    pub fn should_rollback(&self, current: &QualityMetrics) -> bool {
        self.weights.should_rollback(current)
    }

    /// Restore weights and adapters from snapshot `index` (default: latest).
    ///
    /// # Errors
    ///
    /// Returns an error if a saved adapter state cannot be restored.
    pub fn rollback(&mut self, index: Option<usize>) -> Result<bool> {
        let snapshot_id = match index {
            Some(i) => self.weights.snapshots().get(i).map(|s| s.id),
            None => self.weights.snapshots().back().map(|s| s.id),
        };
        if !self.weights.rollback(index) {
            return Ok(false);
        }
        let Some(saved) = snapshot_id
            .and_then(|id| self.adapter_snapshots.iter().find(|s| s.id == id))
            .cloned()
        else {
            return Ok(true);
        };

        self.mode = saved.mode;
        self.full_moments.clear();
        match (saved.lora, self.config.lora.as_ref()) {
            (Some(state), Some(settings)) => {
                let adapter = self
                    .lora
                    .get_or_insert_with(|| {
                        LoraAdapter::new(settings, Arc::clone(&self.backend), self.config.seed)
                    });
                adapter.import_state(&state)?;
            }
            _ => self.lora = None,
        }
        info!(snapshot = saved.id, mode = ?self.mode, "engine rolled back");
        Ok(true)
    }

    /// Mean loss over `examples` with the current weights, without updating.
    ///
    /// # Errors
    ///
    /// Returns an error for collaborator contract violations.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, examples: &[TrainingExample]) -> Result<Option<f32>> {
        let mut total = 0.0;
        let mut count = 0usize;
        for example in examples {
            let Some((tokens, targets)) = self.encode_example(example) else {
                continue;
            };
            let cache =
                self.model
                    .forward_with_cache(self.weights.weights(), self.lora.as_ref(), &tokens)?;
            total += cross_entropy(&cache.logits, &targets)?.0;
            count += 1;
        }
        Ok((count > 0).then(|| total / count as f32))
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> TrainingMode {
        self.mode
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    /// Whether a batch is in flight.
    #[must_use]
    pub fn is_training(&self) -> bool {
        self.phase != TrainingPhase::Idle
    }

    /// Batches trained so far.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The metrics log.
    #[must_use]
    pub fn metrics(&self) -> &[TrainingMetrics] {
        &self.metrics
    }

    /// Routing counters.
    #[must_use]
    pub fn counters(&self) -> FastLearningCounters {
        self.counters
    }

    /// Share of examples that bypassed gradient descent.
    #[must_use]
    pub fn fast_learning_ratio(&self) -> f32 {
        self.counters.ratio()
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &ContinualConfig {
        &self.config
    }

    /// The weight updater.
    #[must_use]
    pub fn weights(&self) -> &WeightUpdater {
        &self.weights
    }

    /// The adapters, when training through LoRA.
    #[must_use]
    pub fn lora(&self) -> Option<&LoraAdapter> {
        self.lora.as_ref()
    }

    /// The fast learner, when enabled.
    #[must_use]
    pub fn fast_learner(&self) -> Option<&FastLearner> {
        self.fast_learner.as_ref()
    }

    /// The model collaborator.
    #[must_use]
    pub fn model(&self) -> &dyn InferenceEngine {
        self.model.as_ref()
    }

    /// Read-only counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            mode: self.mode,
            phase: self.phase,
            step: self.step,
            optimizer_steps: self.optimizer_steps,
            metrics_recorded: self.metrics.len(),
            last_loss: self.metrics.last().map(|m| m.loss),
            counters: self.counters,
            fast_learning_ratio: self.fast_learning_ratio(),
            base_parameters: self.weights.weights().parameter_count(),
            lora_parameters: self.lora.as_ref().map_or(0, LoraAdapter::parameter_count),
            snapshots: self.weights.snapshots().len(),
            backend: self.backend.name().to_string(),
            fast_learner: self.fast_learner.as_ref().map(FastLearner::stats),
        }
    }

    /// Serializable copy of the training state.
    #[must_use]
    pub fn export_state(&self) -> EngineState {
        EngineState {
            version: ENGINE_STATE_VERSION,
            mode: self.mode,
            step: self.step,
            optimizer_steps: self.optimizer_steps,
            metrics: self.metrics.clone(),
            counters: self.counters,
            weights: self.weights.export_weights(),
            lora: self.lora.as_ref().map(LoraAdapter::export_state),
            fast_learner: self.fast_learner.as_ref().map(FastLearner::export_state),
        }
    }

    /// Restore a state produced by [`TrainingEngine::export_state`].
    ///
    /// Optimizer moments are not persisted and restart from zero.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if the state does not fit this engine.
    pub fn import_state(&mut self, state: EngineState) -> Result<()> {
        if state.version != ENGINE_STATE_VERSION {
            return Err(ContinualError::Checkpoint(format!(
                "engine state version {} (expected {ENGINE_STATE_VERSION})",
                state.version
            )));
        }
        let store = WeightStore::from(state.weights);
        check_weights(self.model.dims(), &store)
            .map_err(|e| ContinualError::Checkpoint(format!("weights do not fit model: {e}")))?;

        match (state.lora, self.config.lora.as_ref()) {
            (Some(lora_state), Some(settings)) => {
                let adapter = self.lora.get_or_insert_with(|| {
                    LoraAdapter::new(settings, Arc::clone(&self.backend), self.config.seed)
                });
                adapter.import_state(&lora_state)?;
            }
            (Some(_), None) => {
                return Err(ContinualError::Checkpoint(
                    "state carries LoRA adapters but no lora section is configured".into(),
                ));
            }
            (None, _) => self.lora = None,
        }
        match (state.fast_learner, self.fast_learner.as_mut()) {
            (Some(fl_state), Some(learner)) => learner.import_state(fl_state)?,
            (Some(_), None) => warn!("saved fast learner state ignored, fast learner disabled"),
            _ => {}
        }

        self.weights.import_weights(store.to_map());
        self.mode = state.mode;
        self.step = state.step;
        self.optimizer_steps = state.optimizer_steps;
        self.metrics = state.metrics;
        self.counters = state.counters;
        self.full_moments.clear();
        self.adapter_snapshots.clear();
        info!(step = self.step, mode = ?self.mode, "restored engine state");
        Ok(())
    }

    /// Write the training state as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.export_state().save(&path)?;
        info!(path = %path.as_ref().display(), step = self.step, "saved engine state");
        Ok(())
    }

    /// Load a state file written by [`TrainingEngine::save_state`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or does not fit this engine.
    pub fn load_state<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let state = EngineState::load(path)?;
        self.import_state(state)
    }
}

#[derive(Debug, Default)]
struct GradientPass {
    processed: usize,
    skipped: usize,
    loss: f32,
    grad_norm: f32,
    full: BTreeMap<String, Vec<f32>>,
}

fn check_weights(dims: &ModelSettings, store: &WeightStore) -> Result<()> {
    for shape in parameter_shapes(dims) {
        store.require(&shape.name, shape.len())?;
    }
    Ok(())
}

fn attach_adapters(adapter: &mut LoraAdapter, dims: &ModelSettings) {
    for shape in parameter_shapes(dims) {
        if shape.is_projection() && adapter.is_target(&shape.name) {
            adapter.initialize_layer(&shape.name, shape.cols, shape.rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoraSettings;
    use crate::example::{ExampleSource, Priority};
    use tempfile::TempDir;

    fn example(input: &str, output: &str) -> TrainingExample {
        TrainingExample::new(input, output, Priority::Medium, ExampleSource::Manual)
    }

    fn config(mode: TrainingMode, fast: bool) -> ContinualConfig {
        let mut config = ContinualConfig::tiny_preset();
        config.mode = mode;
        config.fast_learner.enabled = fast;
        config.backend = crate::config::BackendKind::Cpu;
        config
    }

    #[test]
    fn test_lora_mode_without_section_is_config_error() {
        let mut cfg = config(TrainingMode::Lora, false);
        cfg.lora = None;
        let err = TrainingEngine::with_reference_model(cfg).unwrap_err();
        assert!(matches!(err, ContinualError::Config(_)));
    }

    #[test]
    fn test_engine_new_attaches_target_adapters() {
        let engine = TrainingEngine::with_reference_model(config(TrainingMode::Lora, false)).unwrap();
        let lora = engine.lora().unwrap();
        let layers = engine.config().model.num_layers;
        assert_eq!(lora.layer_names().len(), 4 * layers);
        assert!(lora.has_layer(&layer_param(0, names::Q_PROJ)));
        assert!(!lora.has_layer(&layer_param(0, names::GATE_PROJ)));
        assert_eq!(engine.phase(), TrainingPhase::Idle);
    }

    #[test]
    fn test_wrong_weights_rejected() {
        let cfg = config(TrainingMode::Full, false);
        let model = TinyTransformer::new(cfg.model.clone()).unwrap();
        let err = TrainingEngine::new(cfg, Box::new(model), WeightStore::new()).unwrap_err();
        assert!(matches!(err, ContinualError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_encode_example_targets_output() {
        let engine = TrainingEngine::with_reference_model(config(TrainingMode::Full, false)).unwrap();
        let (tokens, targets) = engine.encode_example(&example("ab", "cd")).unwrap();
        assert_eq!(tokens, vec![97, 98, 99, 100]);
        assert_eq!(targets, vec![(1, 99), (2, 100)]);

        assert!(engine.encode_example(&example("a", "")).is_none());

        let long = "x".repeat(100);
        let (tokens, targets) = engine.encode_example(&example(&long, "y")).unwrap();
        assert_eq!(tokens.len(), engine.config().model.max_seq_len);
        assert_eq!(targets.len(), tokens.len() - 1);
    }

    #[test]
    fn test_recalled_batch_short_circuits() {
        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Lora, true)).unwrap();
        let first = engine.train_batch(&[example("hello there", "general")]).unwrap();
        assert_eq!(first.one_shot, 1);
        assert_eq!(first.traditional, 1);
        assert!(!first.short_circuited);

        let second = engine.train_batch(&[example("hello there", "general")]).unwrap();
        assert_eq!(second.recalled, 1);
        assert!(second.short_circuited);
        assert_eq!(second.metrics.loss, engine.config().training.min_loss);
        assert_eq!(engine.counters().recalled, 1);
        assert!((engine.fast_learning_ratio() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_batch_records_min_loss() {
        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Full, false)).unwrap();
        let report = engine.train_batch(&[]).unwrap();
        assert!(report.short_circuited);
        assert!(report.metrics.short_circuited);
        assert_eq!(report.metrics.loss, engine.config().training.min_loss);
        assert_eq!(engine.metrics().len(), 1);
        assert!(!engine.is_training());
    }

    #[test]
    fn test_recent_quality_ignores_short_circuited_batches() {
        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Lora, true)).unwrap();
        let trained = engine.train_batch(&[example("hello there", "general")]).unwrap();
        engine.train_batch(&[example("hello there", "general")]).unwrap();
        engine.train_batch(&[]).unwrap();

        assert!(engine.recent_quality(2).is_none());
        let quality = engine.recent_quality(3).unwrap();
        assert!((quality.loss - trained.metrics.loss).abs() < 1e-6);
    }

    #[test]
    fn test_lora_training_leaves_base_untouched() {
        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Lora, false)).unwrap();
        let before = engine.weights().export_weights();
        for _ in 0..3 {
            engine.train_batch(&[example("ping", "pong")]).unwrap();
        }
        assert_eq!(engine.weights().export_weights(), before);
        let q = layer_param(0, names::Q_PROJ);
        assert!(engine.lora().unwrap().layer(&q).unwrap().b().iter().any(|&b| b != 0.0));
    }

    #[test]
    fn test_training_reduces_loss() {
        for mode in [TrainingMode::Lora, TrainingMode::Full] {
            let mut cfg = config(mode, false);
            cfg.training.learning_rate = 1e-2;
            cfg.training.warmup_steps = 1;
            cfg.training.max_steps = 1000;
            cfg.training.lr_scheduler = crate::config::LrSchedulerKind::Constant;
            let mut engine = TrainingEngine::with_reference_model(cfg).unwrap();
            let batch = vec![example("abc", "abc"), example("xyz", "xyz")];
            let before = engine.evaluate(&batch).unwrap().unwrap();
            for _ in 0..30 {
                engine.train_batch(&batch).unwrap();
            }
            let after = engine.evaluate(&batch).unwrap().unwrap();
            assert!(after < before, "{mode:?}: {before} -> {after}");
        }
    }

    #[test]
    fn test_hybrid_upgrades_on_plateau() {
        let mut cfg = config(TrainingMode::Hybrid, false);
        cfg.training.upgrade_min_metrics = 4;
        cfg.training.upgrade_window = 2;
        cfg.training.upgrade_min_improvement = 0.01;
        let mut engine = TrainingEngine::with_reference_model(cfg).unwrap();

        let mut upgraded_at = None;
        for i in 0..4 {
            // Empty batches record a constant loss: a perfect plateau.
            if engine.train_batch(&[]).unwrap().upgraded {
                upgraded_at = Some(i);
            }
        }
        assert_eq!(upgraded_at, Some(3));
        assert_eq!(engine.mode(), TrainingMode::Full);
        assert!(engine.lora().is_none());
    }

    #[test]
    fn test_upgrade_merges_adapters() {
        let mut cfg = config(TrainingMode::Hybrid, false);
        cfg.training.learning_rate = 1e-2;
        cfg.training.warmup_steps = 1;
        let mut engine = TrainingEngine::with_reference_model(cfg).unwrap();
        for _ in 0..3 {
            engine.train_batch(&[example("ab", "cd")]).unwrap();
        }
        let held_out = [example("ab", "cd")];
        let before = engine.evaluate(&held_out).unwrap().unwrap();
        engine.upgrade_to_full().unwrap();
        let after = engine.evaluate(&held_out).unwrap().unwrap();
        assert!((before - after).abs() < 1e-4);
    }

    #[test]
    fn test_rollback_restores_adapters_in_lockstep() {
        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Lora, false)).unwrap();
        engine.create_snapshot(Some(QualityMetrics::from_loss(1.0)));
        let saved = engine.lora().unwrap().export_state();
        engine.train_batch(&[example("one", "two")]).unwrap();
        engine.train_batch(&[example("three", "four")]).unwrap();
        assert_ne!(engine.lora().unwrap().export_state(), saved);

        assert!(engine.should_rollback(&QualityMetrics::from_loss(2.0)));
        assert!(engine.rollback(None).unwrap());
        assert_eq!(engine.lora().unwrap().export_state(), saved);
    }

    #[test]
    fn test_rollback_without_snapshot() {
        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Full, false)).unwrap();
        assert!(!engine.rollback(None).unwrap());
    }

    #[test]
    fn test_save_and_load_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("engine.json");

        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Lora, true)).unwrap();
        engine.train_batch(&[example("save", "me")]).unwrap();
        engine.save_state(&path).unwrap();

        let mut restored =
            TrainingEngine::with_reference_model(config(TrainingMode::Lora, true)).unwrap();
        restored.load_state(&path).unwrap();
        assert_eq!(restored.step(), 1);
        assert_eq!(restored.metrics(), engine.metrics());
        assert_eq!(
            restored.lora().unwrap().export_state(),
            engine.lora().unwrap().export_state()
        );
        assert_eq!(restored.fast_learner().unwrap().memories().len(), 1);
        assert_eq!(restored.weights().snapshots().len(), 1);

        // The restored learner recalls what the saved one learned.
        let report = restored.train_batch(&[example("save", "me")]).unwrap();
        assert_eq!(report.recalled, 1);
    }

    #[test]
    fn test_load_rejects_lora_state_without_section() {
        let engine = TrainingEngine::with_reference_model(config(TrainingMode::Lora, false)).unwrap();
        let state = engine.export_state();
        let mut cfg = config(TrainingMode::Full, false);
        cfg.lora = None;
        let mut full = TrainingEngine::with_reference_model(cfg).unwrap();
        assert!(full.import_state(state).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let mut engine =
            TrainingEngine::with_reference_model(config(TrainingMode::Full, false)).unwrap();
        let err = engine.load_state("/nonexistent/engine.json").unwrap_err();
        assert!(matches!(err, ContinualError::Checkpoint(_)));
    }

    #[test]
    fn test_stats_projection() {
        let mut cfg = config(TrainingMode::Lora, true);
        cfg.lora = Some(LoraSettings {
            r: 2,
            ..LoraSettings::default()
        });
        let mut engine = TrainingEngine::with_reference_model(cfg).unwrap();
        engine.train_batch(&[example("a b", "c d")]).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.step, 1);
        assert_eq!(stats.backend, "cpu");
        assert!(stats.lora_parameters > 0);
        assert!(stats.fast_learner.is_some());
        assert!(serde_json::to_string(&stats).is_ok());
    }
}

//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ContinualError, Result};

/// Main configuration for continual training.
///
/// # Example
///
/// ```rust
/// use continual_tune_rs::ContinualConfig;
///
/// # fn main() -> continual_tune_rs::Result<()> {
/// let config = ContinualConfig::from_preset("tiny")?;
/// config.validate()?;
/// assert!(config.lora.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinualConfig {
    /// Which parameters the engine trains.
    #[serde(default)]
    pub mode: TrainingMode,

    /// Compute backend selection.
    #[serde(default)]
    pub backend: BackendKind,

    /// Shape of the reference model.
    #[serde(default)]
    pub model: ModelSettings,

    /// Example queue limits.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Episodic memory and spiking network.
    #[serde(default)]
    pub fast_learner: FastLearnerSettings,

    /// LoRA settings. Required for `lora` and `hybrid` modes.
    #[serde(default)]
    pub lora: Option<LoraSettings>,

    /// Optimisation hyperparameters.
    #[serde(default)]
    pub training: TrainingSettings,

    /// Snapshot / rollback policy.
    #[serde(default)]
    pub weights: WeightSettings,

    /// Adaptive batch sizing.
    #[serde(default)]
    pub batch: BatchSettings,

    /// Background scheduling.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Output directory for saved state.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed for weight and adapter initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// Training mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingMode {
    /// Train LoRA adapters only.
    Lora,
    /// Update the base weights directly.
    Full,
    /// Start with LoRA and upgrade to full fine-tuning once LoRA plateaus.
    #[default]
    Hybrid,
}

impl TrainingMode {
    /// Whether this mode needs a `lora` section.
    #[must_use]
    pub fn uses_lora(self) -> bool {
        matches!(self, Self::Lora | Self::Hybrid)
    }
}

/// Compute backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plain CPU loops.
    Cpu,
    /// Candle tensors (needs the `candle` feature).
    Candle,
    /// Candle when compiled in, CPU otherwise.
    #[default]
    Auto,
}

/// Reference model dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Residual stream width.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Number of attention heads. Must divide `hidden_size`.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// SwiGLU intermediate width.
    #[serde(default = "default_ffn_size")]
    pub ffn_size: usize,
    /// Number of transformer layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Vocabulary size (the byte tokenizer needs at least 256).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Maximum tokens per example; longer sequences are truncated.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Layer-norm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
}

fn default_hidden_size() -> usize {
    32
}
fn default_num_heads() -> usize {
    4
}
fn default_ffn_size() -> usize {
    64
}
fn default_num_layers() -> usize {
    2
}
fn default_vocab_size() -> usize {
    256
}
fn default_max_seq_len() -> usize {
    64
}
fn default_norm_eps() -> f32 {
    1e-5
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            num_heads: default_num_heads(),
            ffn_size: default_ffn_size(),
            num_layers: default_num_layers(),
            vocab_size: default_vocab_size(),
            max_seq_len: default_max_seq_len(),
            norm_eps: default_norm_eps(),
        }
    }
}

/// Queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum number of enqueued examples.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// How many processed ids are remembered for deduplication.
    #[serde(default = "default_processed_history")]
    pub processed_history: usize,
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_processed_history() -> usize {
    10_000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            processed_history: default_processed_history(),
        }
    }
}

/// Fast learner settings: episodic memory plus the spiking network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastLearnerSettings {
    /// Route examples through the fast learner before gradient descent.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum cosine similarity for a recall hit.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Memories kept after consolidation.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Total neurons. Must be at least twice the encoding width (256).
    #[serde(default = "default_neuron_count")]
    pub neuron_count: usize,
    /// Fraction of possible connections created at initialisation.
    #[serde(default = "default_connection_density")]
    pub connection_density: f32,
    /// Membrane potential at which a neuron spikes.
    #[serde(default = "default_firing_threshold")]
    pub firing_threshold: f32,
    /// Multiplicative leak per simulation step.
    #[serde(default = "default_leak_rate")]
    pub leak_rate: f32,
    /// Steps a neuron stays silent after spiking.
    #[serde(default = "default_refractory_period")]
    pub refractory_period: u64,
    /// Simulation steps per forward call.
    #[serde(default = "default_simulation_steps")]
    pub simulation_steps: usize,
    /// Hebbian increment per co-active pair.
    #[serde(default = "default_plasticity_rate")]
    pub plasticity_rate: f32,
    /// Apply spike-timing-dependent plasticity during forward passes.
    #[serde(default = "default_true")]
    pub stdp_enabled: bool,
    /// Maximum spike gap (steps) considered by STDP.
    #[serde(default = "default_stdp_window")]
    pub stdp_window: u64,
    /// STDP exponential decay constant (steps).
    #[serde(default = "default_stdp_tau")]
    pub stdp_tau: f32,
    /// Potentiation amplitude.
    #[serde(default = "default_stdp_a_plus")]
    pub stdp_a_plus: f32,
    /// Depression amplitude.
    #[serde(default = "default_stdp_a_minus")]
    pub stdp_a_minus: f32,
    /// Spike times retained per neuron.
    #[serde(default = "default_spike_history_len")]
    pub spike_history_len: usize,
    /// Scale from encoding value to injected current.
    #[serde(default = "default_input_gain")]
    pub input_gain: f32,
    /// Initial meta learning rate (clamped to `[0.001, 0.1]`).
    #[serde(default = "default_meta_learning_rate")]
    pub meta_learning_rate: f32,
    /// Error threshold used before any history exists.
    #[serde(default = "default_meta_error_threshold")]
    pub meta_error_threshold: f32,
    /// Connections weaker than this are removed after consolidation.
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: f32,
    /// Seed for the random connectivity.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_memory_capacity() -> usize {
    1000
}
fn default_neuron_count() -> usize {
    512
}
fn default_connection_density() -> f32 {
    0.1
}
fn default_firing_threshold() -> f32 {
    1.0
}
fn default_leak_rate() -> f32 {
    0.1
}
fn default_refractory_period() -> u64 {
    2
}
fn default_simulation_steps() -> usize {
    10
}
fn default_plasticity_rate() -> f32 {
    0.01
}
fn default_stdp_window() -> u64 {
    20
}
fn default_stdp_tau() -> f32 {
    10.0
}
fn default_stdp_a_plus() -> f32 {
    0.01
}
fn default_stdp_a_minus() -> f32 {
    0.012
}
fn default_spike_history_len() -> usize {
    100
}
fn default_input_gain() -> f32 {
    10.0
}
fn default_meta_learning_rate() -> f32 {
    0.01
}
fn default_meta_error_threshold() -> f32 {
    0.05
}
fn default_prune_threshold() -> f32 {
    0.001
}

impl Default for FastLearnerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_similarity_threshold(),
            memory_capacity: default_memory_capacity(),
            neuron_count: default_neuron_count(),
            connection_density: default_connection_density(),
            firing_threshold: default_firing_threshold(),
            leak_rate: default_leak_rate(),
            refractory_period: default_refractory_period(),
            simulation_steps: default_simulation_steps(),
            plasticity_rate: default_plasticity_rate(),
            stdp_enabled: true,
            stdp_window: default_stdp_window(),
            stdp_tau: default_stdp_tau(),
            stdp_a_plus: default_stdp_a_plus(),
            stdp_a_minus: default_stdp_a_minus(),
            spike_history_len: default_spike_history_len(),
            input_gain: default_input_gain(),
            meta_learning_rate: default_meta_learning_rate(),
            meta_error_threshold: default_meta_error_threshold(),
            prune_threshold: default_prune_threshold(),
            seed: default_seed(),
        }
    }
}

/// LoRA-specific settings.
///
/// # Example
///
/// ```rust
/// use continual_tune_rs::config::LoraSettings;
///
/// let lora = LoraSettings {
///     r: 4,
///     alpha: 8,
///     target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
///     ..Default::default()
/// };
///
/// assert_eq!(lora.scaling(), 2.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraSettings {
    /// Rank of the low-rank decomposition.
    #[serde(default = "default_lora_r")]
    pub r: usize,

    /// Scaling numerator; effective scale is `alpha / r`.
    #[serde(default = "default_lora_alpha")]
    pub alpha: usize,

    /// Suffixes of the projections that receive an adapter.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Standard deviation of the random A initialisation.
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
}

fn default_lora_r() -> usize {
    8
}
fn default_lora_alpha() -> usize {
    16
}
fn default_target_modules() -> Vec<String> {
    vec![
        "q_proj".into(),
        "k_proj".into(),
        "v_proj".into(),
        "o_proj".into(),
    ]
}
fn default_init_scale() -> f32 {
    0.01
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: default_lora_r(),
            alpha: default_lora_alpha(),
            target_modules: default_target_modules(),
            init_scale: default_init_scale(),
        }
    }
}

impl LoraSettings {
    /// `alpha / r`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f32 {
        self.alpha as f32 / self.r as f32
    }
}

/// Optimisation hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Peak learning rate reached at the end of warmup.
    #[serde(default = "default_lr")]
    pub learning_rate: f32,
    /// Linear warmup length in steps.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Step at which the decay reaches zero.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Decay shape after warmup.
    #[serde(default)]
    pub lr_scheduler: LrSchedulerKind,
    /// Gradient L2 cap applied before each optimizer step.
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f32,
    /// Adam beta1.
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    /// Adam beta2.
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    /// Adam epsilon.
    #[serde(default = "default_eps")]
    pub eps: f32,
    /// Loss reported when no example reached gradient descent.
    #[serde(default = "default_min_loss")]
    pub min_loss: f32,
    /// Metrics required before the hybrid upgrade is considered.
    #[serde(default = "default_upgrade_min_metrics")]
    pub upgrade_min_metrics: usize,
    /// Window length for the plateau comparison.
    #[serde(default = "default_upgrade_window")]
    pub upgrade_window: usize,
    /// Relative improvement below which LoRA is considered plateaued.
    #[serde(default = "default_upgrade_min_improvement")]
    pub upgrade_min_improvement: f32,
}

fn default_lr() -> f32 {
    1e-4
}
fn default_warmup_steps() -> usize {
    100
}
fn default_max_steps() -> usize {
    10_000
}
fn default_grad_norm() -> f32 {
    1.0
}
fn default_beta1() -> f32 {
    0.9
}
fn default_beta2() -> f32 {
    0.999
}
fn default_eps() -> f32 {
    1e-8
}
fn default_min_loss() -> f32 {
    0.001
}
fn default_upgrade_min_metrics() -> usize {
    100
}
fn default_upgrade_window() -> usize {
    20
}
fn default_upgrade_min_improvement() -> f32 {
    0.01
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            warmup_steps: default_warmup_steps(),
            max_steps: default_max_steps(),
            lr_scheduler: LrSchedulerKind::Cosine,
            max_grad_norm: default_grad_norm(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            min_loss: default_min_loss(),
            upgrade_min_metrics: default_upgrade_min_metrics(),
            upgrade_window: default_upgrade_window(),
            upgrade_min_improvement: default_upgrade_min_improvement(),
        }
    }
}

/// Learning rate decay shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedulerKind {
    /// Cosine annealing.
    #[default]
    Cosine,
    /// Linear decay.
    Linear,
    /// Constant learning rate after warmup.
    Constant,
}

/// Snapshot / rollback policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSettings {
    /// Snapshots retained; the oldest is evicted first.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Relative degradation that triggers a rollback.
    #[serde(default = "default_rollback_threshold")]
    pub rollback_threshold: f32,
}

fn default_max_snapshots() -> usize {
    10
}
fn default_rollback_threshold() -> f32 {
    0.1
}

impl Default for WeightSettings {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
            rollback_threshold: default_rollback_threshold(),
        }
    }
}

/// Adaptive batch sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Batch size while the user is active.
    #[serde(default = "default_active_batch_size")]
    pub active_batch_size: usize,
    /// Batch size while the user is idle.
    #[serde(default = "default_idle_batch_size")]
    pub idle_batch_size: usize,
    /// Queue length required before training.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    /// Hard upper bound on batch size.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Inactivity after which the user counts as idle.
    #[serde(default = "default_activity_timeout_ms")]
    pub activity_timeout_ms: u64,
}

fn default_active_batch_size() -> usize {
    2
}
fn default_idle_batch_size() -> usize {
    8
}
fn default_min_batch_size() -> usize {
    2
}
fn default_max_batch_size() -> usize {
    32
}
fn default_activity_timeout_ms() -> u64 {
    5000
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            active_batch_size: default_active_batch_size(),
            idle_batch_size: default_idle_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            activity_timeout_ms: default_activity_timeout_ms(),
        }
    }
}

/// Background scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Delay between scheduler checks.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// CPU budget as a fraction in `(0, 1]`, encoded as a minimum spacing of
    /// `1000 / max_cpu_usage` ms between training bursts.
    #[serde(default = "default_max_cpu_usage")]
    pub max_cpu_usage: f32,
    /// Take a snapshot (and check for rollback) every N bursts.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
    /// Idle time a tick must have left to start a burst.
    #[serde(default = "default_min_idle_budget_ms")]
    pub min_idle_budget_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    1000
}
fn default_max_cpu_usage() -> f32 {
    0.5
}
fn default_snapshot_interval() -> u64 {
    10
}
fn default_min_idle_budget_ms() -> u64 {
    10
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            max_cpu_usage: default_max_cpu_usage(),
            snapshot_interval: default_snapshot_interval(),
            min_idle_budget_ms: default_min_idle_budget_ms(),
        }
    }
}

impl SchedulerSettings {
    /// Minimum milliseconds between two training bursts.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn min_training_interval_ms(&self) -> u64 {
        (1000.0 / self.max_cpu_usage).ceil() as u64
    }
}

impl Default for ContinualConfig {
    fn default() -> Self {
        Self {
            mode: TrainingMode::default(),
            backend: BackendKind::default(),
            model: ModelSettings::default(),
            queue: QueueSettings::default(),
            fast_learner: FastLearnerSettings::default(),
            lora: Some(LoraSettings::default()),
            training: TrainingSettings::default(),
            weights: WeightSettings::default(),
            batch: BatchSettings::default(),
            scheduler: SchedulerSettings::default(),
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }
}

impl ContinualConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"tiny"` - 1-layer model, small batches, fast warmup; used by tests
    /// - `"small"` - the defaults
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Config`] for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "tiny" => Ok(Self::tiny_preset()),
            "small" => Ok(Self::default()),
            _ => Err(ContinualError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// A one-layer configuration that trains in milliseconds.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            model: ModelSettings {
                hidden_size: 16,
                num_heads: 2,
                ffn_size: 32,
                num_layers: 1,
                max_seq_len: 24,
                ..Default::default()
            },
            lora: Some(LoraSettings {
                r: 4,
                alpha: 8,
                ..Default::default()
            }),
            training: TrainingSettings {
                learning_rate: 1e-3,
                warmup_steps: 5,
                max_steps: 500,
                ..Default::default()
            },
            batch: BatchSettings {
                active_batch_size: 2,
                idle_batch_size: 4,
                min_batch_size: 1,
                ..Default::default()
            },
            scheduler: SchedulerSettings {
                check_interval_ms: 10,
                max_cpu_usage: 1.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.mode.uses_lora() {
            let lora = self.lora.as_ref().ok_or_else(|| {
                ContinualError::Config(format!("mode {:?} requires a lora section", self.mode))
            })?;
            if lora.r == 0 {
                return Err(ContinualError::Config("lora.r must be > 0".into()));
            }
            if lora.target_modules.is_empty() {
                return Err(ContinualError::Config(
                    "lora.target_modules must not be empty".into(),
                ));
            }
        }

        let m = &self.model;
        if m.hidden_size == 0 || m.num_heads == 0 || m.hidden_size % m.num_heads != 0 {
            return Err(ContinualError::Config(format!(
                "model.hidden_size ({}) must be a positive multiple of model.num_heads ({})",
                m.hidden_size, m.num_heads
            )));
        }
        if m.num_layers == 0 || m.ffn_size == 0 {
            return Err(ContinualError::Config(
                "model.num_layers and model.ffn_size must be > 0".into(),
            ));
        }
        if m.vocab_size < 256 {
            return Err(ContinualError::Config(
                "model.vocab_size must be >= 256 for the byte tokenizer".into(),
            ));
        }
        if m.max_seq_len < 2 {
            return Err(ContinualError::Config("model.max_seq_len must be >= 2".into()));
        }

        if self.queue.capacity == 0 {
            return Err(ContinualError::Config("queue.capacity must be > 0".into()));
        }

        let f = &self.fast_learner;
        if !(0.0..=1.0).contains(&f.similarity_threshold) {
            return Err(ContinualError::Config(
                "fast_learner.similarity_threshold must be in [0, 1]".into(),
            ));
        }
        if f.neuron_count < 2 * crate::fast_learner::ENCODING_DIM {
            return Err(ContinualError::Config(format!(
                "fast_learner.neuron_count must be >= {}",
                2 * crate::fast_learner::ENCODING_DIM
            )));
        }
        if !(0.0..=1.0).contains(&f.connection_density) || !(0.0..1.0).contains(&f.leak_rate) {
            return Err(ContinualError::Config(
                "fast_learner.connection_density must be in [0, 1] and leak_rate in [0, 1)".into(),
            ));
        }
        if f.memory_capacity == 0 {
            return Err(ContinualError::Config(
                "fast_learner.memory_capacity must be > 0".into(),
            ));
        }

        if self.training.max_steps <= self.training.warmup_steps {
            return Err(ContinualError::Config(
                "training.max_steps must exceed training.warmup_steps".into(),
            ));
        }
        if self.training.upgrade_window == 0
            || self.training.upgrade_min_metrics < 2 * self.training.upgrade_window
        {
            return Err(ContinualError::Config(
                "training.upgrade_min_metrics must cover two upgrade windows".into(),
            ));
        }

        if self.weights.max_snapshots == 0 {
            return Err(ContinualError::Config("weights.max_snapshots must be > 0".into()));
        }
        if self.weights.rollback_threshold < 0.0 {
            return Err(ContinualError::Config(
                "weights.rollback_threshold must be >= 0".into(),
            ));
        }

        let b = &self.batch;
        if b.max_batch_size == 0 || b.active_batch_size == 0 || b.idle_batch_size == 0 {
            return Err(ContinualError::Config("batch sizes must be > 0".into()));
        }

        let s = &self.scheduler;
        if !(s.max_cpu_usage > 0.0 && s.max_cpu_usage <= 1.0) {
            return Err(ContinualError::Config(
                "scheduler.max_cpu_usage must be in (0, 1]".into(),
            ));
        }
        if s.snapshot_interval == 0 {
            return Err(ContinualError::Config(
                "scheduler.snapshot_interval must be > 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ContinualConfig::default().validate().is_ok());
        assert!(ContinualConfig::tiny_preset().validate().is_ok());
    }

    #[test]
    fn test_lora_mode_without_lora_section_fails() {
        let config = ContinualConfig {
            mode: TrainingMode::Lora,
            lora: None,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ContinualError::Config(_))));

        let full = ContinualConfig {
            mode: TrainingMode::Full,
            lora: None,
            ..Default::default()
        };
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_heads_must_divide_hidden() {
        let mut config = ContinualConfig::default();
        config.model.num_heads = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cpu_usage_bounds() {
        let mut config = ContinualConfig::default();
        config.scheduler.max_cpu_usage = 0.0;
        assert!(config.validate().is_err());
        config.scheduler.max_cpu_usage = 0.25;
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.min_training_interval_ms(), 4000);
    }

    #[test]
    fn test_unknown_preset() {
        match ContinualConfig::from_preset("gigantic") {
            Err(ContinualError::Config(msg)) => assert!(msg.contains("gigantic")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_yaml_roundtrip_through_file() {
        let file = NamedTempFile::new().unwrap();
        let config = ContinualConfig::tiny_preset();
        config.to_file(file.path()).unwrap();

        let loaded = ContinualConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.model.hidden_size, 16);
        assert_eq!(loaded.mode, TrainingMode::Hybrid);
        assert_eq!(loaded.lora.unwrap().r, 4);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "mode: full\nbatch:\n  idle_batch_size: 12\n";
        let config: ContinualConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, TrainingMode::Full);
        assert_eq!(config.batch.idle_batch_size, 12);
        assert_eq!(config.batch.active_batch_size, 2);
        assert!(config.lora.is_none());
        assert!((config.fast_learner.similarity_threshold - 0.85).abs() < f32::EPSILON);
    }
}

//! Low-rank adapters with manual gradients and Adam updates.
//!
//! Each adapted projection `W` (`out × in`) gains `A` (`rank × in`) and
//! `B` (`out × rank`) so that the effective weight is `W + scaling · B · A`.
//! `B` starts at zero, so a fresh adapter never changes the model output.
//!
//! # Example
//!
//! ```rust
//! use continual_tune_rs::config::LoraSettings;
//! use continual_tune_rs::lora::LoraAdapter;
//!
//! # fn main() -> continual_tune_rs::Result<()> {
//! let mut adapter = LoraAdapter::cpu(&LoraSettings::default(), 0);
//! adapter.initialize_layer("m", 4, 2);
//!
//! let y = adapter.forward("m", &[1.0, 1.0, 1.0, 1.0], &[5.0, 5.0])?;
//! assert_eq!(y, vec![5.0, 5.0]);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{ComputeBackend, CpuBackend};
use crate::config::LoraSettings;
use crate::error::{ensure_len, ContinualError, Result};
use crate::optimizer::AdamStep;
use crate::tensor_ops;

/// Serialization version of [`LoraState`].
pub const LORA_STATE_VERSION: u32 = 1;

/// Adapter for a single projection.
#[derive(Debug, Clone)]
pub struct LoraLayer {
    in_features: usize,
    out_features: usize,
    rank: usize,
    scaling: f32,
    a: Vec<f32>,
    b: Vec<f32>,
    grad_a: Option<Vec<f32>>,
    grad_b: Option<Vec<f32>>,
    // Moments over the concatenation [A; B].
    m: Vec<f32>,
    v: Vec<f32>,
}

impl LoraLayer {
    fn new(in_features: usize, out_features: usize, rank: usize, scaling: f32, a: Vec<f32>) -> Self {
        let params = rank * (in_features + out_features);
        Self {
            in_features,
            out_features,
            rank,
            scaling,
            a,
            b: vec![0.0; out_features * rank],
            grad_a: None,
            grad_b: None,
            m: vec![0.0; params],
            v: vec![0.0; params],
        }
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// `A`, `rank × in_features`.
    #[must_use]
    pub fn a(&self) -> &[f32] {
        &self.a
    }

    /// `B`, `out_features × rank`.
    #[must_use]
    pub fn b(&self) -> &[f32] {
        &self.b
    }

    /// Accumulated gradient of `A`, if any backward ran since the last update.
    #[must_use]
    pub fn grad_a(&self) -> Option<&[f32]> {
        self.grad_a.as_deref()
    }

    /// Accumulated gradient of `B`.
    #[must_use]
    pub fn grad_b(&self) -> Option<&[f32]> {
        self.grad_b.as_deref()
    }

    /// Number of trainable values.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.a.len() + self.b.len()
    }

    fn zero_gradients(&mut self) {
        for g in [&mut self.grad_a, &mut self.grad_b].into_iter().flatten() {
            g.fill(0.0);
        }
    }

    fn gradients_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        [&mut self.grad_a, &mut self.grad_b].into_iter().flatten()
    }
}

/// Raw adapter weights for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraLayerState {
    /// Input width.
    pub in_features: usize,
    /// Output width.
    pub out_features: usize,
    /// Flattened `A`.
    pub a: Vec<f32>,
    /// Flattened `B`.
    pub b: Vec<f32>,
}

/// Persisted adapter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraState {
    /// Schema version.
    pub version: u32,
    /// Rank used for every layer.
    pub rank: usize,
    /// Alpha used for every layer.
    pub alpha: usize,
    /// Layers keyed by module name.
    pub layers: BTreeMap<String, LoraLayerState>,
}

/// All adapters of a model.
#[derive(Debug)]
pub struct LoraAdapter {
    settings: LoraSettings,
    layers: BTreeMap<String, LoraLayer>,
    backend: Arc<dyn ComputeBackend>,
    rng: ChaCha8Rng,
}

impl LoraAdapter {
    /// Create an empty adapter set.
    #[must_use]
    pub fn new(settings: &LoraSettings, backend: Arc<dyn ComputeBackend>, seed: u64) -> Self {
        Self {
            settings: settings.clone(),
            layers: BTreeMap::new(),
            backend,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Adapter set on the CPU backend.
    #[must_use]
    pub fn cpu(settings: &LoraSettings, seed: u64) -> Self {
        Self::new(settings, Arc::new(CpuBackend), seed)
    }

    /// Settings the adapter was built with.
    #[must_use]
    pub fn settings(&self) -> &LoraSettings {
        &self.settings
    }

    /// `alpha / rank`.
    #[must_use]
    pub fn scaling(&self) -> f32 {
        self.settings.scaling()
    }

    /// Whether a weight name ends with one of the configured target modules.
    #[must_use]
    pub fn is_target(&self, weight_name: &str) -> bool {
        let last = weight_name.rsplit('.').next().unwrap_or(weight_name);
        self.settings.target_modules.iter().any(|t| t == last)
    }

    /// Standard normal sample via Box-Muller.
    fn gaussian(&mut self) -> f32 {
        let u1: f32 = self.rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }

    /// Allocate `A` with small random entries and `B` with zeros.
    ///
    /// Re-initialising an existing name replaces it.
    pub fn initialize_layer(&mut self, name: &str, in_features: usize, out_features: usize) {
        let rank = self.settings.r;
        let scale = self.settings.init_scale;
        let a = (0..rank * in_features)
            .map(|_| self.gaussian() * scale)
            .collect();
        let layer = LoraLayer::new(in_features, out_features, rank, self.scaling(), a);
        debug!(name, in_features, out_features, rank, "initialized LoRA layer");
        self.layers.insert(name.to_string(), layer);
    }

    /// Whether `name` has an adapter.
    #[must_use]
    pub fn has_layer(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Adapter for `name`.
    #[must_use]
    pub fn layer(&self, name: &str) -> Option<&LoraLayer> {
        self.layers.get(name)
    }

    /// Module names in sorted order.
    #[must_use]
    pub fn layer_names(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    /// Total trainable values across layers.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.layers.values().map(LoraLayer::parameter_count).sum()
    }

    /// `base_output + scaling · B · (A · x)`.
    ///
    /// Unknown names pass `base_output` through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::ShapeMismatch`] if `x` or `base_output` do not
    /// match the layer, or the backend error from the matmul.
    pub fn forward(&self, name: &str, x: &[f32], base_output: &[f32]) -> Result<Vec<f32>> {
        let Some(layer) = self.layers.get(name) else {
            warn!(name, "LoRA forward on unregistered module, passing through");
            return Ok(base_output.to_vec());
        };
        ensure_len("lora.forward.x", layer.in_features, x.len())?;
        ensure_len("lora.forward.base", layer.out_features, base_output.len())?;

        let ax = self
            .backend
            .matmul(&layer.a, x, layer.rank, 1, layer.in_features)?;
        let bax = self
            .backend
            .matmul(&layer.b, &ax, layer.out_features, 1, layer.rank)?;
        Ok(base_output
            .iter()
            .zip(&bax)
            .map(|(&y, &d)| y + layer.scaling * d)
            .collect())
    }

    /// Accumulate `gradB += s·dy⊗(A·x)` and `gradA += s·(Bᵀ·dy)⊗x`.
    ///
    /// Unknown names are a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::ShapeMismatch`] on mismatched lengths.
    pub fn backward(&mut self, name: &str, x: &[f32], grad_output: &[f32]) -> Result<()> {
        let Some(layer) = self.layers.get_mut(name) else {
            warn!(name, "LoRA backward on unregistered module, ignoring");
            return Ok(());
        };
        ensure_len("lora.backward.x", layer.in_features, x.len())?;
        ensure_len("lora.backward.grad", layer.out_features, grad_output.len())?;

        let ax = self
            .backend
            .matmul(&layer.a, x, layer.rank, 1, layer.in_features)?;
        let bt_dy = tensor_ops::matvec_t(&layer.b, grad_output, layer.out_features, layer.rank);

        let grad_b = layer
            .grad_b
            .get_or_insert_with(|| vec![0.0; layer.b.len()]);
        tensor_ops::outer_add(grad_b, grad_output, &ax, layer.scaling);
        let grad_a = layer
            .grad_a
            .get_or_insert_with(|| vec![0.0; layer.a.len()]);
        tensor_ops::outer_add(grad_a, &bt_dy, x, layer.scaling);
        Ok(())
    }

    /// Gradient that flows back to `x` through the adapter: `s·Aᵀ·(Bᵀ·dy)`.
    /// `None` for unknown names.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::ShapeMismatch`] if `grad_output` does not match.
    pub fn input_gradient(&self, name: &str, grad_output: &[f32]) -> Result<Option<Vec<f32>>> {
        let Some(layer) = self.layers.get(name) else {
            return Ok(None);
        };
        ensure_len("lora.input_gradient", layer.out_features, grad_output.len())?;
        let bt_dy = tensor_ops::matvec_t(&layer.b, grad_output, layer.out_features, layer.rank);
        let mut dx = tensor_ops::matvec_t(&layer.a, &bt_dy, layer.rank, layer.in_features);
        tensor_ops::scale(&mut dx, layer.scaling);
        Ok(Some(dx))
    }

    /// Adam step on every layer, then zero the gradients.
    ///
    /// Layers without gradients still advance their moments with a zero gradient.
    ///
    /// # Errors
    ///
    /// Propagates backend failures from the Adam step.
    pub fn update_parameters(&mut self, step: &AdamStep) -> Result<()> {
        for (name, layer) in &mut self.layers {
            let n_a = layer.a.len();
            let mut params: Vec<f32> = layer.a.iter().chain(&layer.b).copied().collect();
            let mut grads = vec![0.0; params.len()];
            if let Some(ga) = &layer.grad_a {
                grads[..n_a].copy_from_slice(ga);
            }
            if let Some(gb) = &layer.grad_b {
                grads[n_a..].copy_from_slice(gb);
            }

            self.backend
                .adam_step(&mut params, &grads, &mut layer.m, &mut layer.v, step)
                .map_err(|e| ContinualError::Backend(format!("LoRA update of {name}: {e}")))?;

            layer.a.copy_from_slice(&params[..n_a]);
            layer.b.copy_from_slice(&params[n_a..]);
            layer.zero_gradients();
        }
        Ok(())
    }

    /// Zero every accumulated gradient.
    pub fn zero_gradients(&mut self) {
        for layer in self.layers.values_mut() {
            layer.zero_gradients();
        }
    }

    /// Multiply every accumulated gradient by `factor`.
    pub fn scale_gradients(&mut self, factor: f32) {
        for layer in self.layers.values_mut() {
            for g in layer.gradients_mut() {
                tensor_ops::scale(g, factor);
            }
        }
    }

    /// Global L2 norm of all gradients.
    #[must_use]
    pub fn gradient_norm(&self) -> f32 {
        self.layers
            .values()
            .flat_map(|l| [l.grad_a.as_deref(), l.grad_b.as_deref()])
            .flatten()
            .flat_map(|g| g.iter())
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt()
    }

    /// Rescale all gradients so their global norm is at most `max_norm`.
    /// Returns the norm before clipping.
    pub fn clip_gradients(&mut self, max_norm: f32) -> f32 {
        let norm = self.gradient_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale_gradients(max_norm / norm);
        }
        norm
    }

    /// `base_weight + scaling · B · A`, as a new buffer.
    ///
    /// Unknown names return a copy of `base_weight`.
    pub fn merge_into_base(
        &self,
        name: &str,
        base_weight: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<Vec<f32>> {
        let Some(layer) = self.layers.get(name) else {
            warn!(name, "merge requested for unregistered LoRA module");
            return Ok(base_weight.to_vec());
        };
        ensure_len("lora.merge.rows", layer.out_features, rows)?;
        ensure_len("lora.merge.cols", layer.in_features, cols)?;
        ensure_len("lora.merge.base", rows * cols, base_weight.len())?;

        let ba = self.backend.matmul(&layer.b, &layer.a, rows, cols, layer.rank)?;
        Ok(base_weight
            .iter()
            .zip(&ba)
            .map(|(&w, &d)| w + layer.scaling * d)
            .collect())
    }

    /// Raw `A`/`B` of every layer.
    #[must_use]
    pub fn export_state(&self) -> LoraState {
        LoraState {
            version: LORA_STATE_VERSION,
            rank: self.settings.r,
            alpha: self.settings.alpha,
            layers: self
                .layers
                .iter()
                .map(|(name, l)| {
                    (
                        name.clone(),
                        LoraLayerState {
                            in_features: l.in_features,
                            out_features: l.out_features,
                            a: l.a.clone(),
                            b: l.b.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Replace layers from a saved state. Optimizer moments are reset.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] on a version or rank mismatch, and
    /// [`ContinualError::ShapeMismatch`] for a layer whose buffers disagree
    /// with its declared shape.
    pub fn import_state(&mut self, state: &LoraState) -> Result<()> {
        if state.version != LORA_STATE_VERSION {
            return Err(ContinualError::Checkpoint(format!(
                "LoRA state version {} (expected {LORA_STATE_VERSION})",
                state.version
            )));
        }
        if state.rank != self.settings.r {
            return Err(ContinualError::Checkpoint(format!(
                "LoRA rank {} does not match configured rank {}",
                state.rank, self.settings.r
            )));
        }

        let mut layers = BTreeMap::new();
        for (name, s) in &state.layers {
            ensure_len(&format!("lora.{name}.a"), state.rank * s.in_features, s.a.len())?;
            ensure_len(&format!("lora.{name}.b"), s.out_features * state.rank, s.b.len())?;
            let mut layer = LoraLayer::new(
                s.in_features,
                s.out_features,
                state.rank,
                self.scaling(),
                s.a.clone(),
            );
            layer.b.clone_from(&s.b);
            layers.insert(name.clone(), layer);
        }
        self.layers = layers;
        Ok(())
    }
}

//! Inference-engine collaborator and a small reference transformer.
//!
//! The training core only needs two capabilities from a model: turning text
//! into token ids and running a forward pass that records every activation
//! the backward pass reads. [`InferenceEngine`] is that boundary.
//! [`TinyTransformer`] implements it with a pure, deterministic pre-norm
//! transformer (byte tokenizer, learned positions, causal multi-head
//! attention, SwiGLU FFN, layer norm) over a [`WeightStore`].

use std::fmt::Debug;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::ModelSettings;
use crate::error::{ContinualError, Result};
use crate::gradients::{layer_norm, ActivationCache, LayerCache, LayerWeights};
use crate::lora::LoraAdapter;
use crate::tensor_ops::{dot, matvec, silu, softmax};
use crate::weights::WeightStore;

/// Layer-relative and global weight names.
pub mod names {
    /// Attention layer-norm scale.
    pub const ATTN_NORM_WEIGHT: &str = "attn_norm.weight";
    /// Attention layer-norm shift.
    pub const ATTN_NORM_BIAS: &str = "attn_norm.bias";
    /// Query projection.
    pub const Q_PROJ: &str = "attn.q_proj";
    /// Key projection.
    pub const K_PROJ: &str = "attn.k_proj";
    /// Value projection.
    pub const V_PROJ: &str = "attn.v_proj";
    /// Output projection.
    pub const O_PROJ: &str = "attn.o_proj";
    /// FFN layer-norm scale.
    pub const FFN_NORM_WEIGHT: &str = "ffn_norm.weight";
    /// FFN layer-norm shift.
    pub const FFN_NORM_BIAS: &str = "ffn_norm.bias";
    /// SwiGLU gate projection.
    pub const GATE_PROJ: &str = "ffn.gate_proj";
    /// SwiGLU up projection.
    pub const UP_PROJ: &str = "ffn.up_proj";
    /// FFN down projection.
    pub const DOWN_PROJ: &str = "ffn.down_proj";
    /// Output head.
    pub const LM_HEAD: &str = "lm_head";
    /// Final layer-norm scale.
    pub const FINAL_NORM_WEIGHT: &str = "final_norm.weight";
    /// Final layer-norm shift.
    pub const FINAL_NORM_BIAS: &str = "final_norm.bias";
    /// Token embedding table.
    pub const EMBED_TOKENS: &str = "embed_tokens";
    /// Position embedding table.
    pub const EMBED_POSITIONS: &str = "embed_positions";

    /// Every linear projection inside a layer.
    pub const PROJECTIONS: [&str; 7] = [
        Q_PROJ, K_PROJ, V_PROJ, O_PROJ, GATE_PROJ, UP_PROJ, DOWN_PROJ,
    ];
}

/// Full name of a per-layer parameter, e.g. `layers.0.attn.q_proj`.
#[must_use]
pub fn layer_param(layer: usize, suffix: &str) -> String {
    format!("layers.{layer}.{suffix}")
}

/// Row-major shape of a named parameter. Vectors have `rows == 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamShape {
    /// Full weight name.
    pub name: String,
    /// Output dimension.
    pub rows: usize,
    /// Input dimension.
    pub cols: usize,
}

impl ParamShape {
    fn new(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        Self {
            name: name.into(),
            rows,
            cols,
        }
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the shape holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is a linear projection inside a layer.
    #[must_use]
    pub fn is_projection(&self) -> bool {
        self.name.starts_with("layers.") && self.name.ends_with("_proj")
    }
}

/// Every parameter of the reference architecture, in a stable order.
#[must_use]
pub fn parameter_shapes(dims: &ModelSettings) -> Vec<ParamShape> {
    let d = dims.hidden_size;
    let f = dims.ffn_size;
    let mut shapes = vec![
        ParamShape::new(names::EMBED_TOKENS, dims.vocab_size, d),
        ParamShape::new(names::EMBED_POSITIONS, dims.max_seq_len, d),
    ];
    for i in 0..dims.num_layers {
        let p = |suffix: &str| layer_param(i, suffix);
        shapes.extend([
            ParamShape::new(p(names::ATTN_NORM_WEIGHT), 1, d),
            ParamShape::new(p(names::ATTN_NORM_BIAS), 1, d),
            ParamShape::new(p(names::Q_PROJ), d, d),
            ParamShape::new(p(names::K_PROJ), d, d),
            ParamShape::new(p(names::V_PROJ), d, d),
            ParamShape::new(p(names::O_PROJ), d, d),
            ParamShape::new(p(names::FFN_NORM_WEIGHT), 1, d),
            ParamShape::new(p(names::FFN_NORM_BIAS), 1, d),
            ParamShape::new(p(names::GATE_PROJ), f, d),
            ParamShape::new(p(names::UP_PROJ), f, d),
            ParamShape::new(p(names::DOWN_PROJ), d, f),
        ]);
    }
    shapes.extend([
        ParamShape::new(names::FINAL_NORM_WEIGHT, 1, d),
        ParamShape::new(names::FINAL_NORM_BIAS, 1, d),
        ParamShape::new(names::LM_HEAD, dims.vocab_size, d),
    ]);
    shapes
}

/// What the training core needs from a model.
pub trait InferenceEngine: Send + Sync + Debug {
    /// Text to token ids.
    fn tokenize(&self, text: &str) -> Vec<u32>;

    /// Architecture dimensions.
    fn dims(&self) -> &ModelSettings;

    /// Forward pass over `tokens`, recording every activation.
    ///
    /// Projections with an adapter in `adapter` include its contribution.
    ///
    /// # Errors
    ///
    /// Returns a shape error for missing weights or out-of-range tokens.
    fn forward_with_cache(
        &self,
        weights: &WeightStore,
        adapter: Option<&LoraAdapter>,
        tokens: &[u32],
    ) -> Result<ActivationCache>;
}

/// Byte-level pre-norm transformer.
#[derive(Debug, Clone)]
pub struct TinyTransformer {
    dims: ModelSettings,
}

impl TinyTransformer {
    /// Create a model with the given dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if heads do not divide the hidden size or the
    /// vocabulary cannot hold every byte.
    pub fn new(dims: ModelSettings) -> Result<Self> {
        if dims.num_heads == 0 || dims.hidden_size % dims.num_heads != 0 {
            return Err(ContinualError::Config(format!(
                "num_heads ({}) must divide hidden_size ({})",
                dims.num_heads, dims.hidden_size
            )));
        }
        if dims.vocab_size < 256 {
            return Err(ContinualError::Config(format!(
                "byte tokenizer needs vocab_size >= 256, got {}",
                dims.vocab_size
            )));
        }
        Ok(Self { dims })
    }

    /// Fresh weights: uniform `±1/√cols` matrices, `±0.1` embeddings,
    /// unit norm scales, zero norm shifts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn init_weights(&self, seed: u64) -> WeightStore {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut store = WeightStore::new();
        for shape in parameter_shapes(&self.dims) {
            let values = if shape.name.ends_with(".bias") {
                vec![0.0; shape.len()]
            } else if shape.name.ends_with(".weight") {
                vec![1.0; shape.len()]
            } else {
                let bound = if shape.name.starts_with("embed_") {
                    0.1
                } else {
                    1.0 / (shape.cols as f32).sqrt()
                };
                (0..shape.len())
                    .map(|_| rng.gen_range(-bound..bound))
                    .collect()
            };
            store.set(shape.name, values);
        }
        store
    }

    fn project(
        adapter: Option<&LoraAdapter>,
        name: &str,
        weight: &[f32],
        x: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<Vec<f32>> {
        let base = matvec(weight, x, rows, cols);
        match adapter {
            Some(lora) if lora.has_layer(name) => lora.forward(name, x, &base),
            _ => Ok(base),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn layer_forward(
        &self,
        weights: &WeightStore,
        adapter: Option<&LoraAdapter>,
        layer: usize,
        input: Vec<Vec<f32>>,
    ) -> Result<LayerCache> {
        let d = self.dims.hidden_size;
        let f = self.dims.ffn_size;
        let heads = self.dims.num_heads;
        let head_dim = d / heads;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let eps = self.dims.norm_eps;
        let seq = input.len();

        let lw = LayerWeights::from_store(weights, &self.dims, layer)?;
        let attn_beta = weights.require(&layer_param(layer, names::ATTN_NORM_BIAS), d)?;
        let ffn_beta = weights.require(&layer_param(layer, names::FFN_NORM_BIAS), d)?;
        let name = |suffix: &str| layer_param(layer, suffix);

        let mut cache = LayerCache {
            attn_scores: vec![Vec::with_capacity(seq); heads],
            attn_weights: vec![Vec::with_capacity(seq); heads],
            ..Default::default()
        };

        for x in &input {
            let normed = layer_norm(x, lw.attn_norm, attn_beta, eps);
            cache.q.push(Self::project(adapter, &name(names::Q_PROJ), lw.attention.q, &normed, d, d)?);
            cache.k.push(Self::project(adapter, &name(names::K_PROJ), lw.attention.k, &normed, d, d)?);
            cache.v.push(Self::project(adapter, &name(names::V_PROJ), lw.attention.v, &normed, d, d)?);
            cache.post_norm.push(normed);
        }

        for t in 0..seq {
            let mut context = vec![0.0; d];
            for h in 0..heads {
                let span = h * head_dim..(h + 1) * head_dim;
                let scores: Vec<f32> = (0..=t)
                    .map(|s| dot(&cache.q[t][span.clone()], &cache.k[s][span.clone()]) * scale)
                    .collect();
                let probs = softmax(&scores);
                for (s, &p) in probs.iter().enumerate() {
                    for (c, &v) in context[span.clone()].iter_mut().zip(&cache.v[s][span.clone()]) {
                        *c += p * v;
                    }
                }
                cache.attn_scores[h].push(scores);
                cache.attn_weights[h].push(probs);
            }

            let projected =
                Self::project(adapter, &name(names::O_PROJ), lw.attention.o, &context, d, d)?;
            let residual: Vec<f32> = input[t].iter().zip(&projected).map(|(a, b)| a + b).collect();
            let ffn_input = layer_norm(&residual, lw.ffn_norm, ffn_beta, eps);

            let gate = Self::project(adapter, &name(names::GATE_PROJ), lw.ffn.gate, &ffn_input, f, d)?;
            let up = Self::project(adapter, &name(names::UP_PROJ), lw.ffn.up, &ffn_input, f, d)?;
            let activated: Vec<f32> = gate.iter().zip(&up).map(|(&g, &u)| silu(g) * u).collect();
            let output =
                Self::project(adapter, &name(names::DOWN_PROJ), lw.ffn.down, &activated, d, f)?;

            cache.attn_output.push(context);
            cache.residual.push(residual);
            cache.ffn_input.push(ffn_input);
            cache.ffn_gate.push(gate);
            cache.ffn_up.push(up);
            cache.ffn_activated.push(activated);
            cache.ffn_output.push(output);
        }

        cache.input = input;
        Ok(cache)
    }
}

impl InferenceEngine for TinyTransformer {
    fn tokenize(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    fn dims(&self) -> &ModelSettings {
        &self.dims
    }

    fn forward_with_cache(
        &self,
        weights: &WeightStore,
        adapter: Option<&LoraAdapter>,
        tokens: &[u32],
    ) -> Result<ActivationCache> {
        let d = self.dims.hidden_size;
        let vocab = self.dims.vocab_size;
        if tokens.is_empty() || tokens.len() > self.dims.max_seq_len {
            return Err(ContinualError::shape(
                "forward.sequence_length",
                self.dims.max_seq_len,
                tokens.len(),
            ));
        }

        let embed = weights.require(names::EMBED_TOKENS, vocab * d)?;
        let positions = weights.require(names::EMBED_POSITIONS, self.dims.max_seq_len * d)?;
        let mut x = Vec::with_capacity(tokens.len());
        for (t, &token) in tokens.iter().enumerate() {
            let tok = token as usize;
            if tok >= vocab {
                return Err(ContinualError::shape("forward.token", vocab, tok));
            }
            x.push(
                embed[tok * d..(tok + 1) * d]
                    .iter()
                    .zip(&positions[t * d..(t + 1) * d])
                    .map(|(e, p)| e + p)
                    .collect::<Vec<f32>>(),
            );
        }

        let mut layers = Vec::with_capacity(self.dims.num_layers);
        for i in 0..self.dims.num_layers {
            let cache = self.layer_forward(weights, adapter, i, x)?;
            x = cache.output();
            layers.push(cache);
        }

        let gamma = weights.require(names::FINAL_NORM_WEIGHT, d)?;
        let beta = weights.require(names::FINAL_NORM_BIAS, d)?;
        let lm_head = weights.require(names::LM_HEAD, vocab * d)?;
        let final_norm: Vec<Vec<f32>> = x
            .iter()
            .map(|row| layer_norm(row, gamma, beta, self.dims.norm_eps))
            .collect();
        let logits = final_norm
            .iter()
            .map(|row| matvec(lm_head, row, vocab, d))
            .collect();

        Ok(ActivationCache {
            tokens: tokens.to_vec(),
            layers,
            final_input: x,
            final_norm,
            logits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContinualConfig, LoraSettings};

    fn model() -> (TinyTransformer, WeightStore) {
        let dims = ContinualConfig::tiny_preset().model;
        let m = TinyTransformer::new(dims).unwrap();
        let w = m.init_weights(3);
        (m, w)
    }

    #[test]
    fn test_parameter_shapes_cover_store() {
        let (m, w) = model();
        let shapes = parameter_shapes(m.dims());
        assert_eq!(shapes.len(), w.len());
        for s in &shapes {
            assert_eq!(w.get(&s.name).unwrap().len(), s.len(), "{}", s.name);
        }
        let projections = shapes.iter().filter(|s| s.is_projection()).count();
        assert_eq!(projections, 7 * m.dims().num_layers);
    }

    #[test]
    fn test_forward_shapes() {
        let (m, w) = model();
        let tokens = m.tokenize("hello");
        assert_eq!(tokens, vec![104, 101, 108, 108, 111]);
        let cache = m.forward_with_cache(&w, None, &tokens).unwrap();
        assert_eq!(cache.logits.len(), 5);
        assert!(cache.logits.iter().all(|l| l.len() == m.dims().vocab_size));
        assert_eq!(cache.layers.len(), m.dims().num_layers);
        let heads = m.dims().num_heads;
        assert_eq!(cache.layers[0].attn_weights.len(), heads);
        assert_eq!(cache.layers[0].attn_weights[0][4].len(), 5);
    }

    #[test]
    fn test_forward_is_deterministic() {
        let (m, w) = model();
        let a = m.forward_with_cache(&w, None, &[1, 2, 3]).unwrap();
        let b = m.forward_with_cache(&w, None, &[1, 2, 3]).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.init_weights(3), w);
    }

    #[test]
    fn test_causal_prefix_is_stable() {
        let (m, w) = model();
        let short = m.forward_with_cache(&w, None, &[10, 20]).unwrap();
        let long = m.forward_with_cache(&w, None, &[10, 20, 30]).unwrap();
        for t in 0..2 {
            for (a, b) in short.logits[t].iter().zip(&long.logits[t]) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_fresh_adapter_does_not_change_output() {
        let (m, w) = model();
        let mut lora = LoraAdapter::cpu(&LoraSettings::default(), 0);
        let d = m.dims().hidden_size;
        lora.initialize_layer(&layer_param(0, names::Q_PROJ), d, d);
        let base = m.forward_with_cache(&w, None, &[5, 6, 7]).unwrap();
        let adapted = m.forward_with_cache(&w, Some(&lora), &[5, 6, 7]).unwrap();
        assert_eq!(base.logits, adapted.logits);
    }

    #[test]
    fn test_rejects_bad_input() {
        let (m, w) = model();
        assert!(m.forward_with_cache(&w, None, &[]).is_err());
        assert!(m.forward_with_cache(&w, None, &[9999]).is_err());
        let too_long = vec![1; m.dims().max_seq_len + 1];
        assert!(m.forward_with_cache(&w, None, &too_long).is_err());
        assert!(m.forward_with_cache(&WeightStore::new(), None, &[1]).is_err());
    }

    #[test]
    fn test_new_validates_dims() {
        let mut dims = ModelSettings::default();
        dims.num_heads = 5;
        assert!(TinyTransformer::new(dims).is_err());
    }
}

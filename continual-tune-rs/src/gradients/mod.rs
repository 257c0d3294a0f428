//! Manual backpropagation through the reference transformer.
//!
//! Every function here is stateless: it reads cached forward activations and
//! an upstream gradient, and returns parameter gradients plus the gradient to
//! hand to the previous block. Shape violations in the cache are collaborator
//! contract breaches and surface as [`ContinualError::ShapeMismatch`].

pub mod attention;
pub mod ffn;
pub mod layer_norm;

use std::collections::BTreeMap;

pub use attention::{attention_backward, softmax_backward, AttentionGradients, AttentionWeights};
pub use ffn::{ffn_backward, swiglu_derivative, FfnGradients, FfnWeights};
pub use layer_norm::{layer_norm, layer_norm_backward, LayerNormGradients};

use crate::config::ModelSettings;
use crate::error::{ensure_len, ContinualError, Result};
use crate::model::{layer_param, names};
use crate::tensor_ops::{self, add_assign, matvec_t, outer_add, softmax};
use crate::weights::WeightStore;

/// Cached activations of one transformer layer, one row per position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerCache {
    /// Layer input (residual stream).
    pub input: Vec<Vec<f32>>,
    /// Output of the attention layer norm.
    pub post_norm: Vec<Vec<f32>>,
    /// Query projections.
    pub q: Vec<Vec<f32>>,
    /// Key projections.
    pub k: Vec<Vec<f32>>,
    /// Value projections.
    pub v: Vec<Vec<f32>>,
    /// Scaled causal scores, `[head][t][0..=t]`.
    pub attn_scores: Vec<Vec<Vec<f32>>>,
    /// Softmax of the scores, same layout.
    pub attn_weights: Vec<Vec<Vec<f32>>>,
    /// Concatenated head outputs before the output projection.
    pub attn_output: Vec<Vec<f32>>,
    /// `input + Wo · attn_output`.
    pub residual: Vec<Vec<f32>>,
    /// Output of the FFN layer norm.
    pub ffn_input: Vec<Vec<f32>>,
    /// Gate projection.
    pub ffn_gate: Vec<Vec<f32>>,
    /// Up projection.
    pub ffn_up: Vec<Vec<f32>>,
    /// `silu(gate) ⊙ up`.
    pub ffn_activated: Vec<Vec<f32>>,
    /// Down projection.
    pub ffn_output: Vec<Vec<f32>>,
}

impl LayerCache {
    /// Number of positions.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.input.len()
    }

    /// Layer output: `residual + ffn_output`.
    #[must_use]
    pub fn output(&self) -> Vec<Vec<f32>> {
        self.residual
            .iter()
            .zip(&self.ffn_output)
            .map(|(r, f)| r.iter().zip(f).map(|(a, b)| a + b).collect())
            .collect()
    }
}

/// Everything a forward pass caches for backpropagation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationCache {
    /// Input token ids.
    pub tokens: Vec<u32>,
    /// Per-layer caches.
    pub layers: Vec<LayerCache>,
    /// Input of the final layer norm.
    pub final_input: Vec<Vec<f32>>,
    /// Output of the final layer norm.
    pub final_norm: Vec<Vec<f32>>,
    /// Logits per position.
    pub logits: Vec<Vec<f32>>,
}

pub(crate) fn ensure_rows(context: &str, rows: &[Vec<f32>], n: usize, width: usize) -> Result<()> {
    ensure_len(context, n, rows.len())?;
    for row in rows {
        ensure_len(context, width, row.len())?;
    }
    Ok(())
}

/// Rescale `grad` so its L2 norm is at most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grad: &mut [f32], max_norm: f32) -> f32 {
    let norm = tensor_ops::l2_norm(grad);
    if norm > max_norm && norm > 0.0 {
        tensor_ops::scale(grad, max_norm / norm);
    }
    norm
}

/// Clip a set of tensors by their joint L2 norm. Returns the norm before clipping.
pub fn clip_global_norm<'a>(grads: impl IntoIterator<Item = &'a mut Vec<f32>>, max_norm: f32) -> f32 {
    let mut grads: Vec<&'a mut Vec<f32>> = grads.into_iter().collect();
    let norm = grads
        .iter()
        .flat_map(|g| g.iter())
        .map(|v| v * v)
        .sum::<f32>()
        .sqrt();
    if norm > max_norm && norm > 0.0 {
        let factor = max_norm / norm;
        for g in &mut grads {
            tensor_ops::scale(g, factor);
        }
    }
    norm
}

/// `target += source`.
///
/// # Errors
///
/// Returns a shape error if the lengths differ.
pub fn accumulate(target: &mut [f32], source: &[f32]) -> Result<()> {
    ensure_len("accumulate", target.len(), source.len())?;
    add_assign(target, source);
    Ok(())
}

/// Set every element to zero.
pub fn zero(grad: &mut [f32]) {
    grad.fill(0.0);
}

/// Mean cross-entropy over `targets` (`(position, token)` pairs) and its
/// gradient with respect to the logits.
///
/// Positions without a target get a zero gradient row.
///
/// # Errors
///
/// Returns a shape error if a target position or token is out of range.
#[allow(clippy::cast_precision_loss)]
pub fn cross_entropy(logits: &[Vec<f32>], targets: &[(usize, u32)]) -> Result<(f32, Vec<Vec<f32>>)> {
    let mut d_logits: Vec<Vec<f32>> = logits.iter().map(|l| vec![0.0; l.len()]).collect();
    if targets.is_empty() {
        return Ok((0.0, d_logits));
    }
    let n = targets.len() as f32;
    let mut loss = 0.0;
    for &(pos, token) in targets {
        let row = logits
            .get(pos)
            .ok_or_else(|| ContinualError::shape("cross_entropy.position", logits.len(), pos))?;
        let token = token as usize;
        if token >= row.len() {
            return Err(ContinualError::shape("cross_entropy.token", row.len(), token));
        }
        let probs = softmax(row);
        loss -= probs[token].max(f32::MIN_POSITIVE).ln();
        for (d, p) in d_logits[pos].iter_mut().zip(&probs) {
            *d += p / n;
        }
        d_logits[pos][token] -= 1.0 / n;
    }
    Ok((loss / n, d_logits))
}

/// Borrowed weights of one transformer layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerWeights<'a> {
    /// Attention layer-norm scale.
    pub attn_norm: &'a [f32],
    /// Attention projections.
    pub attention: AttentionWeights<'a>,
    /// FFN layer-norm scale.
    pub ffn_norm: &'a [f32],
    /// FFN projections.
    pub ffn: FfnWeights<'a>,
}

impl<'a> LayerWeights<'a> {
    /// Look up layer `layer` in `store`.
    ///
    /// # Errors
    ///
    /// Returns a shape error for a missing or mis-sized tensor.
    pub fn from_store(store: &'a WeightStore, dims: &ModelSettings, layer: usize) -> Result<Self> {
        let d = dims.hidden_size;
        let f = dims.ffn_size;
        let get = |suffix: &str, len: usize| store.require(&layer_param(layer, suffix), len);
        Ok(Self {
            attn_norm: get(names::ATTN_NORM_WEIGHT, d)?,
            attention: AttentionWeights {
                q: get(names::Q_PROJ, d * d)?,
                k: get(names::K_PROJ, d * d)?,
                v: get(names::V_PROJ, d * d)?,
                o: get(names::O_PROJ, d * d)?,
            },
            ffn_norm: get(names::FFN_NORM_WEIGHT, d)?,
            ffn: FfnWeights {
                gate: get(names::GATE_PROJ, f * d)?,
                up: get(names::UP_PROJ, f * d)?,
                down: get(names::DOWN_PROJ, d * f)?,
            },
        })
    }
}

/// Gradients of one transformer layer.
#[derive(Debug, Clone, Default)]
pub struct LayerGradients {
    /// Parameter gradients keyed by layer-relative suffix (e.g. `attn.q_proj`).
    pub weights: BTreeMap<String, Vec<f32>>,
    /// Per-position intermediate attention gradients (parameter grads moved out).
    pub attention: AttentionGradients,
    /// Per-position intermediate FFN gradients (parameter grads moved out).
    pub ffn: FfnGradients,
    /// Gradient of the residual stream after attention, which is also the
    /// gradient of the output projection.
    pub d_residual: Vec<Vec<f32>>,
    /// Gradient of the layer output, which is also the gradient of the down projection.
    pub d_output: Vec<Vec<f32>>,
    /// Gradient of the layer input.
    pub d_input: Vec<Vec<f32>>,
}

impl LayerGradients {
    /// `(inputs, output gradients)` of a projection, keyed by its suffix
    /// (`q_proj`, `k_proj`, `v_proj`, `o_proj`, `gate_proj`, `up_proj`, `down_proj`).
    #[must_use]
    pub fn projection_io<'c>(
        &'c self,
        cache: &'c LayerCache,
        projection: &str,
    ) -> Option<(&'c [Vec<f32>], &'c [Vec<f32>])> {
        let (inputs, grads) = match projection {
            "q_proj" => (&cache.post_norm, &self.attention.d_q),
            "k_proj" => (&cache.post_norm, &self.attention.d_k),
            "v_proj" => (&cache.post_norm, &self.attention.d_v),
            "o_proj" => (&cache.attn_output, &self.d_residual),
            "gate_proj" => (&cache.ffn_input, &self.ffn.d_gate),
            "up_proj" => (&cache.ffn_input, &self.ffn.d_up),
            "down_proj" => (&cache.ffn_activated, &self.d_output),
            _ => return None,
        };
        Some((inputs.as_slice(), grads.as_slice()))
    }
}

fn norm_backward_rows(
    inputs: &[Vec<f32>],
    gamma: &[f32],
    d_out: &[Vec<f32>],
    eps: f32,
) -> Result<(Vec<Vec<f32>>, Vec<f32>, Vec<f32>)> {
    let mut d_gamma = vec![0.0; gamma.len()];
    let mut d_beta = vec![0.0; gamma.len()];
    let mut d_input = Vec::with_capacity(inputs.len());
    for (x, d) in inputs.iter().zip(d_out) {
        let g = layer_norm_backward(x, gamma, d, eps)?;
        add_assign(&mut d_gamma, &g.d_gamma);
        add_assign(&mut d_beta, &g.d_beta);
        d_input.push(g.d_input);
    }
    Ok((d_input, d_gamma, d_beta))
}

/// Backward through one pre-norm layer:
/// `h = x + Attn(LN1(x))`, `out = h + FFN(LN2(h))`.
///
/// # Errors
///
/// Returns a shape error if the cache, weights, or `d_out` are inconsistent.
pub fn layer_backward(
    cache: &LayerCache,
    weights: &LayerWeights<'_>,
    dims: &ModelSettings,
    d_out: &[Vec<f32>],
) -> Result<LayerGradients> {
    let d = dims.hidden_size;
    let eps = dims.norm_eps;
    ensure_rows("layer.d_out", d_out, cache.seq_len(), d)?;
    ensure_rows("layer.residual", &cache.residual, cache.seq_len(), d)?;
    ensure_rows("layer.input", &cache.input, cache.seq_len(), d)?;

    let mut ffn = ffn_backward(cache, weights.ffn, d, dims.ffn_size, d_out)?;
    let (d_ln2, d_ffn_gamma, d_ffn_beta) =
        norm_backward_rows(&cache.residual, weights.ffn_norm, &ffn.d_input, eps)?;
    let d_residual: Vec<Vec<f32>> = d_out
        .iter()
        .zip(&d_ln2)
        .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x + y).collect())
        .collect();

    let mut attn = attention_backward(cache, weights.attention, d, dims.num_heads, &d_residual)?;
    let (d_ln1, d_attn_gamma, d_attn_beta) =
        norm_backward_rows(&cache.input, weights.attn_norm, &attn.d_input, eps)?;
    let d_input = d_residual
        .iter()
        .zip(&d_ln1)
        .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x + y).collect())
        .collect();

    let mut params = BTreeMap::new();
    params.insert(names::ATTN_NORM_WEIGHT.to_string(), d_attn_gamma);
    params.insert(names::ATTN_NORM_BIAS.to_string(), d_attn_beta);
    params.insert(names::Q_PROJ.to_string(), std::mem::take(&mut attn.d_q_proj));
    params.insert(names::K_PROJ.to_string(), std::mem::take(&mut attn.d_k_proj));
    params.insert(names::V_PROJ.to_string(), std::mem::take(&mut attn.d_v_proj));
    params.insert(names::O_PROJ.to_string(), std::mem::take(&mut attn.d_o_proj));
    params.insert(names::FFN_NORM_WEIGHT.to_string(), d_ffn_gamma);
    params.insert(names::FFN_NORM_BIAS.to_string(), d_ffn_beta);
    params.insert(names::GATE_PROJ.to_string(), std::mem::take(&mut ffn.d_gate_proj));
    params.insert(names::UP_PROJ.to_string(), std::mem::take(&mut ffn.d_up_proj));
    params.insert(names::DOWN_PROJ.to_string(), std::mem::take(&mut ffn.d_down_proj));

    Ok(LayerGradients {
        weights: params,
        attention: attn,
        ffn,
        d_residual,
        d_output: d_out.to_vec(),
        d_input,
    })
}

/// Gradients of a whole forward pass.
#[derive(Debug, Clone, Default)]
pub struct ModelGradients {
    /// Parameter gradients keyed by full weight name.
    pub weights: BTreeMap<String, Vec<f32>>,
    /// Per-layer intermediates, in layer order.
    pub layers: Vec<LayerGradients>,
}

/// Backward from logit gradients to every parameter.
///
/// `weights` must be the weights the forward pass effectively used
/// (base weights with any adapters merged).
///
/// # Errors
///
/// Returns a shape error if the cache, weights, or `d_logits` are inconsistent.
pub fn backward(
    dims: &ModelSettings,
    weights: &WeightStore,
    cache: &ActivationCache,
    d_logits: &[Vec<f32>],
) -> Result<ModelGradients> {
    let d = dims.hidden_size;
    let vocab = dims.vocab_size;
    let seq = cache.tokens.len();
    ensure_rows("backward.d_logits", d_logits, seq, vocab)?;
    ensure_rows("backward.final_norm", &cache.final_norm, seq, d)?;
    ensure_len("backward.layers", dims.num_layers, cache.layers.len())?;

    let mut grads = ModelGradients::default();

    // Output head and final norm.
    let lm_head = weights.require(names::LM_HEAD, vocab * d)?;
    let mut d_lm_head = vec![0.0; vocab * d];
    let mut d_final_norm = Vec::with_capacity(seq);
    for t in 0..seq {
        outer_add(&mut d_lm_head, &d_logits[t], &cache.final_norm[t], 1.0);
        d_final_norm.push(matvec_t(lm_head, &d_logits[t], vocab, d));
    }
    let gamma = weights.require(names::FINAL_NORM_WEIGHT, d)?;
    let (mut d_x, d_gamma, d_beta) =
        norm_backward_rows(&cache.final_input, gamma, &d_final_norm, dims.norm_eps)?;
    grads.weights.insert(names::LM_HEAD.to_string(), d_lm_head);
    grads.weights.insert(names::FINAL_NORM_WEIGHT.to_string(), d_gamma);
    grads.weights.insert(names::FINAL_NORM_BIAS.to_string(), d_beta);

    // Layers, last to first.
    let mut layers = Vec::with_capacity(dims.num_layers);
    for (i, layer_cache) in cache.layers.iter().enumerate().rev() {
        let lw = LayerWeights::from_store(weights, dims, i)?;
        let mut lg = layer_backward(layer_cache, &lw, dims, &d_x)?;
        for (suffix, g) in std::mem::take(&mut lg.weights) {
            grads.weights.insert(layer_param(i, &suffix), g);
        }
        d_x = std::mem::take(&mut lg.d_input);
        layers.push(lg);
    }
    layers.reverse();
    grads.layers = layers;

    // Embeddings.
    let mut d_embed = vec![0.0; vocab * d];
    let mut d_pos = vec![0.0; dims.max_seq_len * d];
    for (t, (&token, dx)) in cache.tokens.iter().zip(&d_x).enumerate() {
        let tok = token as usize;
        if tok >= vocab || t >= dims.max_seq_len {
            return Err(ContinualError::shape("backward.embedding", vocab, tok));
        }
        add_assign(&mut d_embed[tok * d..(tok + 1) * d], dx);
        add_assign(&mut d_pos[t * d..(t + 1) * d], dx);
    }
    grads.weights.insert(names::EMBED_TOKENS.to_string(), d_embed);
    grads.weights.insert(names::EMBED_POSITIONS.to_string(), d_pos);

    Ok(grads)
}

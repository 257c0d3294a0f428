//! Multi-head causal self-attention backward pass.
//!
//! Forward, per head `h` and position `t`:
//! `score[t][s] = q_h[t]·k_h[s] / √d_h` for `s ≤ t`, `w = softmax(score[t])`,
//! `ctx_h[t] = Σ_s w[t][s] · v_h[s]`, `y[t] = Wo · concat_h(ctx_h[t])`.

use super::{ensure_rows, LayerCache};
use crate::error::{ContinualError, Result};
use crate::tensor_ops::{dot, matvec_t, outer_add};

/// Borrowed attention projections, each `hidden × hidden`.
#[derive(Debug, Clone, Copy)]
pub struct AttentionWeights<'a> {
    /// Query projection.
    pub q: &'a [f32],
    /// Key projection.
    pub k: &'a [f32],
    /// Value projection.
    pub v: &'a [f32],
    /// Output projection.
    pub o: &'a [f32],
}

/// Gradients of the attention block.
#[derive(Debug, Clone, Default)]
pub struct AttentionGradients {
    /// Gradient of the query projection.
    pub d_q_proj: Vec<f32>,
    /// Gradient of the key projection.
    pub d_k_proj: Vec<f32>,
    /// Gradient of the value projection.
    pub d_v_proj: Vec<f32>,
    /// Gradient of the output projection.
    pub d_o_proj: Vec<f32>,
    /// Per-position gradient of the queries.
    pub d_q: Vec<Vec<f32>>,
    /// Per-position gradient of the keys.
    pub d_k: Vec<Vec<f32>>,
    /// Per-position gradient of the values.
    pub d_v: Vec<Vec<f32>>,
    /// Per-position gradient of the concatenated head outputs.
    pub d_attn_output: Vec<Vec<f32>>,
    /// Per-position gradient of the block input (the normalised residual).
    pub d_input: Vec<Vec<f32>>,
}

/// `dScores = w ⊙ (dW − Σ(dW ⊙ w))`.
#[must_use]
pub fn softmax_backward(weights: &[f32], d_weights: &[f32]) -> Vec<f32> {
    let inner = dot(weights, d_weights);
    weights
        .iter()
        .zip(d_weights)
        .map(|(w, d)| w * (d - inner))
        .collect()
}

/// Backward through output projection, weighted values, softmax, scaled QK,
/// and the three input projections.
///
/// `d_out[t]` is the gradient of the output projection at position `t`.
///
/// # Errors
///
/// Returns a shape error if the cache or `d_out` are inconsistent.
#[allow(clippy::cast_precision_loss, clippy::too_many_lines)]
pub fn attention_backward(
    cache: &LayerCache,
    weights: AttentionWeights<'_>,
    hidden: usize,
    num_heads: usize,
    d_out: &[Vec<f32>],
) -> Result<AttentionGradients> {
    let seq = cache.seq_len();
    if num_heads == 0 || hidden % num_heads != 0 {
        return Err(ContinualError::shape("attention.heads", hidden, num_heads));
    }
    ensure_rows("attention.d_out", d_out, seq, hidden)?;
    ensure_rows("attention.post_norm", &cache.post_norm, seq, hidden)?;
    ensure_rows("attention.q", &cache.q, seq, hidden)?;
    ensure_rows("attention.k", &cache.k, seq, hidden)?;
    ensure_rows("attention.v", &cache.v, seq, hidden)?;
    ensure_rows("attention.output", &cache.attn_output, seq, hidden)?;
    if cache.attn_weights.len() != num_heads {
        return Err(ContinualError::shape(
            "attention.weights.heads",
            num_heads,
            cache.attn_weights.len(),
        ));
    }

    let head_dim = hidden / num_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut grads = AttentionGradients {
        d_q_proj: vec![0.0; hidden * hidden],
        d_k_proj: vec![0.0; hidden * hidden],
        d_v_proj: vec![0.0; hidden * hidden],
        d_o_proj: vec![0.0; hidden * hidden],
        d_q: vec![vec![0.0; hidden]; seq],
        d_k: vec![vec![0.0; hidden]; seq],
        d_v: vec![vec![0.0; hidden]; seq],
        ..Default::default()
    };

    // Output projection.
    for t in 0..seq {
        outer_add(&mut grads.d_o_proj, &d_out[t], &cache.attn_output[t], 1.0);
        grads
            .d_attn_output
            .push(matvec_t(weights.o, &d_out[t], hidden, hidden));
    }

    for (h, head_weights) in cache.attn_weights.iter().enumerate() {
        let span = h * head_dim..(h + 1) * head_dim;
        for t in 0..seq {
            let w = &head_weights[t];
            if w.len() != t + 1 {
                return Err(ContinualError::shape("attention.weights.row", t + 1, w.len()));
            }
            let d_ctx = &grads.d_attn_output[t][span.clone()];

            // Weighted value aggregation.
            let d_w: Vec<f32> = (0..=t)
                .map(|s| dot(d_ctx, &cache.v[s][span.clone()]))
                .collect();
            for s in 0..=t {
                for (dv, &dc) in grads.d_v[s][span.clone()].iter_mut().zip(d_ctx) {
                    *dv += w[s] * dc;
                }
            }

            // Softmax, then scaled dot product.
            let d_scores = softmax_backward(w, &d_w);
            for (s, &ds) in d_scores.iter().enumerate() {
                let g = ds * scale;
                if g == 0.0 {
                    continue;
                }
                for i in span.clone() {
                    grads.d_q[t][i] += g * cache.k[s][i];
                    grads.d_k[s][i] += g * cache.q[t][i];
                }
            }
        }
    }

    // Input projections.
    for t in 0..seq {
        let x = &cache.post_norm[t];
        outer_add(&mut grads.d_q_proj, &grads.d_q[t], x, 1.0);
        outer_add(&mut grads.d_k_proj, &grads.d_k[t], x, 1.0);
        outer_add(&mut grads.d_v_proj, &grads.d_v[t], x, 1.0);

        let mut d_x = matvec_t(weights.q, &grads.d_q[t], hidden, hidden);
        for (proj, d) in [(weights.k, &grads.d_k[t]), (weights.v, &grads.d_v[t])] {
            for (acc, g) in d_x.iter_mut().zip(matvec_t(proj, d, hidden, hidden)) {
                *acc += g;
            }
        }
        grads.d_input.push(d_x);
    }

    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_ops::softmax;

    #[test]
    fn test_softmax_backward_matches_finite_difference() {
        let scores = [0.5, -1.0, 2.0];
        let upstream = [0.3, -0.2, 0.7];
        let w = softmax(&scores);
        let analytic = softmax_backward(&w, &upstream);

        let h = 1e-3;
        for i in 0..3 {
            let mut p = scores;
            let mut m = scores;
            p[i] += h;
            m[i] -= h;
            let fp = dot(&softmax(&p), &upstream);
            let fm = dot(&softmax(&m), &upstream);
            let numeric = (fp - fm) / (2.0 * h);
            assert!((numeric - analytic[i]).abs() < 1e-3);
        }
        // Softmax gradients always sum to zero.
        assert!(analytic.iter().sum::<f32>().abs() < 1e-6);
    }
}

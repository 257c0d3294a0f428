//! SwiGLU feed-forward backward pass.
//!
//! Forward: `gate = Wg·x`, `up = Wu·x`, `a = silu(gate) ⊙ up`, `y = Wd·a`.

use super::{ensure_rows, LayerCache};
use crate::error::Result;
use crate::tensor_ops::{matvec_t, outer_add, sigmoid, silu};

/// Borrowed FFN weights.
#[derive(Debug, Clone, Copy)]
pub struct FfnWeights<'a> {
    /// `ffn × hidden`.
    pub gate: &'a [f32],
    /// `ffn × hidden`.
    pub up: &'a [f32],
    /// `hidden × ffn`.
    pub down: &'a [f32],
}

/// Gradients of the FFN block.
#[derive(Debug, Clone, Default)]
pub struct FfnGradients {
    /// Gradient of the gate projection.
    pub d_gate_proj: Vec<f32>,
    /// Gradient of the up projection.
    pub d_up_proj: Vec<f32>,
    /// Gradient of the down projection.
    pub d_down_proj: Vec<f32>,
    /// Per-position gradient of the gate projection output.
    pub d_gate: Vec<Vec<f32>>,
    /// Per-position gradient of the up projection output.
    pub d_up: Vec<Vec<f32>>,
    /// Per-position gradient of the activation (input of the down projection).
    pub d_activated: Vec<Vec<f32>>,
    /// Per-position gradient of the block input.
    pub d_input: Vec<Vec<f32>>,
}

/// `(d/dgate, d/dup)` of `silu(gate) · up`.
///
/// Uses `d silu(g)/dg = σ(g) · (1 + g · (1 − σ(g)))`.
#[must_use]
pub fn swiglu_derivative(gate: f32, up: f32) -> (f32, f32) {
    let s = sigmoid(gate);
    (up * s * (1.0 + gate * (1.0 - s)), silu(gate))
}

/// Backward through down projection, SwiGLU, then gate/up projections.
///
/// # Errors
///
/// Returns a shape error if the cache or `d_out` are inconsistent.
pub fn ffn_backward(
    cache: &LayerCache,
    weights: FfnWeights<'_>,
    hidden: usize,
    ffn: usize,
    d_out: &[Vec<f32>],
) -> Result<FfnGradients> {
    let seq = cache.seq_len();
    ensure_rows("ffn.d_out", d_out, seq, hidden)?;
    ensure_rows("ffn.input", &cache.ffn_input, seq, hidden)?;
    ensure_rows("ffn.gate", &cache.ffn_gate, seq, ffn)?;
    ensure_rows("ffn.up", &cache.ffn_up, seq, ffn)?;
    ensure_rows("ffn.activated", &cache.ffn_activated, seq, ffn)?;

    let mut grads = FfnGradients {
        d_gate_proj: vec![0.0; ffn * hidden],
        d_up_proj: vec![0.0; ffn * hidden],
        d_down_proj: vec![0.0; hidden * ffn],
        ..Default::default()
    };

    for t in 0..seq {
        outer_add(&mut grads.d_down_proj, &d_out[t], &cache.ffn_activated[t], 1.0);
        let d_act = matvec_t(weights.down, &d_out[t], hidden, ffn);

        let (d_gate, d_up): (Vec<f32>, Vec<f32>) = d_act
            .iter()
            .zip(cache.ffn_gate[t].iter().zip(&cache.ffn_up[t]))
            .map(|(&da, (&g, &u))| {
                let (dg, du) = swiglu_derivative(g, u);
                (da * dg, da * du)
            })
            .unzip();

        let x = &cache.ffn_input[t];
        outer_add(&mut grads.d_gate_proj, &d_gate, x, 1.0);
        outer_add(&mut grads.d_up_proj, &d_up, x, 1.0);

        let mut d_x = matvec_t(weights.gate, &d_gate, ffn, hidden);
        for (d, u) in d_x.iter_mut().zip(matvec_t(weights.up, &d_up, ffn, hidden)) {
            *d += u;
        }

        grads.d_activated.push(d_act);
        grads.d_gate.push(d_gate);
        grads.d_up.push(d_up);
        grads.d_input.push(d_x);
    }
    Ok(grads)
}

//! Layer normalisation, forward and backward.

use crate::error::{ensure_len, Result};

/// Gradients of one layer-norm application.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNormGradients {
    /// Gradient with respect to the normalised input.
    pub d_input: Vec<f32>,
    /// Gradient of the scale.
    pub d_gamma: Vec<f32>,
    /// Gradient of the shift.
    pub d_beta: Vec<f32>,
}

#[allow(clippy::cast_precision_loss)]
fn moments(x: &[f32], eps: f32) -> (f32, f32) {
    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, (var + eps).sqrt())
}

/// `gamma ⊙ (x − mean) / std + beta`.
#[must_use]
pub fn layer_norm(x: &[f32], gamma: &[f32], beta: &[f32], eps: f32) -> Vec<f32> {
    let (mean, std) = moments(x, eps);
    x.iter()
        .zip(gamma.iter().zip(beta))
        .map(|(&v, (&g, &b))| g * (v - mean) / std + b)
        .collect()
}

/// Backward through [`layer_norm`] for a single vector.
///
/// `d_input = (dNorm − mean(dNorm) − x̂ · mean(dNorm ⊙ x̂)) / std`
/// with `dNorm = d_out ⊙ gamma`.
///
/// # Errors
///
/// Returns a shape error if `gamma` or `d_out` differ in length from `input`.
#[allow(clippy::cast_precision_loss)]
pub fn layer_norm_backward(
    input: &[f32],
    gamma: &[f32],
    d_out: &[f32],
    eps: f32,
) -> Result<LayerNormGradients> {
    ensure_len("layer_norm.gamma", input.len(), gamma.len())?;
    ensure_len("layer_norm.d_out", input.len(), d_out.len())?;

    let n = input.len() as f32;
    let (mean, std) = moments(input, eps);
    let normalized: Vec<f32> = input.iter().map(|v| (v - mean) / std).collect();

    let d_gamma: Vec<f32> = d_out.iter().zip(&normalized).map(|(d, x)| d * x).collect();
    let d_beta = d_out.to_vec();
    let d_norm: Vec<f32> = d_out.iter().zip(gamma).map(|(d, g)| d * g).collect();

    let mean_d = d_norm.iter().sum::<f32>() / n;
    let mean_dx = d_norm.iter().zip(&normalized).map(|(d, x)| d * x).sum::<f32>() / n;
    let d_input = d_norm
        .iter()
        .zip(&normalized)
        .map(|(d, x)| (d - mean_d - x * mean_dx) / std)
        .collect();

    Ok(LayerNormGradients {
        d_input,
        d_gamma,
        d_beta,
    })
}

//! Adam optimizer configuration and the reference CPU step.

use serde::{Deserialize, Serialize};

use crate::config::TrainingSettings;
use crate::error::{ensure_len, Result};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Beta1 for the first moment.
    pub beta1: f32,
    /// Beta2 for the second moment.
    pub beta2: f32,
    /// Epsilon for numerical stability.
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl From<&TrainingSettings> for AdamConfig {
    fn from(t: &TrainingSettings) -> Self {
        Self {
            beta1: t.beta1,
            beta2: t.beta2,
            eps: t.eps,
        }
    }
}

impl AdamConfig {
    /// Parameters for a single step.
    #[must_use]
    pub fn at_step(self, learning_rate: f32, step: u64) -> AdamStep {
        AdamStep {
            learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            step: step.max(1),
        }
    }
}

/// Everything one Adam update needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamStep {
    /// Learning rate.
    pub learning_rate: f32,
    /// Beta1.
    pub beta1: f32,
    /// Beta2.
    pub beta2: f32,
    /// Epsilon.
    pub eps: f32,
    /// 1-based step used for bias correction.
    pub step: u64,
}

impl AdamStep {
    /// `(1 - beta1^step, 1 - beta2^step)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn bias_corrections(&self) -> (f32, f32) {
        let t = self.step.min(i32::MAX as u64) as i32;
        (1.0 - self.beta1.powi(t), 1.0 - self.beta2.powi(t))
    }
}

/// In-place Adam update over flat buffers.
///
/// # Errors
///
/// Returns a shape error if the four buffers differ in length.
pub fn adam_step(
    param: &mut [f32],
    grad: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    cfg: &AdamStep,
) -> Result<()> {
    ensure_len("adam.grad", param.len(), grad.len())?;
    ensure_len("adam.m", param.len(), m.len())?;
    ensure_len("adam.v", param.len(), v.len())?;

    let (bc1, bc2) = cfg.bias_corrections();
    for i in 0..param.len() {
        let g = grad[i];
        m[i] = cfg.beta1 * m[i] + (1.0 - cfg.beta1) * g;
        v[i] = cfg.beta2 * v[i] + (1.0 - cfg.beta2) * g * g;
        let m_hat = m[i] / bc1;
        let v_hat = v[i] / bc2;
        param[i] -= cfg.learning_rate * m_hat / (v_hat.sqrt() + cfg.eps);
    }
    Ok(())
}

//! Compute backend capability.
//!
//! The trainer only needs three primitives: dense matmul, elementwise
//! arithmetic, and an Adam step. [`CpuBackend`] always works; [`CandleBackend`]
//! (feature `candle`) runs the same algorithms on a candle device. The backend
//! is chosen once, at engine construction.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::BackendKind;
use crate::error::{ensure_len, ContinualError, Result};
use crate::optimizer::{adam_step, AdamStep};

/// Elementwise binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
}

impl ElementwiseOp {
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
        }
    }
}

/// Matrix and optimizer primitives over row-major `f32` buffers.
pub trait ComputeBackend: Send + Sync + fmt::Debug {
    /// Backend name for logs and stats.
    fn name(&self) -> &'static str;

    /// `C[m×n] = A[m×k] · B[k×n]`.
    fn matmul(&self, a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Result<Vec<f32>>;

    /// Elementwise `op` over the first `size` elements of `a` and `b`.
    fn elementwise(&self, a: &[f32], b: &[f32], op: ElementwiseOp, size: usize)
        -> Result<Vec<f32>>;

    /// In-place Adam update.
    fn adam_step(
        &self,
        param: &mut [f32],
        grad: &[f32],
        m: &mut [f32],
        v: &mut [f32],
        step: &AdamStep,
    ) -> Result<()>;
}

fn check_matmul(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Result<()> {
    ensure_len("matmul.a", m * k, a.len())?;
    ensure_len("matmul.b", k * n, b.len())
}

/// Plain loops on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn matmul(&self, a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Result<Vec<f32>> {
        check_matmul(a, b, m, n, k)?;
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            let row = &a[i * k..(i + 1) * k];
            let out = &mut c[i * n..(i + 1) * n];
            for (p, &a_ip) in row.iter().enumerate() {
                if a_ip == 0.0 {
                    continue;
                }
                for (o, &b_pj) in out.iter_mut().zip(&b[p * n..(p + 1) * n]) {
                    *o += a_ip * b_pj;
                }
            }
        }
        Ok(c)
    }

    fn elementwise(
        &self,
        a: &[f32],
        b: &[f32],
        op: ElementwiseOp,
        size: usize,
    ) -> Result<Vec<f32>> {
        if a.len() < size || b.len() < size {
            return Err(ContinualError::shape("elementwise", size, a.len().min(b.len())));
        }
        Ok(a[..size]
            .iter()
            .zip(&b[..size])
            .map(|(&x, &y)| op.apply(x, y))
            .collect())
    }

    fn adam_step(
        &self,
        param: &mut [f32],
        grad: &[f32],
        m: &mut [f32],
        v: &mut [f32],
        step: &AdamStep,
    ) -> Result<()> {
        adam_step(param, grad, m, v, step)
    }
}

#[cfg(feature = "candle")]
pub use candle_backend::CandleBackend;

#[cfg(feature = "candle")]
mod candle_backend {
    use candle_core::{Device, Tensor};

    use super::{check_matmul, ComputeBackend, ElementwiseOp};
    use crate::error::{ensure_len, ContinualError, Result};
    use crate::optimizer::AdamStep;

    /// Candle tensors on CUDA when available, CPU otherwise.
    #[derive(Debug, Clone)]
    pub struct CandleBackend {
        device: Device,
    }

    impl CandleBackend {
        /// Pick CUDA device 0 if present.
        ///
        /// # Errors
        ///
        /// Returns the candle error if the device cannot be opened.
        pub fn new() -> Result<Self> {
            Ok(Self {
                device: Device::cuda_if_available(0)?,
            })
        }

        /// Use a specific device.
        #[must_use]
        pub fn with_device(device: Device) -> Self {
            Self { device }
        }

        fn tensor(&self, data: &[f32]) -> Result<Tensor> {
            Ok(Tensor::from_slice(data, data.len(), &self.device)?)
        }
    }

    impl ComputeBackend for CandleBackend {
        fn name(&self) -> &'static str {
            if self.device.is_cuda() {
                "candle-cuda"
            } else {
                "candle-cpu"
            }
        }

        fn matmul(&self, a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Result<Vec<f32>> {
            check_matmul(a, b, m, n, k)?;
            let a = Tensor::from_slice(a, (m, k), &self.device)?;
            let b = Tensor::from_slice(b, (k, n), &self.device)?;
            Ok(a.matmul(&b)?.flatten_all()?.to_vec1::<f32>()?)
        }

        fn elementwise(
            &self,
            a: &[f32],
            b: &[f32],
            op: ElementwiseOp,
            size: usize,
        ) -> Result<Vec<f32>> {
            if a.len() < size || b.len() < size {
                return Err(ContinualError::shape("elementwise", size, a.len().min(b.len())));
            }
            let a = self.tensor(&a[..size])?;
            let b = self.tensor(&b[..size])?;
            let c = match op {
                ElementwiseOp::Add => a.add(&b)?,
                ElementwiseOp::Sub => a.sub(&b)?,
                ElementwiseOp::Mul => a.mul(&b)?,
                ElementwiseOp::Div => a.div(&b)?,
            };
            Ok(c.to_vec1::<f32>()?)
        }

        fn adam_step(
            &self,
            param: &mut [f32],
            grad: &[f32],
            m: &mut [f32],
            v: &mut [f32],
            step: &AdamStep,
        ) -> Result<()> {
            ensure_len("adam.grad", param.len(), grad.len())?;
            ensure_len("adam.m", param.len(), m.len())?;
            ensure_len("adam.v", param.len(), v.len())?;

            let (bc1, bc2) = step.bias_corrections();
            let p = self.tensor(param)?;
            let g = self.tensor(grad)?;
            let m_t = self.tensor(m)?;
            let v_t = self.tensor(v)?;

            let b1 = f64::from(step.beta1);
            let b2 = f64::from(step.beta2);
            let m_new = (m_t.affine(b1, 0.0)? + g.affine(1.0 - b1, 0.0)?)?;
            let v_new = (v_t.affine(b2, 0.0)? + g.sqr()?.affine(1.0 - b2, 0.0)?)?;
            let m_hat = m_new.affine(1.0 / f64::from(bc1), 0.0)?;
            let denom = v_new
                .affine(1.0 / f64::from(bc2), 0.0)?
                .sqrt()?
                .affine(1.0, f64::from(step.eps))?;
            let update = m_hat.div(&denom)?.affine(f64::from(step.learning_rate), 0.0)?;
            let p_new = p.sub(&update)?;

            param.copy_from_slice(&p_new.to_vec1::<f32>()?);
            m.copy_from_slice(&m_new.to_vec1::<f32>()?);
            v.copy_from_slice(&v_new.to_vec1::<f32>()?);
            Ok(())
        }
    }
}

/// Resolve a [`BackendKind`] to a concrete backend.
///
/// # Errors
///
/// Returns [`ContinualError::Config`] if `candle` is requested but not compiled in.
pub fn select_backend(kind: BackendKind) -> Result<Arc<dyn ComputeBackend>> {
    let backend: Arc<dyn ComputeBackend> = match kind {
        BackendKind::Cpu => Arc::new(CpuBackend),
        #[cfg(feature = "candle")]
        BackendKind::Candle => Arc::new(CandleBackend::new()?),
        #[cfg(not(feature = "candle"))]
        BackendKind::Candle => {
            return Err(ContinualError::Config(
                "backend `candle` requires building with the `candle` feature".into(),
            ))
        }
        #[cfg(feature = "candle")]
        BackendKind::Auto => match CandleBackend::new() {
            Ok(b) => Arc::new(b),
            Err(e) => {
                tracing::warn!("candle backend unavailable ({e}), using CPU");
                Arc::new(CpuBackend)
            }
        },
        #[cfg(not(feature = "candle"))]
        BackendKind::Auto => Arc::new(CpuBackend),
    };
    info!(backend = backend.name(), "compute backend selected");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::AdamConfig;

    #[test]
    fn test_cpu_matmul() {
        let cpu = CpuBackend;
        // [1 2; 3 4] · [5; 6]
        let c = cpu.matmul(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0], 2, 1, 2).unwrap();
        assert_eq!(c, vec![17.0, 39.0]);

        // 1x3 · 3x2
        let c = cpu
            .matmul(&[1.0, 0.0, 2.0], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 1, 2, 3)
            .unwrap();
        assert_eq!(c, vec![11.0, 14.0]);
    }

    #[test]
    fn test_cpu_matmul_shape_error() {
        let err = CpuBackend.matmul(&[1.0; 3], &[1.0; 2], 2, 1, 2).unwrap_err();
        assert!(matches!(err, ContinualError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_cpu_elementwise() {
        let cpu = CpuBackend;
        let a = [4.0, 9.0, 1.0];
        let b = [2.0, 3.0, 1.0];
        assert_eq!(cpu.elementwise(&a, &b, ElementwiseOp::Add, 3).unwrap(), vec![6.0, 12.0, 2.0]);
        assert_eq!(cpu.elementwise(&a, &b, ElementwiseOp::Div, 2).unwrap(), vec![2.0, 3.0]);
        assert!(cpu.elementwise(&a, &b, ElementwiseOp::Mul, 4).is_err());
    }

    #[test]
    fn test_cpu_adam_matches_reference() {
        let step = AdamConfig::default().at_step(0.01, 3);
        let mut p1 = vec![0.5, -0.5];
        let mut m1 = vec![0.1, 0.0];
        let mut v1 = vec![0.01, 0.0];
        let mut p2 = p1.clone();
        let mut m2 = m1.clone();
        let mut v2 = v1.clone();
        let g = [0.2, -0.3];

        CpuBackend
            .adam_step(&mut p1, &g, &mut m1, &mut v1, &step)
            .unwrap();
        adam_step(&mut p2, &g, &mut m2, &mut v2, &step).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_select_cpu() {
        assert_eq!(select_backend(BackendKind::Cpu).unwrap().name(), "cpu");
        let auto = select_backend(BackendKind::Auto).unwrap();
        assert!(auto.name().starts_with("c"));
    }

    #[cfg(not(feature = "candle"))]
    #[test]
    fn test_candle_requires_feature() {
        assert!(matches!(
            select_backend(BackendKind::Candle),
            Err(ContinualError::Config(_))
        ));
    }

    #[cfg(feature = "candle")]
    #[test]
    fn test_candle_matches_cpu() {
        let candle = CandleBackend::with_device(candle_core::Device::Cpu);
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [0.5, -1.0, 2.0];
        let c1 = CpuBackend.matmul(&a, &b, 2, 1, 3).unwrap();
        let c2 = candle.matmul(&a, &b, 2, 1, 3).unwrap();
        for (x, y) in c1.iter().zip(&c2) {
            assert!((x - y).abs() < 1e-5);
        }

        let step = AdamConfig::default().at_step(0.01, 2);
        let mut p1 = vec![1.0, 2.0];
        let mut m1 = vec![0.0; 2];
        let mut v1 = vec![0.0; 2];
        let (mut p2, mut m2, mut v2) = (p1.clone(), m1.clone(), v1.clone());
        CpuBackend.adam_step(&mut p1, &[0.3, -0.1], &mut m1, &mut v1, &step).unwrap();
        candle.adam_step(&mut p2, &[0.3, -0.1], &mut m2, &mut v2, &step).unwrap();
        for (x, y) in p1.iter().zip(&p2) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}

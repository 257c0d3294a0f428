//! Dense helpers over row-major `f32` buffers.
//!
//! A weight `W` with `rows` outputs and `cols` inputs is stored as
//! `W[r * cols + c]` and applied as `y = W · x`.

/// `y = W · x`.
#[must_use]
pub fn matvec(w: &[f32], x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(w.len(), rows * cols);
    w.chunks_exact(cols)
        .take(rows)
        .map(|row| dot(row, x))
        .collect()
}

/// `dx = Wᵀ · dy`.
#[must_use]
pub fn matvec_t(w: &[f32], dy: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(w.len(), rows * cols);
    let mut dx = vec![0.0; cols];
    for (row, &g) in w.chunks_exact(cols).zip(dy).take(rows) {
        if g == 0.0 {
            continue;
        }
        for (d, &wv) in dx.iter_mut().zip(row) {
            *d += g * wv;
        }
    }
    dx
}

/// `dW += scale · dy ⊗ x`.
pub fn outer_add(dw: &mut [f32], dy: &[f32], x: &[f32], scale: f32) {
    let cols = x.len();
    for (row, &g) in dw.chunks_exact_mut(cols).zip(dy) {
        let g = g * scale;
        if g == 0.0 {
            continue;
        }
        for (d, &xv) in row.iter_mut().zip(x) {
            *d += g * xv;
        }
    }
}

/// Dot product.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2 norm.
#[must_use]
pub fn l2_norm(a: &[f32]) -> f32 {
    a.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// `a += b`.
pub fn add_assign(a: &mut [f32], b: &[f32]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

/// `a *= s`.
pub fn scale(a: &mut [f32], s: f32) {
    for x in a {
        *x *= s;
    }
}

/// Numerically stable softmax.
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Logistic sigmoid.
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `x · sigmoid(x)`.
#[must_use]
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matvec_and_transpose() {
        // 2x3
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(matvec(&w, &[1.0, 0.0, -1.0], 2, 3), vec![-2.0, -2.0]);
        assert_eq!(matvec_t(&w, &[1.0, 1.0], 2, 3), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_outer_add() {
        let mut dw = vec![0.0; 4];
        outer_add(&mut dw, &[1.0, 2.0], &[3.0, 4.0], 0.5);
        assert_eq!(dw, vec![1.5, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_softmax_is_stable() {
        let p = softmax(&[1000.0, 1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-6);
        let p = softmax(&[0.0, 1.0, 2.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_activations() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(10.0) - 10.0).abs() < 1e-3);
    }
}

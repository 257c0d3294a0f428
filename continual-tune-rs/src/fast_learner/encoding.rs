//! Fixed-width text encoding and vector similarity.

/// Width of a text encoding: one bin per byte value.
pub const ENCODING_DIM: usize = 256;

/// Byte-frequency histogram of `text`.
///
/// Each byte adds `1 / len` to its bin, so a non-empty text encodes to a
/// vector summing to one. Empty text encodes to the zero vector.
///
/// ```rust
/// use continual_tune_rs::fast_learner::encode_text;
///
/// let enc = encode_text("aab");
/// assert!((enc[b'a' as usize] - 2.0 / 3.0).abs() < 1e-6);
/// assert!((enc.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn encode_text(text: &str) -> Vec<f32> {
    let mut encoding = vec![0.0; ENCODING_DIM];
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return encoding;
    }
    let step = 1.0 / bytes.len() as f32;
    for &b in bytes {
        encoding[b as usize] += step;
    }
    encoding
}

/// Cosine similarity in `[-1, 1]`; zero if either vector has zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (&x, &y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

/// Root-mean-square difference over the shorter of the two vectors.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rmse(prediction: &[f32], target: &[f32]) -> f32 {
    let n = prediction.len().min(target.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f32 = prediction
        .iter()
        .zip(target)
        .map(|(p, t)| (p - t) * (p - t))
        .sum();
    (sum / n as f32).sqrt()
}

//! Finite-difference checks of the full-model backward pass.

use continual_tune_rs::config::ModelSettings;
use continual_tune_rs::gradients::{backward, cross_entropy};
use continual_tune_rs::model::{parameter_shapes, InferenceEngine, TinyTransformer};
use continual_tune_rs::WeightStore;

fn dims() -> ModelSettings {
    ModelSettings {
        hidden_size: 8,
        num_heads: 2,
        ffn_size: 12,
        num_layers: 2,
        max_seq_len: 8,
        ..Default::default()
    }
}

const TOKENS: [u32; 5] = [72, 105, 33, 72, 63];

fn targets() -> Vec<(usize, u32)> {
    (0..TOKENS.len() - 1).map(|t| (t, TOKENS[t + 1])).collect()
}

fn loss(model: &TinyTransformer, weights: &WeightStore) -> f32 {
    let cache = model.forward_with_cache(weights, None, &TOKENS).unwrap();
    cross_entropy(&cache.logits, &targets()).unwrap().0
}

/// Indices of the `k` largest-magnitude entries.
fn top_k(values: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[b].abs().total_cmp(&values[a].abs()));
    idx.truncate(k);
    idx
}

#[test]
fn test_model_backward_matches_finite_differences() {
    let model = TinyTransformer::new(dims()).unwrap();
    let weights = model.init_weights(11);

    let cache = model.forward_with_cache(&weights, None, &TOKENS).unwrap();
    let (_, d_logits) = cross_entropy(&cache.logits, &targets()).unwrap();
    let grads = backward(model.dims(), &weights, &cache, &d_logits).unwrap();

    let eps = 1e-2;
    for shape in parameter_shapes(model.dims()) {
        let analytic = grads
            .weights
            .get(&shape.name)
            .unwrap_or_else(|| panic!("no gradient for {}", shape.name));
        assert_eq!(analytic.len(), shape.len(), "{}", shape.name);

        for i in top_k(analytic, 3) {
            let mut plus = weights.clone();
            plus.get_mut(&shape.name).unwrap()[i] += eps;
            let mut minus = weights.clone();
            minus.get_mut(&shape.name).unwrap()[i] -= eps;
            let numeric = (loss(&model, &plus) - loss(&model, &minus)) / (2.0 * eps);

            let tol = 5e-3 + 0.05 * numeric.abs();
            assert!(
                (analytic[i] - numeric).abs() < tol,
                "{}[{i}]: analytic {} vs numeric {numeric}",
                shape.name,
                analytic[i]
            );
        }
    }
}

#[test]
fn test_untouched_rows_have_zero_gradient() {
    let model = TinyTransformer::new(dims()).unwrap();
    let weights = model.init_weights(5);
    let cache = model.forward_with_cache(&weights, None, &TOKENS).unwrap();
    let (_, d_logits) = cross_entropy(&cache.logits, &targets()).unwrap();
    let grads = backward(model.dims(), &weights, &cache, &d_logits).unwrap();

    let d = model.dims().hidden_size;
    let embed = &grads.weights["embed_tokens"];
    let unused = 0usize;
    assert!(embed[unused * d..(unused + 1) * d].iter().all(|&g| g == 0.0));

    let positions = &grads.weights["embed_positions"];
    let past_end = TOKENS.len();
    assert!(positions[past_end * d..].iter().all(|&g| g == 0.0));
}

#[test]
fn test_backward_rejects_mismatched_logits() {
    let model = TinyTransformer::new(dims()).unwrap();
    let weights = model.init_weights(1);
    let cache = model.forward_with_cache(&weights, None, &TOKENS).unwrap();
    let short = vec![vec![0.0; model.dims().vocab_size]; TOKENS.len() - 1];
    assert!(backward(model.dims(), &weights, &cache, &short).is_err());
}

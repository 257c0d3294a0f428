//! Behavioural scenarios across the public API.

use continual_tune_rs::config::{
    FastLearnerSettings, LoraSettings, LrSchedulerKind, TrainingSettings, WeightSettings,
};
use continual_tune_rs::example::{ExampleSource, Priority, TrainingExample};
use continual_tune_rs::fast_learner::{cosine_similarity, encode_text, FastLearner};
use continual_tune_rs::lr_scheduler::LrSchedule;
use continual_tune_rs::optimizer::AdamConfig;
use continual_tune_rs::{ExampleQueue, LoraAdapter, WeightStore, WeightUpdater};

fn example(id: &str, priority: Priority, timestamp: i64) -> TrainingExample {
    TrainingExample::new(format!("in {id}"), format!("out {id}"), priority, ExampleSource::Manual)
        .with_id(id)
        .with_timestamp(timestamp)
}

#[test]
fn test_queue_orders_by_priority_then_recency() {
    let mut queue = ExampleQueue::with_capacity(10);
    queue.add(example("low", Priority::Low, 1));
    queue.add(example("high", Priority::High, 2));
    queue.add(example("medium", Priority::Medium, 3));

    let ids: Vec<String> = queue.get_batch(3).into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["high", "medium", "low"]);
}

#[test]
fn test_queue_ordering_holds_for_mixed_inserts() {
    let mut queue = ExampleQueue::with_capacity(100);
    let priorities = [Priority::Low, Priority::Medium, Priority::High];
    for i in 0..30i64 {
        let p = priorities[usize::try_from((i * 7) % 3).unwrap()];
        queue.add(example(&format!("e{i}"), p, (i * 13) % 17));
    }
    let batch = queue.get_batch(30);
    for pair in batch.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            (a.priority, a.timestamp) >= (b.priority, b.timestamp),
            "{} before {}",
            a.id,
            b.id
        );
    }

    let before = queue.get_batch(30);
    assert!(!queue.add(example("e3", Priority::High, 99)));
    assert_eq!(queue.get_batch(30), before);
}

#[test]
fn test_capacity_evicts_lowest_and_allows_reinsert() {
    let mut queue = ExampleQueue::with_capacity(2);
    queue.add(example("a", Priority::Medium, 5));
    queue.add(example("b", Priority::Low, 1));
    queue.add(example("c", Priority::High, 2));
    assert_eq!(queue.len(), 2);
    let ids: Vec<String> = queue.get_batch(2).into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["c", "a"]);

    queue.remove_batch(&["a"]);
    assert!(queue.add(example("b", Priority::Low, 1)));
    assert!(!queue.add(example("a", Priority::Low, 1)));
}

#[test]
fn test_fresh_lora_layer_is_pass_through() {
    let mut lora = LoraAdapter::cpu(&LoraSettings::default(), 7);
    lora.initialize_layer("m", 4, 2);
    let out = lora.forward("m", &[1.0, 1.0, 1.0, 1.0], &[5.0, 5.0]).unwrap();
    assert_eq!(out, vec![5.0, 5.0]);

    let missing = lora.forward("other", &[1.0], &[3.0]).unwrap();
    assert_eq!(missing, vec![3.0]);
}

#[test]
fn test_lora_update_keeps_shapes_and_zeroes_gradients() {
    let mut lora = LoraAdapter::cpu(&LoraSettings::default(), 7);
    lora.initialize_layer("m", 4, 3);
    let (a_len, b_len) = {
        let layer = lora.layer("m").unwrap();
        (layer.a().len(), layer.b().len())
    };

    lora.backward("m", &[0.5, -1.0, 2.0, 0.0], &[1.0, 0.0, -1.0]).unwrap();
    assert!(lora.gradient_norm() > 0.0);
    lora.update_parameters(&AdamConfig::default().at_step(1e-2, 1))
        .unwrap();

    let layer = lora.layer("m").unwrap();
    assert_eq!(layer.a().len(), a_len);
    assert_eq!(layer.b().len(), b_len);
    assert!(layer.b().iter().any(|&b| b != 0.0));
    assert_eq!(lora.gradient_norm(), 0.0);
}

#[test]
fn test_identical_input_is_recalled() {
    let settings = FastLearnerSettings {
        similarity_threshold: 0.85,
        ..Default::default()
    };
    let mut learner = FastLearner::new(&settings);
    let e1 = TrainingExample::new("what is rust", "a language", Priority::High, ExampleSource::Chat);

    let first = learner.learn_fast(&e1, 1_000);
    assert!(first.learned && !first.recall);
    assert_eq!(learner.memories().len(), 1);

    let again = TrainingExample::new("what is rust", "something else", Priority::Low, ExampleSource::Chat);
    let second = learner.learn_fast(&again, 2_000);
    assert!(!second.learned && second.recall);
    assert_eq!(learner.memories().len(), 1);
    assert_eq!(learner.memories()[0].access_count, 2);
}

#[test]
fn test_histogram_encoding_fixture() {
    let enc = encode_text("aab");
    assert_eq!(enc.len(), 256);
    assert!((enc[usize::from(b'a')] - 2.0 / 3.0).abs() < 1e-6);
    assert!((enc[usize::from(b'b')] - 1.0 / 3.0).abs() < 1e-6);
    assert!((enc.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    assert!(encode_text("").iter().all(|&v| v == 0.0));
}

#[test]
fn test_cosine_similarity_bounds() {
    let vectors = [
        vec![1.0, 0.0, 0.0],
        vec![-1.0, 0.0, 0.0],
        vec![0.3, -2.0, 5.0],
        vec![1e-3, 1e-3, -1e-3],
    ];
    for a in &vectors {
        for b in &vectors {
            let s = cosine_similarity(a, b);
            assert!((-1.0..=1.0).contains(&s), "{s}");
        }
        assert_eq!(cosine_similarity(a, &[0.0, 0.0, 0.0]), 0.0);
    }
    assert!((cosine_similarity(&vectors[0], &vectors[1]) + 1.0).abs() < 1e-6);
}

#[test]
fn test_snapshot_update_rollback() {
    let mut store = WeightStore::new();
    store.set("w", vec![1.0, 2.0, 3.0]);
    let mut updater = WeightUpdater::new(store, &WeightSettings::default());

    updater.create_snapshot(None);
    updater.apply_update("w", &[1.0, 1.0, 1.0], 1.0).unwrap();
    assert_eq!(updater.get("w").unwrap(), &[2.0, 3.0, 4.0]);
    assert!(updater.rollback(None));
    assert_eq!(updater.get("w").unwrap(), &[1.0, 2.0, 3.0]);
}

#[test]
fn test_learning_rate_schedule_endpoints() {
    let settings = TrainingSettings {
        learning_rate: 2e-3,
        warmup_steps: 10,
        max_steps: 110,
        lr_scheduler: LrSchedulerKind::Cosine,
        ..Default::default()
    };
    let schedule = LrSchedule::from_settings(&settings);
    assert_eq!(schedule.lr_at(0), 0.0);
    assert!((schedule.lr_at(10) - 2e-3).abs() < 1e-9);
    assert!(schedule.lr_at(110) < 1e-9);
    assert!(schedule.lr_at(60) < schedule.lr_at(20));
}

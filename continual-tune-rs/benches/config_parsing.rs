use continual_tune_rs::config::ContinualConfig;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Write;
use tempfile::NamedTempFile;

// Small YAML config for basic benchmarking
const SMALL_YAML: &str = r#"
mode: hybrid
backend: cpu

model:
  hidden_size: 64
  num_heads: 4
  ffn_size: 128
  num_layers: 2
  max_seq_len: 128

lora:
  r: 8
  alpha: 16
  target_modules:
    - q_proj
    - k_proj
    - v_proj
    - o_proj

fast_learner:
  similarity_threshold: 0.85
  memory_capacity: 1000

training:
  learning_rate: 1.0e-4
  warmup_steps: 100
  max_steps: 10000
  lr_scheduler: cosine

batch:
  active_batch_size: 2
  idle_batch_size: 8

scheduler:
  check_interval_ms: 1000
  max_cpu_usage: 0.5
  snapshot_interval: 10

output_dir: ./outputs/continual
seed: 42
"#;

// Invalid settings for error path benchmarking
const INVALID_YAML: &str = r#"
mode: lora
lora: null
model:
  hidden_size: 10
  num_heads: 3
"#;

fn bench_config_from_yaml(c: &mut Criterion) {
    c.bench_function("config_from_yaml_small", |b| {
        b.iter(|| {
            let config: ContinualConfig = black_box(serde_yaml::from_str(SMALL_YAML).unwrap());
            black_box(config);
        });
    });
}

fn bench_config_validate(c: &mut Criterion) {
    c.bench_function("config_validate", |b| {
        let config: ContinualConfig = serde_yaml::from_str(SMALL_YAML).unwrap();
        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result).unwrap();
        });
    });
}

fn bench_config_validate_invalid(c: &mut Criterion) {
    c.bench_function("config_validate_invalid", |b| {
        let config: ContinualConfig = serde_yaml::from_str(INVALID_YAML).unwrap();
        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result.is_err());
        });
    });
}

fn bench_presets(c: &mut Criterion) {
    let mut group = c.benchmark_group("preset");
    for preset in ["tiny", "small"] {
        group.bench_function(preset, |b| {
            b.iter(|| {
                let config = black_box(ContinualConfig::from_preset(preset).unwrap());
                black_box(config);
            });
        });
    }
    group.finish();
}

fn bench_config_roundtrip(c: &mut Criterion) {
    c.bench_function("config_yaml_roundtrip", |b| {
        let config = ContinualConfig::default();
        b.iter(|| {
            let yaml = serde_yaml::to_string(&config).unwrap();
            let restored: ContinualConfig = black_box(serde_yaml::from_str(&yaml).unwrap());
            black_box(restored);
        });
    });
}

fn bench_config_from_file(c: &mut Criterion) {
    c.bench_function("config_from_file", |b| {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SMALL_YAML.as_bytes()).unwrap();
        let path = file.path().to_path_buf();

        b.iter(|| {
            let loaded = black_box(ContinualConfig::from_file(&path).unwrap());
            black_box(loaded);
        });
    });
}

criterion_group!(
    benches,
    bench_config_from_yaml,
    bench_config_validate,
    bench_config_validate_invalid,
    bench_presets,
    bench_config_roundtrip,
    bench_config_from_file,
);
criterion_main!(benches);

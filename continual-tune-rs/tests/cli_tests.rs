//! Integration tests for the continual-tune CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper function to run the CLI with given arguments.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd =
        Command::cargo_bin("continual-tune").expect("Failed to find continual-tune binary");
    cmd.args(args);
    cmd
}

/// Write a tiny-preset config into `dir` via `init`.
fn init_tiny_config(dir: &Path) -> PathBuf {
    let config_path = dir.join("config.yaml");
    run_cli(&["init", config_path.to_str().unwrap(), "--preset", "tiny"])
        .assert()
        .success();
    config_path
}

fn write_dataset(dir: &Path) -> PathBuf {
    let data = dir.join("chats.jsonl");
    fs::write(
        &data,
        r#"{"input": "hello there", "output": "hi!", "priority": "high"}
{"input": "what is 2+2", "output": "four"}
this line is broken
{"conversations": [{"from": "human", "value": "name?"}, {"from": "gpt", "value": "tiny"}]}
"#,
    )
    .expect("Failed to write dataset");
    data
}

#[test]
fn test_init_writes_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = init_tiny_config(temp_dir.path());
    assert!(config_path.exists());

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Hybrid"));
}

#[test]
fn test_init_unknown_preset_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let out = temp_dir.path().join("config.yaml");
    run_cli(&["init", out.to_str().unwrap(), "--preset", "gpt-17"])
        .assert()
        .failure();
}

#[test]
fn test_validate_rejects_invalid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, "mode: lora\nlora: null\n").unwrap();

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lora"));
}

#[test]
fn test_validate_missing_file_fails() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_train_then_inspect() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = init_tiny_config(temp_dir.path());
    let data = write_dataset(temp_dir.path());
    let state = temp_dir.path().join("out").join("state.json");

    run_cli(&[
        "train",
        config_path.to_str().unwrap(),
        "--data",
        data.to_str().unwrap(),
        "--state",
        state.to_str().unwrap(),
        "--no-progress",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Imported 3 examples (3 items ok, 1 failed)"))
    .stdout(predicate::str::contains("State saved to"))
    .stderr(predicate::str::contains("chats.jsonl:3"));
    assert!(state.exists());

    run_cli(&["inspect", state.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Engine state v1"))
        .stdout(predicate::str::contains("LoRA:"))
        .stdout(predicate::str::contains("Fast learner: 3 memories"));

    run_cli(&[
        "train",
        config_path.to_str().unwrap(),
        "--data",
        data.to_str().unwrap(),
        "--state",
        state.to_str().unwrap(),
        "--resume",
        state.to_str().unwrap(),
        "--no-progress",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Resumed from"));
}

#[test]
fn test_train_without_examples_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = init_tiny_config(temp_dir.path());
    let empty = temp_dir.path().join("empty.jsonl");
    fs::write(&empty, "\n").unwrap();

    run_cli(&[
        "train",
        config_path.to_str().unwrap(),
        "--data",
        empty.to_str().unwrap(),
        "--no-progress",
    ])
    .assert()
    .failure();
}

#[test]
fn test_inspect_missing_state_fails() {
    run_cli(&["inspect", "/nonexistent/state.json"])
        .assert()
        .failure();
}

#[test]
fn test_help_lists_commands() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("inspect"));
}

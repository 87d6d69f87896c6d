//! Integration tests for the bert-fusion CLI

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn bert_fusion(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("bert-fusion").unwrap();
    cmd.current_dir(dir);
    cmd
}

/// Generate a tiny two-layer encoder into `dir`
fn generate(dir: &Path, extra: &[&str]) -> PathBuf {
    let path = dir.join("model.onnx");
    bert_fusion(dir)
        .args(["generate", "-o"])
        .arg(&path)
        .args(extra)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    path
}

/// Test basic help command
#[test]
fn test_help_command() {
    let mut cmd = Command::cargo_bin("bert-fusion").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Operator-fusion optimizer"))
        .stdout(predicate::str::contains("optimize"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("generate"));
}

/// Test version command
#[test]
fn test_version_command() {
    let mut cmd = Command::cargo_bin("bert-fusion").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("bert-fusion"));
}

/// Test optimize with missing input file
#[test]
fn test_optimize_missing_file() {
    let dir = TempDir::new().unwrap();
    bert_fusion(dir.path())
        .args(["optimize", "-i", "nonexistent.onnx", "-o", "out.onnx"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to load model"));
    assert!(!dir.path().join("out.onnx").exists());
}

/// Test optimize rejects an empty model (no opset import)
#[test]
fn test_optimize_empty_input() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("empty.onnx"), b"").unwrap();

    bert_fusion(dir.path())
        .args(["optimize", "-i", "empty.onnx", "-o", "out.onnx"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
    assert!(!dir.path().join("out.onnx").exists());
}

#[test]
fn test_optimize_generated_model() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &[]);
    let output = dir.path().join("model.opt.onnx");

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("fully optimized (2 layers)"))
        .stdout(predicate::str::contains("Output:"));
    assert!(output.exists());

    bert_fusion(dir.path())
        .args(["inspect", "-i"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Attention: 2"))
        .stdout(predicate::str::contains("EmbedLayerNormalization: 1"));
}

#[test]
fn test_report_json() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &["--layers", "3"]);
    let report_path = dir.path().join("report.json");

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx", "--report-json"])
        .arg(&report_path)
        .assert()
        .success();

    let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["fully_optimized"], true);
    assert_eq!(report["counts"]["attention"], 3);
    assert_eq!(report["counts"]["gelu"], 3);
    assert_eq!(report["counts"]["embed_layer_norm"], 1);
}

#[test]
fn test_strict_exit_code_on_deficit() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &[]);

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx", "--disable", "gelu", "--strict"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Gelu: expected 2, found 0"))
        .stderr(predicate::str::contains("not fully optimized"));

    // Advisory without --strict
    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx", "--disable", "gelu"])
        .assert()
        .success()
        .stdout(predicate::str::contains("partially optimized"));
}

#[test]
fn test_unknown_fusion_name_rejected() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &[]);

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx", "--disable", "softmax"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("softmax"));
}

#[test]
fn test_config_file_in_current_dir() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &[]);
    fs::write(dir.path().join("bert-fusion.toml"), "disable = [\"attention\"]\n").unwrap();

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Attention: expected 2, found 0"));

    // CLI list replaces the configured one
    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx", "--disable", "reshape"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fully optimized"));
}

#[test]
fn test_explicit_config_missing() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &[]);

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx", "-c", "missing.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_verify_against_original() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &["--gelu", "tanh", "--seed", "9"]);

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args([
            "-o",
            "out.onnx",
            "--verify",
            "--verify-shape",
            "input_ids:2,4",
            "--verify-shape",
            "attention_mask:2,4",
            "--verify-shape",
            "token_type_ids:2,4",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Verification:"));
}

#[test]
fn test_session_sidecar() {
    let dir = TempDir::new().unwrap();
    let input = generate(dir.path(), &[]);
    let sidecar = dir.path().join("session.json");

    bert_fusion(dir.path())
        .args(["optimize", "-i"])
        .arg(&input)
        .args(["-o", "out.onnx", "--threads", "4", "--wait-policy", "spin", "--session-config"])
        .arg(&sidecar)
        .assert()
        .success();

    let entries: serde_json::Value = serde_json::from_str(&fs::read_to_string(&sidecar).unwrap()).unwrap();
    assert_eq!(entries["session.intra_op_num_threads"], "4");
    assert_eq!(entries["session.intra_op.allow_spinning"], "1");
}

#[test]
fn test_generate_rejects_indivisible_heads() {
    let dir = TempDir::new().unwrap();
    bert_fusion(dir.path())
        .args(["generate", "-o", "bad.onnx", "--heads", "3", "--hidden", "8"])
        .assert()
        .failure();
    assert!(!dir.path().join("bad.onnx").exists());
}

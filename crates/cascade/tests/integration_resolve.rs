//! Integration tests for the resolve command

use assert_cmd::cargo;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Project with a root fragment, a group script and an experiment fragment
fn setup_project(temp_dir: &TempDir) -> PathBuf {
    let root = temp_dir.path().join("proj");
    let exp = root.join("vision/resnet");
    fs::create_dir_all(&exp).unwrap();
    fs::write(root.join("_ROOT"), "").unwrap();
    fs::write(
        root.join("cfg.yml"),
        "train:\n  lr: 0.1\n  epochs: 10\ndata: '@ROOT/data'\n",
    )
    .unwrap();
    fs::write(root.join("vision/cfg.script"), "base_width = 16\n").unwrap();
    fs::write(
        exp.join("cfg.yml"),
        "train:\n  epochs: 'PY@base_width * 2'\nname: 'PY@exp_path.name'\n",
    )
    .unwrap();
    exp
}

fn cascade(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo::cargo_bin_cmd!("cascade");
    cmd.current_dir(dir).env_remove("CASCADE_LOG");
    cmd
}

#[test]
fn test_resolve_prints_yaml() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);

    cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("lr: 0.1"))
        .stdout(predicate::str::contains("epochs: 32"))
        .stdout(predicate::str::contains("name: resnet"));
}

#[test]
fn test_resolve_json_substitutes_root_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);

    let output = cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap(), "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["train"]["epochs"], 32);
    assert_eq!(value["train"]["lr"], 0.1);
    let data = value["data"].as_str().unwrap();
    assert!(data.ends_with("proj/data"), "unexpected data path {data}");
    assert!(!data.contains("@ROOT"));
}

#[test]
fn test_resolve_single_key() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);

    cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap(), "--get", "train.epochs"])
        .assert()
        .success()
        .stdout("32\n");
}

#[test]
fn test_resolve_allow_list_leaves_other_placeholders() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);

    let output = cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap(), "--json", "--key", "name"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["name"], "resnet");
    assert_eq!(value["train"]["epochs"], "PY@base_width * 2");
}

#[test]
fn test_resolve_explain_shows_sources() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);

    cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap(), "--explain"])
        .assert()
        .success()
        .stdout(predicate::str::contains("key"))
        .stdout(predicate::str::contains("source"))
        .stdout(predicate::str::contains("train.lr"))
        .stdout(predicate::str::contains("train.epochs"));
}

#[test]
fn test_resolve_evaluation_error_shows_unit() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);
    fs::write(exp.join("cfg.yml"), "broken: 'PY@undefined_name + 1'\n").unwrap();

    cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("undefined_name"))
        .stderr(predicate::str::contains("evaluation unit"));
}

#[test]
fn test_resolve_duplicate_key_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);
    fs::write(exp.join("cfg.yml"), "a: 1\na: 2\n").unwrap();

    cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Duplicate key"));
}

#[test]
fn test_resolve_script_print_goes_to_log() {
    let temp_dir = TempDir::new().unwrap();
    let exp = setup_project(&temp_dir);
    fs::write(
        temp_dir.path().join("proj/vision/cfg.script"),
        "base_width = 16\nprint('hello from script')\n",
    )
    .unwrap();

    cascade(temp_dir.path())
        .args(["resolve", exp.to_str().unwrap(), "--log", "info"])
        .assert()
        .success()
        .stderr(predicate::str::contains("hello from script"))
        .stdout(predicate::str::contains("hello from script").not());
}

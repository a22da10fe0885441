//! Integration tests for the Repolens CLI
//!
//! These tests run the binary against real temporary repositories.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

/// Helper to create a small Python repository
fn create_test_repo() -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    let base = temp_dir.path();

    fs::write(
        base.join("main.py"),
        r#""""Entry point."""

import utils


def main():
    utils.helper()
"#,
    )
    .unwrap();

    fs::write(
        base.join("utils.py"),
        r#"def helper():
    """Do the helpful thing."""
    return 42
"#,
    )
    .unwrap();

    fs::create_dir_all(base.join("tests")).unwrap();
    fs::write(
        base.join("tests/test_utils.py"),
        "def test_helper():\n    assert True\n",
    )
    .unwrap();

    temp_dir
}

fn repolens() -> Command {
    Command::cargo_bin("repolens").unwrap()
}

#[test]
fn test_scan_reports_totals() {
    let repo = create_test_repo();

    repolens()
        .arg("scan")
        .arg(repo.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Files:   3"))
        .stdout(predicate::str::contains("main.py"));
}

#[test]
fn test_scan_json_is_parseable() {
    let repo = create_test_repo();

    let output = repolens()
        .arg("scan")
        .arg(repo.path())
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());

    let map: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(map["total_files"], 3);
    assert!(map["modules"].get("main.py").is_some());
}

#[test]
fn test_map_prints_compressed_structure() {
    let repo = create_test_repo();

    repolens()
        .arg("map")
        .arg(repo.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("PROJECT:"))
        .stdout(predicate::str::contains("STRUCTURE:"))
        .stdout(predicate::str::contains("ENTRY POINTS:"));
}

#[test]
fn test_context_fix_includes_target() {
    let repo = create_test_repo();

    repolens()
        .arg("context")
        .arg(repo.path())
        .args(["--operation", "fix", "--file", "main.py", "--budget", "4000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FILE TO FIX: main.py"))
        .stdout(predicate::str::contains("def main():"))
        .stdout(predicate::str::contains("DEPENDENCIES:"));
}

#[test]
fn test_context_json_metadata() {
    let repo = create_test_repo();

    let output = repolens()
        .arg("context")
        .arg(repo.path())
        .args(["--operation", "explain", "--file", "utils.py", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["files_included"][0], "utils.py");
    assert_eq!(result["truncated"], false);
}

#[test]
fn test_stats_shows_symbols() {
    let repo = create_test_repo();

    repolens()
        .arg("stats")
        .arg(repo.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Symbols"))
        .stdout(predicate::str::contains("Definitions:"));
}

#[test]
fn test_missing_root_fails() {
    repolens()
        .arg("scan")
        .arg("/definitely/not/a/real/repository")
        .assert()
        .failure();
}

#[test]
fn test_scan_twice_uses_cache() {
    let repo = create_test_repo();

    repolens().arg("scan").arg(repo.path()).assert().success();
    assert!(repo.path().join(".vibe_cache/repo_map.json").exists());

    repolens()
        .arg("scan")
        .arg(repo.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Files:   3"));
}

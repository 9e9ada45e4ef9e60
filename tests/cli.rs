//! Smoke tests for the foreman binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn foreman(workspace: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("foreman").unwrap();
    cmd.env("AGENT_WORKSPACE_DIR", workspace.path());
    cmd
}

#[test]
fn test_help() {
    let dir = TempDir::new().unwrap();
    foreman(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestrator"));
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    foreman(&dir).arg("--version").assert().success();
}

#[test]
fn test_state_of_unknown_task_is_empty_snapshot() {
    let dir = TempDir::new().unwrap();
    foreman(&dir)
        .args(["state", "--task-id", "T-missing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"epics\""));
}

#[test]
fn test_validate_unknown_task_is_ok() {
    let dir = TempDir::new().unwrap();
    foreman(&dir)
        .args(["validate", "--task-id", "T-missing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("state OK"));
}

#[test]
fn test_run_with_missing_task_file_fails() {
    let dir = TempDir::new().unwrap();
    foreman(&dir)
        .args(["run", "--task-file", "does-not-exist.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read task file"));
}

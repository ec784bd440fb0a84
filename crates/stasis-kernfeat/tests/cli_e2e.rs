//! CLI behavior: probe output, cache subcommands, exit codes.

#![cfg(target_os = "linux")]

use assert_cmd::Command;
use predicates::prelude::*;

fn kernfeat() -> Command {
    Command::cargo_bin("stasis-kernfeat").unwrap()
}

#[test]
fn probe_json_emits_the_full_registry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("kernfeat.bin");

    let output = kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["probe", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert!(parsed.get("shmem_dev").is_some());
    assert!(parsed.get("pagemap").is_some());
    assert!(parsed.get("vdso").is_some());
    assert!(parsed.get("probed_at").is_some());
    // A probe run persists the snapshot.
    assert!(cache.exists());
}

#[test]
fn probe_human_output_mentions_key_features() {
    let dir = tempfile::tempdir().unwrap();
    kernfeat()
        .args(["--cache-path"])
        .arg(dir.path().join("kernfeat.bin"))
        .args(["probe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pagemap:"))
        .stdout(predicate::str::contains("userfaultfd:"))
        .stdout(predicate::str::contains("vdso:"));
}

#[test]
fn probe_no_cache_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("kernfeat.bin");
    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["probe", "--no-cache", "--json"])
        .assert()
        .success();
    assert!(!cache.exists());
}

#[test]
fn cache_status_reports_missing_valid_and_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("kernfeat.bin");

    // Missing: operational "no cache" outcome.
    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["cache", "status"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("no snapshot"));

    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["probe", "--json"])
        .assert()
        .success();

    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["cache", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid snapshot"));

    std::fs::write(&cache, b"definitely not a snapshot").unwrap();
    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["cache", "status"])
        .assert()
        .code(1)
        .stdout(
            predicate::str::contains("stale snapshot")
                .or(predicate::str::contains("corrupt snapshot")),
        );
}

#[test]
fn bad_arguments_exit_with_args_error() {
    kernfeat()
        .args(["probe", "--definitely-not-a-flag"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("--definitely-not-a-flag"));

    // No subcommand at all is also an argument error.
    kernfeat().assert().code(10);
}

#[test]
fn help_and_version_exit_successfully() {
    kernfeat()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("probe"));
    kernfeat().arg("--version").assert().success();
}

#[test]
fn cache_clear_removes_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("kernfeat.bin");

    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["probe", "--json"])
        .assert()
        .success();
    assert!(cache.exists());

    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["cache", "clear"])
        .assert()
        .success();
    assert!(!cache.exists());

    kernfeat()
        .args(["--cache-path"])
        .arg(&cache)
        .args(["cache", "clear"])
        .assert()
        .code(1);
}

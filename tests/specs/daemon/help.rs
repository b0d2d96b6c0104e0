//! Daemon help and version specs
//!
//! Verify otd --help, --version, and related flags work without
//! acquiring the daemon lock (no startup attempt).

use crate::prelude::*;
use assert_cmd::Command;

fn otd_cmd() -> Command {
    Command::new(otd_binary())
}

fn stdout_of(args: &[&str]) -> String {
    let assert = otd_cmd().args(args).assert().success();
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

#[test]
fn otd_version_shows_version_and_hash() {
    for flag in ["--version", "-v", "-V"] {
        let stdout = stdout_of(&[flag]);
        assert!(
            stdout.starts_with("otd 0.1.0+"),
            "expected version with commit hash for {flag}, got: {stdout}"
        );
    }
}

#[test]
fn otd_help_shows_usage() {
    let stdout = stdout_of(&["--help"]);
    assert!(stdout.contains("USAGE:"));
    assert!(stdout.contains("OT_STATE_DIR"));
    assert!(stdout.contains("--version"));
    assert_eq!(stdout, stdout_of(&["-h"]));
}

#[test]
fn otd_help_does_not_touch_state() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ot");
    otd_cmd()
        .env("OT_STATE_DIR", &state)
        .arg("--help")
        .assert()
        .success();
    assert!(!state.exists());
}

#[test]
fn otd_rejects_unknown_arguments() {
    let assert = otd_cmd().arg("--frobnicate").assert().failure().code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("unexpected argument '--frobnicate'"));
    assert!(stderr.contains("Usage: otd"));
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ot_core::{ConfigVersionId, RunId};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Engine = `sh`, so `sh plan ...` runs the script named `plan` in the run's
/// workdir. Scripts are read, not executed, which avoids ETXTBSY races.
fn engine_with_script(phase: &str, script: &str) -> (ProcessEngine, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let workdir = root.path().join("run-1");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join(phase), script).unwrap();
    (ProcessEngine::new("sh", root.path()), root)
}

fn request(phase: Phase) -> PhaseRequest {
    PhaseRequest {
        run_id: RunId::new("run-1"),
        phase,
        config_version_id: ConfigVersionId::new("cv-1"),
        is_destroy: false,
        refresh: true,
        target_addrs: vec![],
        replace_addrs: vec![],
        config: None,
    }
}

async fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> String {
    let mut out = Vec::new();
    while let Some(bytes) = rx.recv().await {
        out.extend(bytes);
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn assert_workdir_exists(root: &Path) {
    assert!(root.join("run-1").is_dir());
}

#[tokio::test]
async fn plan_streams_output_and_parses_report() {
    let (engine, root) = engine_with_script(
        "plan",
        "echo \"args: $*\"\necho 'Plan: 2 to add, 0 to change, 1 to destroy.'\n",
    );
    let (tx, rx) = mpsc::channel(16);
    let (_sig_tx, sig_rx) = watch::channel(None);

    let report = engine.execute(request(Phase::Plan), tx, sig_rx).await.unwrap();
    assert_eq!(report, Report::new(2, 0, 1));

    let out = collect(rx).await;
    assert!(out.contains("args: -input=false -no-color"), "got: {out}");
    assert_workdir_exists(root.path());
}

#[tokio::test]
async fn nonzero_exit_reports_stderr_tail() {
    let (engine, _root) = engine_with_script("apply", "echo 'Error: boom' >&2\nexit 3\n");
    let (tx, _rx) = mpsc::channel(16);
    let (_sig_tx, sig_rx) = watch::channel(None);

    let err = engine.execute(request(Phase::Apply), tx, sig_rx).await.unwrap_err();
    assert_eq!(
        err,
        EngineAdapterError::Failed {
            code: Some(3),
            stderr_tail: "Error: boom".to_string()
        }
    );
}

#[tokio::test]
async fn missing_summary_is_an_output_error() {
    let (engine, _root) = engine_with_script("plan", "echo hello\n");
    let (tx, _rx) = mpsc::channel(16);
    let (_sig_tx, sig_rx) = watch::channel(None);

    let err = engine.execute(request(Phase::Plan), tx, sig_rx).await.unwrap_err();
    assert!(matches!(err, EngineAdapterError::Output(_)));
}

#[tokio::test]
async fn soft_cancel_interrupts_engine() {
    let (engine, _root) = engine_with_script(
        "plan",
        "trap 'echo interrupted; exit 130' INT\necho started\nwhile true; do sleep 0.05; done\n",
    );
    let (tx, mut rx) = mpsc::channel(16);
    let (sig_tx, sig_rx) = watch::channel(None);

    let task = tokio::spawn(async move { engine.execute(request(Phase::Plan), tx, sig_rx).await });
    // Wait until the trap is installed
    let first = rx.recv().await.unwrap();
    assert!(String::from_utf8_lossy(&first).contains("started"));

    sig_tx.send(Some(Signal::Cancel)).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(result, Err(EngineAdapterError::Interrupted(Signal::Cancel)));
}

#[tokio::test]
async fn force_cancel_kills_engine_ignoring_interrupt() {
    let (engine, _root) = engine_with_script(
        "apply",
        "trap '' INT\necho started\nwhile true; do sleep 0.05; done\n",
    );
    let (tx, mut rx) = mpsc::channel(16);
    let (sig_tx, sig_rx) = watch::channel(None);

    let task = tokio::spawn(async move { engine.execute(request(Phase::Apply), tx, sig_rx).await });
    rx.recv().await.unwrap();

    sig_tx.send(Some(Signal::Cancel)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task.is_finished());

    sig_tx.send(Some(Signal::ForceCancel)).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(result, Err(EngineAdapterError::Interrupted(Signal::ForceCancel)));
}

#[tokio::test]
async fn missing_binary_is_spawn_error() {
    let root = tempfile::tempdir().unwrap();
    let engine = ProcessEngine::new("/nonexistent/engine", root.path());
    let (tx, _rx) = mpsc::channel(16);
    let (_sig_tx, sig_rx) = watch::channel(None);

    let err = engine.execute(request(Phase::Plan), tx, sig_rx).await.unwrap_err();
    assert!(matches!(err, EngineAdapterError::Spawn(_)));
}

/// Tarball holding `main.tf` with `contents`, built with the system `tar`
fn tarball(contents: &str) -> Vec<u8> {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("main.tf"), contents).unwrap();
    let out = src.path().join("config.tar");
    let status = std::process::Command::new("tar")
        .args(["-cf", "config.tar", "main.tf"])
        .current_dir(src.path())
        .status()
        .unwrap();
    assert!(status.success());
    std::fs::read(out).unwrap()
}

#[tokio::test]
async fn configuration_is_unpacked_before_the_engine_starts() {
    let (engine, root) = engine_with_script(
        "plan",
        "cat main.tf\necho 'Plan: 1 to add, 0 to change, 0 to destroy.'\n",
    );
    let (tx, rx) = mpsc::channel(16);
    let (_sig_tx, sig_rx) = watch::channel(None);
    let request = request(Phase::Plan).with_config(Some(tarball("resource \"null\" \"a\" {}\n")));

    let report = engine.execute(request, tx, sig_rx).await.unwrap();
    assert_eq!(report, Report::new(1, 0, 0));

    let out = collect(rx).await;
    assert!(out.contains("resource \"null\" \"a\""), "got: {out}");
    assert!(!root.path().join("run-1").join(CONFIG_TARBALL).exists());
}

#[tokio::test]
async fn unreadable_configuration_fails_without_running_the_engine() {
    let (engine, root) = engine_with_script("plan", "touch ran\necho 'No changes.'\n");
    let (tx, _rx) = mpsc::channel(16);
    let (_sig_tx, sig_rx) = watch::channel(None);
    let request = request(Phase::Plan).with_config(Some(b"not a tarball".to_vec()));

    let err = engine.execute(request, tx, sig_rx).await.unwrap_err();
    assert!(matches!(err, EngineAdapterError::Config(_)), "got: {err:?}");
    assert!(!root.path().join("run-1").join("ran").exists());
}

#[tokio::test]
async fn pump_forwards_everything_but_keeps_only_the_tail() {
    let output: Vec<u8> = (0..64 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
    let (tx, rx) = mpsc::channel(4);
    let keep = Tail {
        bytes: Vec::new(),
        limit: 100,
    };
    let forwarded = tokio::spawn(collect(rx));

    let tail = pump(std::io::Cursor::new(output.clone()), tx, keep)
        .await
        .unwrap();
    assert_eq!(tail.bytes, &output[output.len() - 100..]);
    assert_eq!(forwarded.await.unwrap().len(), output.len());
}

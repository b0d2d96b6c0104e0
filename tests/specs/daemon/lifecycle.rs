//! Daemon lifecycle specs
//!
//! Start otd against a temporary state directory, stop it with SIGTERM,
//! and check what it leaves behind.

use crate::prelude::*;
use std::path::Path;
use std::process::{Child, Stdio};

fn start(state: &Path) -> Child {
    let child = otd(state)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let log = state.join("otd.log");
    wait_for("daemon ready", || {
        std::fs::read_to_string(&log).is_ok_and(|text| text.contains("daemon ready"))
    });
    child
}

fn terminate(mut child: Child) {
    let status = std::process::Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    let exit = child.wait().unwrap();
    assert!(exit.success(), "otd exited with {exit}");
}

#[test]
fn start_writes_pid_and_stop_saves_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ot");
    let child = start(&state);

    let pid = std::fs::read_to_string(state.join("otd.pid")).unwrap();
    assert_eq!(pid.trim(), child.id().to_string());
    assert!(state.join("wal").is_dir());

    terminate(child);

    assert!(!state.join("otd.pid").exists());
    assert!(state.join("snapshot.json.zst").exists());
    let log = std::fs::read_to_string(state.join("otd.log")).unwrap();
    assert!(log.contains("--- otd: starting (pid: "));
    assert!(log.contains("daemon stopped"));
}

#[test]
fn second_daemon_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ot");
    let first = start(&state);

    let output = otd(&state).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("otd is already running"));
    assert!(stderr.contains(&format!("pid: {}", first.id())));

    terminate(first);
}

#[test]
fn restart_recovers_from_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ot");
    terminate(start(&state));
    let restarted = start(&state);

    let log = std::fs::read_to_string(state.join("otd.log")).unwrap();
    let recovered = log
        .lines()
        .filter(|line| line.contains("recovered store"))
        .last()
        .unwrap()
        .to_string();
    assert!(recovered.contains("snapshot_seq=Some("), "{recovered}");

    terminate(restarted);
}

#[test]
fn malformed_config_exits_before_locking() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ot");
    std::fs::create_dir_all(&state).unwrap();
    std::fs::write(state.join("otd.toml"), "[runner]\nmax_jobs = \"many\"\n").unwrap();

    let output = otd(&state).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("otd.toml"));
    assert!(!state.join("otd.pid").exists());
}

#[test]
fn socket_accepts_connections_until_stop() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ot");
    let child = start(&state);

    let socket = state.join("otd.sock");
    std::os::unix::net::UnixStream::connect(&socket).unwrap();

    terminate(child);
    assert!(!socket.exists());
}

#[test]
fn configured_replicas_start_in_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("ot");
    std::fs::create_dir_all(&state).unwrap();
    std::fs::write(
        state.join("otd.toml"),
        "[scheduler]\nreplica = \"otd\"\nreplicas = 2\n",
    )
    .unwrap();
    let child = start(&state);

    let log = std::fs::read_to_string(state.join("otd.log")).unwrap();
    let started: Vec<&str> = log
        .lines()
        .filter(|line| line.contains("replica started"))
        .collect();
    assert_eq!(started.len(), 2, "{log}");
    assert!(started.iter().any(|line| line.contains("replica=otd-1")));
    assert!(started.iter().any(|line| line.contains("replica=otd-2")));

    terminate(child);
}

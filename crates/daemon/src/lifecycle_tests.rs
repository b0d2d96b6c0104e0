// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ot_core::ReplicaId;
use tempfile::tempdir;

fn take_lease(store: &Store, name: &str) {
    let held = store
        .try_acquire_lease(name, &ReplicaId::new("otd"), 60_000, 1_000)
        .unwrap();
    assert!(held);
}

#[test]
fn paths_live_under_the_state_dir() {
    let paths = Paths::under(PathBuf::from("/state"));
    assert_eq!(paths.lock_path, PathBuf::from("/state/otd.pid"));
    assert_eq!(paths.wal_path, PathBuf::from("/state/wal/store.wal"));
    assert_eq!(paths.snapshot_path, PathBuf::from("/state/snapshot.json.zst"));
    assert_eq!(paths.config_path, PathBuf::from("/state/otd.toml"));
    assert_eq!(paths.socket_path, PathBuf::from("/state/otd.sock"));
    assert_eq!(paths.artifacts_path, PathBuf::from("/state/artifacts"));
}

#[test]
fn startup_creates_layout_and_writes_pid() {
    let dir = tempdir().unwrap();
    let paths = Paths::under(dir.path().join("ot"));

    let daemon = startup(&paths).unwrap();

    let pid = std::fs::read_to_string(&paths.lock_path).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());
    assert_eq!(
        std::fs::read_to_string(&paths.version_path).unwrap(),
        crate::VERSION
    );
    assert!(paths.workdir_path.is_dir());
    assert!(paths.artifacts_path.is_dir());
    assert_eq!(daemon.recovery, Recovery::default());
    assert!(daemon.store.is_durable());
}

#[test]
fn second_startup_fails_without_touching_the_first() {
    let dir = tempdir().unwrap();
    let paths = Paths::under(dir.path().to_path_buf());
    let _first = startup(&paths).unwrap();

    let err = startup(&paths).err().unwrap();
    assert!(matches!(err, LifecycleError::LockFailed(_)));

    // Files belong to the running daemon and must survive
    let pid = std::fs::read_to_string(&paths.lock_path).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());
    assert!(paths.version_path.exists());
}

#[test]
fn shutdown_snapshots_and_restart_recovers() {
    let dir = tempdir().unwrap();
    let paths = Paths::under(dir.path().to_path_buf());

    let daemon = startup(&paths).unwrap();
    take_lease(&daemon.store, "sweeper:timeout");
    let seq = daemon.store.seq();
    daemon.shutdown().unwrap();

    assert!(paths.snapshot_path.exists());
    assert!(!paths.lock_path.exists());
    assert!(!paths.version_path.exists());

    let daemon = startup(&paths).unwrap();
    assert_eq!(daemon.recovery.snapshot_seq, Some(seq));
    assert_eq!(daemon.recovery.replayed, 0);
    assert!(daemon
        .store
        .read(|s| s.leases.contains_key("sweeper:timeout")));
}

#[test]
fn restart_without_snapshot_replays_the_wal() {
    let dir = tempdir().unwrap();
    let paths = Paths::under(dir.path().to_path_buf());

    {
        let daemon = startup(&paths).unwrap();
        take_lease(&daemon.store, "sweeper:retention");
        daemon.store.flush().unwrap();
        // Dropped without shutdown, as after a crash
    }

    let daemon = startup(&paths).unwrap();
    assert_eq!(daemon.recovery.snapshot_seq, None);
    assert!(daemon.recovery.replayed >= 1);
    assert!(daemon
        .store
        .read(|s| s.leases.contains_key("sweeper:retention")));
}

#[test]
fn checkpoint_skips_when_nothing_committed() {
    let dir = tempdir().unwrap();
    let paths = Paths::under(dir.path().to_path_buf());
    let daemon = startup(&paths).unwrap();

    assert!(checkpoint_if_advanced(&daemon.store, &paths.snapshot_path, 0)
        .unwrap()
        .is_none());
    assert!(!paths.snapshot_path.exists());

    take_lease(&daemon.store, "sweeper:timeout");
    let checkpoint = checkpoint_if_advanced(&daemon.store, &paths.snapshot_path, 0)
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.seq, daemon.store.seq());
    assert!(paths.snapshot_path.exists());

    let again =
        checkpoint_if_advanced(&daemon.store, &paths.snapshot_path, checkpoint.seq).unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn flush_task_stops_on_cancel() {
    let dir = tempdir().unwrap();
    let paths = Paths::under(dir.path().to_path_buf());
    let daemon = startup(&paths).unwrap();
    let cancel = CancellationToken::new();
    let flush = spawn_flush_task(daemon.store.clone(), cancel.clone());
    let checkpoint = spawn_checkpoint(
        daemon.store.clone(),
        paths.snapshot_path.clone(),
        cancel.clone(),
    );

    take_lease(&daemon.store, "sweeper:timeout");
    tokio::time::sleep(FLUSH_INTERVAL * 5).await;
    assert!(!daemon.store.needs_flush());

    cancel.cancel();
    flush.await.unwrap();
    checkpoint.await.unwrap();
}

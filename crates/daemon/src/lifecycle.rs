// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: startup, persistence loops, shutdown.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use fs2::FileExt;
use ot_storage::{Checkpoint, Recovery, Store, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::env;

/// Flush interval for group commit (~10ms durability window)
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Checkpoint interval (60 seconds)
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Files under the state directory
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root state directory (e.g. ~/.local/state/ot)
    pub state_dir: PathBuf,
    /// Lock/PID file
    pub lock_path: PathBuf,
    pub version_path: PathBuf,
    pub log_path: PathBuf,
    pub config_path: PathBuf,
    pub wal_path: PathBuf,
    pub snapshot_path: PathBuf,
    /// Per-run engine working directories
    pub workdir_path: PathBuf,
    /// Listener socket for clients and local agents
    pub socket_path: PathBuf,
    /// Configuration tarballs, by artifact id
    pub artifacts_path: PathBuf,
}

impl Paths {
    /// Paths under the state directory resolved from the environment
    pub fn load() -> Result<Self, LifecycleError> {
        Ok(Self::under(env::state_dir()?))
    }

    pub fn under(state_dir: PathBuf) -> Self {
        Self {
            lock_path: state_dir.join("otd.pid"),
            version_path: state_dir.join("otd.version"),
            log_path: state_dir.join("otd.log"),
            config_path: state_dir.join("otd.toml"),
            wal_path: state_dir.join("wal").join("store.wal"),
            snapshot_path: state_dir.join("snapshot.json.zst"),
            workdir_path: state_dir.join("workdirs"),
            socket_path: state_dir.join("otd.sock"),
            artifacts_path: state_dir.join("artifacts"),
            state_dir,
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Could not determine state directory")]
    NoStateDir,

    #[error("Failed to acquire lock: otd already running?")]
    LockFailed(#[source] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running daemon's exclusive hold on its state directory plus the
/// store recovered from it.
pub struct Daemon {
    pub paths: Paths,
    pub store: Store,
    pub recovery: Recovery,
    // NOTE(lifetime): Held to maintain exclusive file lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
}

/// Take the lock, create the layout and recover the store.
pub fn startup(paths: &Paths) -> Result<Daemon, LifecycleError> {
    std::fs::create_dir_all(&paths.state_dir)?;

    // Lock FIRST. Open without truncating so a running daemon's PID survives
    // a failed attempt.
    let mut lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&paths.lock_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(LifecycleError::LockFailed)?;

    match startup_locked(paths, &mut lock_file) {
        Ok((store, recovery)) => Ok(Daemon {
            paths: paths.clone(),
            store,
            recovery,
            lock_file,
        }),
        Err(e) => {
            cleanup(paths);
            Err(e)
        }
    }
}

fn startup_locked(paths: &Paths, lock_file: &mut File) -> Result<(Store, Recovery), LifecycleError> {
    lock_file.set_len(0)?;
    writeln!(lock_file, "{}", std::process::id())?;

    if let Some(parent) = paths.wal_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&paths.workdir_path)?;
    std::fs::create_dir_all(&paths.artifacts_path)?;
    std::fs::write(&paths.version_path, crate::VERSION)?;

    let (store, recovery) = Store::open(&paths.wal_path, &paths.snapshot_path)?;
    info!(
        snapshot_seq = ?recovery.snapshot_seq,
        replayed = recovery.replayed,
        seq = recovery.seq,
        "recovered store"
    );
    Ok((store, recovery))
}

impl Daemon {
    /// Flush, save a final snapshot so the next start replays nothing, and
    /// remove the PID, version and socket files. Call after every writer
    /// stopped.
    pub fn shutdown(self) -> Result<(), LifecycleError> {
        info!("Shutting down daemon...");

        if let Err(e) = self.store.flush() {
            warn!(error = %e, "failed to flush WAL on shutdown");
        }
        if self.store.seq() > 0 {
            match self.store.checkpoint(&self.paths.snapshot_path) {
                Ok(Checkpoint { seq, size_bytes }) => {
                    info!(seq, size_bytes, "saved final shutdown snapshot")
                }
                Err(e) => warn!(error = %e, "failed to save shutdown snapshot"),
            }
        }

        cleanup(&self.paths);
        // Lock released when self.lock_file drops
        info!("Daemon shutdown complete");
        Ok(())
    }
}

fn cleanup(paths: &Paths) {
    for path in [&paths.lock_path, &paths.version_path, &paths.socket_path] {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove file");
            }
        }
    }
}

/// Spawn a task that periodically flushes the store's WAL.
pub fn spawn_flush_task(store: Store, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if store.needs_flush() {
                if let Err(e) = store.flush() {
                    error!(error = %e, "failed to flush WAL");
                }
            }
        }
    })
}

/// Spawn a task that periodically saves snapshots and truncates the WAL.
///
/// Snapshot compression and file I/O run on the blocking pool.
pub fn spawn_checkpoint(
    store: Store,
    snapshot_path: PathBuf,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
        // The first tick completes immediately; nothing new to save yet
        interval.tick().await;
        let mut last_seq = store.seq();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let store = store.clone();
            let path = snapshot_path.clone();
            let result =
                tokio::task::spawn_blocking(move || checkpoint_if_advanced(&store, &path, last_seq))
                    .await;
            match result {
                Ok(Ok(Some(checkpoint))) => {
                    debug!(
                        seq = checkpoint.seq,
                        size_bytes = checkpoint.size_bytes,
                        "saved checkpoint snapshot"
                    );
                    last_seq = checkpoint.seq;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to save checkpoint snapshot"),
                Err(e) => error!(error = %e, "checkpoint task failed"),
            }
        }
    })
}

/// Checkpoint unless nothing committed since `last_seq`.
pub fn checkpoint_if_advanced(
    store: &Store,
    snapshot_path: &std::path::Path,
    last_seq: u64,
) -> Result<Option<Checkpoint>, StoreError> {
    if store.seq() <= last_seq {
        return Ok(None);
    }
    store.checkpoint(snapshot_path).map(Some)
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;

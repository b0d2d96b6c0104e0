// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The shared store: conditional transactions over the materialized tables,
//! made durable through the WAL and announced on a change feed.
//!
//! Every replica holds a clone of the same `Store`. A transaction closure
//! reads the current state and returns the events to commit; because the
//! closure runs under the store lock, checks inside it are atomic with the
//! write (compare-and-set). Closures must not block or await.

use crate::{MaterializedState, Snapshot, SnapshotError, Wal, WalError};
use ot_core::{ChangeKind, Event, ReplicaId, Table};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Buffered change notifications per feed subscriber
const CHANGE_FEED_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{table} {id} not found")]
    NotFound { table: Table, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl StoreError {
    pub fn not_found(table: Table, id: impl ToString) -> Self {
        StoreError::NotFound {
            table,
            id: id.to_string(),
        }
    }
}

/// Notification that a committed transaction touched a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub seq: u64,
    pub table: Table,
    pub kind: ChangeKind,
    pub id: String,
    pub origin: ReplicaId,
    /// Byte range appended, for log changes
    pub span: Option<(u64, u64)>,
}

/// Outcome of [`Store::transact`]
#[derive(Debug, Clone)]
pub struct Committed<T> {
    pub value: T,
    pub events: Vec<Event>,
    pub changes: Vec<Change>,
}

/// What `Store::open` recovered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub snapshot_seq: Option<u64>,
    pub replayed: usize,
    pub seq: u64,
}

/// Result of a completed checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub seq: u64,
    pub size_bytes: u64,
}

struct Inner {
    state: MaterializedState,
    wal: Option<Wal>,
    seq: u64,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<Change>,
}

impl Store {
    /// Volatile store with no WAL, used by tests and single-shot tools.
    pub fn in_memory() -> Self {
        Self::from_parts(MaterializedState::default(), None, 0)
    }

    /// Open a durable store: load the snapshot, then replay the WAL after it.
    pub fn open(wal_path: &Path, snapshot_path: &Path) -> Result<(Self, Recovery), StoreError> {
        let snapshot = Snapshot::load(snapshot_path)?;
        let (mut state, snapshot_seq) = match snapshot {
            Some(s) => (s.state, Some(s.seq)),
            None => (MaterializedState::default(), None),
        };
        let base = snapshot_seq.unwrap_or(0);

        let mut wal = Wal::open(wal_path)?;
        wal.advance_to(base);

        let entries = wal.entries_after(base)?;
        let replayed = entries.len();
        let mut seq = base;
        for entry in entries {
            for event in &entry.events {
                state.apply_event(event);
            }
            seq = entry.seq;
        }

        info!(
            snapshot_seq = ?snapshot_seq,
            replayed,
            seq,
            runs = state.runs.len(),
            jobs = state.jobs.len(),
            "store recovered",
        );
        let recovery = Recovery {
            snapshot_seq,
            replayed,
            seq,
        };
        Ok((Self::from_parts(state, Some(wal), seq), recovery))
    }

    fn from_parts(state: MaterializedState, wal: Option<Wal>, seq: u64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner { state, wal, seq })),
            changes,
        }
    }

    /// Read the current state.
    pub fn read<R>(&self, f: impl FnOnce(&MaterializedState) -> R) -> R {
        f(&self.inner.lock().state)
    }

    /// Run a conditional transaction.
    ///
    /// `f` inspects the state and returns the events to commit plus a value
    /// for the caller. An `Err` from `f` commits nothing. Committed events
    /// are logged as one WAL record, applied, and announced on the change
    /// feed in commit order.
    pub fn commit<T, E>(
        &self,
        origin: &ReplicaId,
        f: impl FnOnce(&MaterializedState) -> Result<(Vec<Event>, T), E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.transact(origin, f).map(|c| c.value)
    }

    /// Like [`Store::commit`], also returning the committed events and the
    /// changes they made.
    pub fn transact<T, E>(
        &self,
        origin: &ReplicaId,
        f: impl FnOnce(&MaterializedState) -> Result<(Vec<Event>, T), E>,
    ) -> Result<Committed<T>, E>
    where
        E: From<StoreError>,
    {
        let mut inner = self.inner.lock();
        let (events, value) = f(&inner.state)?;
        if events.is_empty() {
            return Ok(Committed {
                value,
                events,
                changes: Vec::new(),
            });
        }

        let seq = match inner.wal.as_mut() {
            Some(wal) => wal.append(origin, &events).map_err(StoreError::from)?,
            None => inner.seq + 1,
        };
        inner.seq = seq;

        let mut changes = Vec::with_capacity(events.len());
        for event in &events {
            let span = match event {
                Event::ChunkAppended { chunk } => Some((chunk.offset, chunk.end())),
                _ => None,
            };
            let Some(kind) = inner.state.apply_event(event) else {
                continue;
            };
            let Some((table, id)) = event.subject() else {
                continue;
            };
            debug!(seq, origin = %origin, event = %event.log_summary(), "committed");
            let change = Change {
                seq,
                table,
                kind,
                id,
                origin: origin.clone(),
                span,
            };
            // No receivers is fine; the feed is best-effort fan-out
            let _ = self.changes.send(change.clone());
            changes.push(change);
        }
        Ok(Committed {
            value,
            events,
            changes,
        })
    }

    /// Subscribe to change notifications committed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    pub fn seq(&self) -> u64 {
        self.inner.lock().seq
    }

    pub fn is_durable(&self) -> bool {
        self.inner.lock().wal.is_some()
    }

    pub fn needs_flush(&self) -> bool {
        self.inner.lock().wal.as_ref().is_some_and(|w| w.needs_flush())
    }

    /// Make buffered transactions durable.
    pub fn flush(&self) -> Result<(), StoreError> {
        if let Some(wal) = self.inner.lock().wal.as_mut() {
            wal.flush()?;
        }
        Ok(())
    }

    /// Snapshot of the state at the current seq. Flushes first so the
    /// snapshot never covers transactions missing from disk.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(wal) = inner.wal.as_mut() {
            wal.flush()?;
        }
        Ok(Snapshot::new(inner.seq, inner.state.clone()))
    }

    /// Save a snapshot to `path`, then drop the WAL records it covers.
    ///
    /// The state is cloned under the lock; compression and file I/O run
    /// outside it. Call from a blocking context.
    pub fn checkpoint(&self, path: &Path) -> Result<Checkpoint, StoreError> {
        let snapshot = self.snapshot()?;
        let size_bytes = snapshot.save(path)?;
        if let Some(wal) = self.inner.lock().wal.as_mut() {
            wal.truncate_before(snapshot.seq + 1)?;
        }
        Ok(Checkpoint {
            seq: snapshot.seq,
            size_bytes,
        })
    }

    /// Take or renew the named lease for `ttl_ms`. Returns whether `replica`
    /// holds it afterwards.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        replica: &ReplicaId,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.commit(replica, |state| {
            let free = state
                .leases
                .get(name)
                .is_none_or(|lease| lease.available_to(replica, now_ms));
            if !free {
                return Ok((vec![], false));
            }
            let event = Event::LeaseAcquired {
                name: name.to_string(),
                holder: replica.clone(),
                expires_at_ms: now_ms + ttl_ms,
            };
            Ok::<_, StoreError>((vec![event], true))
        })
    }

    pub fn release_lease(&self, name: &str, replica: &ReplicaId) -> Result<(), StoreError> {
        self.commit(replica, |state| {
            let held = state.leases.get(name).is_some_and(|l| l.holder == *replica);
            let events = if held {
                vec![Event::LeaseReleased {
                    name: name.to_string(),
                    holder: replica.clone(),
                }]
            } else {
                vec![]
            };
            Ok::<_, StoreError>((events, ()))
        })
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

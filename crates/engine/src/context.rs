// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handles shared by every service on a replica

use crate::artifacts::{ArtifactStore, MemoryArtifacts};
use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::error::EngineError;
use ot_core::{ChangeKind, Clock, ClusterEvent, Event, IdGen, Payload, ReplicaId, Table};
use ot_storage::{Change, MaterializedState, Store};
use std::sync::Arc;

/// Store, bus and identity of one replica, plus the artifact collaborator.
///
/// Clones share everything; services hold their own clone.
#[derive(Clone)]
pub struct Ctx<C: Clock> {
    pub store: Store,
    pub bus: EventBus,
    pub replica: ReplicaId,
    pub clock: C,
    pub ids: Arc<dyn IdGen>,
    pub config: Arc<EngineConfig>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl<C: Clock> Ctx<C> {
    pub fn new(
        store: Store,
        replica: ReplicaId,
        clock: C,
        ids: Arc<dyn IdGen>,
        config: EngineConfig,
    ) -> Self {
        let bus = EventBus::new(config.event_buffer);
        let artifacts = Arc::new(MemoryArtifacts::new(ids.clone()));
        Self {
            store,
            bus,
            replica,
            clock,
            ids,
            config: Arc::new(config),
            artifacts,
        }
    }

    /// Serve configuration tarballs from `artifacts` instead of memory.
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.epoch_ms()
    }

    /// Run a conditional transaction and publish what it changed on the
    /// local bus. Other replicas learn of it through their relay.
    pub fn commit<T>(
        &self,
        f: impl FnOnce(&MaterializedState) -> Result<(Vec<Event>, T), EngineError>,
    ) -> Result<T, EngineError> {
        let committed = self.store.transact(&self.replica, f)?;
        for change in &committed.changes {
            if change.table == Table::Lease {
                continue;
            }
            self.bus.publish(ClusterEvent {
                kind: change.kind,
                table: change.table,
                id: change.id.clone(),
                payload: payload_for(&committed.events, change),
                origin: self.replica.clone(),
            });
        }
        Ok(committed.value)
    }
}

/// Row a committed event wrote for `change`. Deletes carry none.
fn payload_for(events: &[Event], change: &Change) -> Option<Payload> {
    if change.kind == ChangeKind::Deleted {
        return None;
    }
    let id = change.id.as_str();
    events.iter().rev().find_map(|event| match (change.table, event) {
        (Table::Run, Event::RunSaved { run }) if run.id.as_str() == id => {
            Some(Payload::Run(run.clone()))
        }
        (Table::Job, Event::JobSaved { job }) if job.id.as_str() == id => {
            Some(Payload::Job(job.clone()))
        }
        (Table::Workspace, Event::WorkspaceSaved { workspace }) if workspace.id.as_str() == id => {
            Some(Payload::Workspace(workspace.clone()))
        }
        (Table::ConfigVersion, Event::ConfigVersionSaved { config_version })
            if config_version.id.as_str() == id =>
        {
            Some(Payload::ConfigVersion(config_version.clone()))
        }
        (Table::Log, Event::ChunkAppended { chunk })
            if change.span == Some((chunk.offset, chunk.end())) && chunk.log_key().to_string() == id =>
        {
            Some(Payload::Chunk(chunk.clone()))
        }
        (Table::Runner, Event::RunnerSaved { runner }) if runner.id.as_str() == id => {
            Some(Payload::Runner(runner.clone()))
        }
        _ => None,
    })
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;

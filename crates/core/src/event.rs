// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable mutation records.
//!
//! Every committed store transaction is a list of these events; each one is
//! written to the WAL and applied to the materialized state. Rows are saved
//! whole, so applying an event twice leaves the same state.

use crate::chunk::Chunk;
use crate::cluster::{ReplicaId, Table};
use crate::config_version::{ConfigVersion, ConfigVersionId};
use crate::job::{Job, JobId};
use crate::run::{Run, RunId};
use crate::runner::{RunnerId, RunnerMeta};
use crate::workspace::{Workspace, WorkspaceId};
use serde::{Deserialize, Serialize};

/// Mutation of the shared store.
///
/// Serializes with `{"type": "table:verb", ...fields}` format.
/// Unknown type tags deserialize to `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- run --
    #[serde(rename = "run:saved")]
    RunSaved { run: Box<Run> },

    /// Removes the run and cascades to its jobs and logs
    #[serde(rename = "run:deleted")]
    RunDeleted { id: RunId },

    // -- job --
    #[serde(rename = "job:saved")]
    JobSaved { job: Box<Job> },

    #[serde(rename = "job:deleted")]
    JobDeleted { id: JobId },

    // -- workspace --
    #[serde(rename = "workspace:saved")]
    WorkspaceSaved { workspace: Workspace },

    #[serde(rename = "workspace:deleted")]
    WorkspaceDeleted { id: WorkspaceId },

    // -- config version --
    #[serde(rename = "config_version:saved")]
    ConfigVersionSaved { config_version: ConfigVersion },

    #[serde(rename = "config_version:deleted")]
    ConfigVersionDeleted { id: ConfigVersionId },

    // -- log --
    #[serde(rename = "chunk:appended")]
    ChunkAppended { chunk: Chunk },

    // -- runner --
    #[serde(rename = "runner:saved")]
    RunnerSaved { runner: RunnerMeta },

    #[serde(rename = "runner:deleted")]
    RunnerDeleted { id: RunnerId },

    // -- lease --
    #[serde(rename = "lease:acquired")]
    LeaseAcquired {
        name: String,
        holder: ReplicaId,
        expires_at_ms: u64,
    },

    #[serde(rename = "lease:released")]
    LeaseReleased { name: String, holder: ReplicaId },

    /// Unknown event written by a newer version; ignored on replay
    #[serde(other, skip_serializing)]
    Custom,
}

impl Event {
    pub fn name(&self) -> &str {
        match self {
            Event::RunSaved { .. } => "run:saved",
            Event::RunDeleted { .. } => "run:deleted",
            Event::JobSaved { .. } => "job:saved",
            Event::JobDeleted { .. } => "job:deleted",
            Event::WorkspaceSaved { .. } => "workspace:saved",
            Event::WorkspaceDeleted { .. } => "workspace:deleted",
            Event::ConfigVersionSaved { .. } => "config_version:saved",
            Event::ConfigVersionDeleted { .. } => "config_version:deleted",
            Event::ChunkAppended { .. } => "chunk:appended",
            Event::RunnerSaved { .. } => "runner:saved",
            Event::RunnerDeleted { .. } => "runner:deleted",
            Event::LeaseAcquired { .. } => "lease:acquired",
            Event::LeaseReleased { .. } => "lease:released",
            Event::Custom => "custom",
        }
    }

    /// Table and row id touched by this event.
    pub fn subject(&self) -> Option<(Table, String)> {
        let subject = match self {
            Event::RunSaved { run } => (Table::Run, run.id.to_string()),
            Event::RunDeleted { id } => (Table::Run, id.to_string()),
            Event::JobSaved { job } => (Table::Job, job.id.to_string()),
            Event::JobDeleted { id } => (Table::Job, id.to_string()),
            Event::WorkspaceSaved { workspace } => (Table::Workspace, workspace.id.to_string()),
            Event::WorkspaceDeleted { id } => (Table::Workspace, id.to_string()),
            Event::ConfigVersionSaved { config_version } => {
                (Table::ConfigVersion, config_version.id.to_string())
            }
            Event::ConfigVersionDeleted { id } => (Table::ConfigVersion, id.to_string()),
            Event::ChunkAppended { chunk } => (Table::Log, chunk.log_key().to_string()),
            Event::RunnerSaved { runner } => (Table::Runner, runner.id.to_string()),
            Event::RunnerDeleted { id } => (Table::Runner, id.to_string()),
            Event::LeaseAcquired { name, .. } | Event::LeaseReleased { name, .. } => {
                (Table::Lease, name.clone())
            }
            Event::Custom => return None,
        };
        Some(subject)
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Event::RunDeleted { .. }
                | Event::JobDeleted { .. }
                | Event::WorkspaceDeleted { .. }
                | Event::ConfigVersionDeleted { .. }
                | Event::RunnerDeleted { .. }
                | Event::LeaseReleased { .. }
        )
    }

    pub fn log_summary(&self) -> String {
        let t = self.name();
        match self {
            Event::RunSaved { run } => format!("{t} id={} status={}", run.id, run.status),
            Event::JobSaved { job } => {
                format!("{t} id={} run={} status={}", job.id, job.run_id, job.status)
            }
            Event::ChunkAppended { chunk } => format!(
                "{t} log={} offset={} len={}",
                chunk.log_key(),
                chunk.offset,
                chunk.data.len()
            ),
            Event::RunnerSaved { runner } => {
                format!("{t} id={} status={}", runner.id, runner.status)
            }
            Event::LeaseAcquired { name, holder, .. } | Event::LeaseReleased { name, holder } => {
                format!("{t} name={name} holder={holder}")
            }
            other => match other.subject() {
                Some((_, id)) => format!("{t} id={id}"),
                None => t.to_string(),
            },
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster-level change events, replicas and leases.

use crate::chunk::Chunk;
use crate::config_version::ConfigVersion;
use crate::job::Job;
use crate::run::{Run, RunId};
use crate::runner::RunnerMeta;
use crate::workspace::{Workspace, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::fmt;

crate::define_id! {
    /// Identifier of one server process sharing the store.
    pub struct ReplicaId("replica");
}

/// Table a change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Run,
    Job,
    Workspace,
    ConfigVersion,
    Log,
    Runner,
    Lease,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Table::Run => "run",
            Table::Job => "job",
            Table::Workspace => "workspace",
            Table::ConfigVersion => "config_version",
            Table::Log => "log",
            Table::Runner => "runner",
            Table::Lease => "lease",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// Row carried by a cluster event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Payload {
    Run(Box<Run>),
    Job(Box<Job>),
    Workspace(Workspace),
    ConfigVersion(ConfigVersion),
    /// A single appended chunk, not the whole log
    Chunk(Chunk),
    Runner(RunnerMeta),
}

/// A mutation observed somewhere in the cluster.
///
/// Delivery is at-least-once and FIFO per subject only. Consumers that need
/// authoritative state re-read it from the store by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    pub origin: ReplicaId,
}

impl ClusterEvent {
    pub fn workspace_id(&self) -> Option<&WorkspaceId> {
        match self.payload.as_ref()? {
            Payload::Run(run) => Some(&run.workspace_id),
            Payload::Job(job) => Some(&job.workspace_id),
            Payload::Workspace(ws) => Some(&ws.id),
            Payload::ConfigVersion(cv) => Some(&cv.workspace_id),
            Payload::Chunk(_) | Payload::Runner(_) => None,
        }
    }

    pub fn run_id(&self) -> Option<&RunId> {
        match self.payload.as_ref()? {
            Payload::Run(run) => Some(&run.id),
            Payload::Job(job) => Some(&job.run_id),
            Payload::Chunk(chunk) => Some(&chunk.run_id),
            Payload::Workspace(_) | Payload::ConfigVersion(_) | Payload::Runner(_) => None,
        }
    }

    pub fn run(&self) -> Option<&Run> {
        match &self.payload {
            Some(Payload::Run(run)) => Some(run),
            _ => None,
        }
    }

    pub fn chunk(&self) -> Option<&Chunk> {
        match &self.payload {
            Some(Payload::Chunk(chunk)) => Some(chunk),
            _ => None,
        }
    }

    pub fn log_summary(&self) -> String {
        format!("{}:{} id={} origin={}", self.table, self.kind, self.id, self.origin)
    }
}

/// Time-bounded singleton grant for a cluster-wide loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder: ReplicaId,
    pub expires_at_ms: u64,
}

impl Lease {
    /// `replica` may take or renew the lease at `now_ms`.
    pub fn available_to(&self, replica: &ReplicaId, now_ms: u64) -> bool {
        self.holder == *replica || now_ms >= self.expires_at_ms
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner registry records.

use serde::{Deserialize, Serialize};
use std::fmt;

crate::define_id! {
    /// Unique identifier for a registered runner (built-in or agent).
    pub struct RunnerId("runner");
}

crate::define_id! {
    /// Identifier of a pool of external agents.
    pub struct AgentPoolId("apool");
}

/// Self-reported runner status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Busy,
    Exited,
    Errored,
    #[default]
    Unknown,
}

impl RunnerStatus {
    /// Whether a runner in this status may be handed jobs.
    pub fn is_healthy(self) -> bool {
        matches!(self, RunnerStatus::Idle | RunnerStatus::Busy)
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Idle => write!(f, "idle"),
            RunnerStatus::Busy => write!(f, "busy"),
            RunnerStatus::Exited => write!(f, "exited"),
            RunnerStatus::Errored => write!(f, "errored"),
            RunnerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A runner known to the cluster.
///
/// `agent_pool_id` is `None` for the server's built-in runner. `current_jobs`
/// is derived by the store from the jobs table and never set by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerMeta {
    pub id: RunnerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pool_id: Option<AgentPoolId>,
    pub max_jobs: u32,
    #[serde(default)]
    pub status: RunnerStatus,
    #[serde(default)]
    pub last_ping_at_ms: u64,
    #[serde(default)]
    pub current_jobs: u32,
    #[serde(default)]
    pub registered_at_ms: u64,
}

impl RunnerMeta {
    pub fn new(
        id: RunnerId,
        name: impl Into<String>,
        agent_pool_id: Option<AgentPoolId>,
        max_jobs: u32,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            agent_pool_id,
            max_jobs: max_jobs.max(1),
            status: RunnerStatus::Idle,
            last_ping_at_ms: now_ms,
            current_jobs: 0,
            registered_at_ms: now_ms,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.agent_pool_id.is_none()
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// A job tagged with `pool` may go to this runner. Untagged jobs only
    /// match the built-in runner.
    pub fn matches_pool(&self, pool: Option<&AgentPoolId>) -> bool {
        self.agent_pool_id.as_ref() == pool
    }

    pub fn has_capacity(&self) -> bool {
        self.current_jobs < self.max_jobs
    }

    pub fn is_stale(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_ping_at_ms) > stale_after_ms
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;

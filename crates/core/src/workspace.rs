// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace reference and its execution lock.
//!
//! Workspaces are owned by an external collaborator; this crate only mirrors
//! the fields scheduling needs: where jobs execute and who holds the lock.

use crate::run::RunId;
use crate::runner::AgentPoolId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

crate::define_id! {
    /// Unique identifier for a workspace.
    pub struct WorkspaceId("ws");
}

crate::define_id! {
    /// Identifier of a user holding a manual workspace lock.
    pub struct UserId("user");
}

/// Where a workspace's runs execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Executed by the server's built-in runner
    #[default]
    Remote,
    /// Executed by an external agent belonging to the workspace's pool
    Agent,
    /// Executed by the user's CLI; no jobs are created
    Local,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Remote => write!(f, "remote"),
            ExecutionMode::Agent => write!(f, "agent"),
            ExecutionMode::Local => write!(f, "local"),
        }
    }
}

/// Subject holding a workspace lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LockHolder {
    Run(RunId),
    User(UserId),
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::Run(id) => write!(f, "{}", id),
            LockHolder::User(id) => write!(f, "{}", id),
        }
    }
}

/// Errors from lock transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("workspace already locked by {0}")]
    AlreadyLocked(LockHolder),
    #[error("workspace is not locked")]
    NotLocked,
    #[error("workspace locked by {held}; force required to unlock as {requested}")]
    HeldByOther {
        held: LockHolder,
        requested: LockHolder,
    },
}

/// Workspace record as seen by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub organization: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pool_id: Option<AgentPoolId>,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockHolder>,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl Workspace {
    pub fn new(id: WorkspaceId, organization: impl Into<String>) -> Self {
        Self {
            id,
            organization: organization.into(),
            execution_mode: ExecutionMode::Remote,
            agent_pool_id: None,
            auto_apply: false,
            lock: None,
            created_at_ms: 0,
        }
    }

    /// Builder-style: execute runs on agents from the given pool
    pub fn with_agent_pool(mut self, pool: AgentPoolId) -> Self {
        self.execution_mode = ExecutionMode::Agent;
        self.agent_pool_id = Some(pool);
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Pool tag for jobs created on this workspace (None = built-in runner).
    pub fn job_pool(&self) -> Option<AgentPoolId> {
        match self.execution_mode {
            ExecutionMode::Agent => self.agent_pool_id.clone(),
            ExecutionMode::Remote | ExecutionMode::Local => None,
        }
    }

    /// Acquire the lock for `holder`. Re-locking by the current holder is a no-op.
    pub fn lock(&mut self, holder: LockHolder) -> Result<(), LockError> {
        match &self.lock {
            None => {
                self.lock = Some(holder);
                Ok(())
            }
            Some(held) if *held == holder => Ok(()),
            Some(held) => Err(LockError::AlreadyLocked(held.clone())),
        }
    }

    /// Release the lock. A lock held by another subject requires `force`.
    pub fn unlock(&mut self, requested: &LockHolder, force: bool) -> Result<(), LockError> {
        match &self.lock {
            None => Err(LockError::NotLocked),
            Some(held) if held == requested || force => {
                self.lock = None;
                Ok(())
            }
            Some(held) => Err(LockError::HeldByOther {
                held: held.clone(),
                requested: requested.clone(),
            }),
        }
    }
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job record: one phase of a run bound to a runner.

use crate::run::{Phase, Run, RunId};
use crate::runner::{AgentPoolId, RunnerId};
use crate::workspace::WorkspaceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

crate::define_id! {
    /// Unique identifier for a job.
    pub struct JobId("job");
}

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Unallocated,
    Allocated,
    Running,
    Finished,
    Errored,
    Canceled,
    ForceCanceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Errored | JobStatus::Canceled | JobStatus::ForceCanceled
        )
    }

    /// Whether `self → next` is permitted. `Allocated → Unallocated` is the
    /// reallocation edge used when a runner goes away before starting.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Unallocated => matches!(next, Allocated | Canceled | ForceCanceled),
            Allocated => matches!(next, Running | Unallocated | Canceled | ForceCanceled),
            Running => matches!(next, Finished | Errored | Canceled | ForceCanceled),
            Finished | Errored | Canceled | ForceCanceled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Unallocated => "unallocated",
            JobStatus::Allocated => "allocated",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Errored => "errored",
            JobStatus::Canceled => "canceled",
            JobStatus::ForceCanceled => "force_canceled",
        };
        f.write_str(s)
    }
}

/// Interrupt requested of the runner executing a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Graceful interrupt; the engine may finish writing state
    Cancel,
    /// Kill the engine immediately
    ForceCancel,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Cancel => write!(f, "cancel"),
            Signal::ForceCancel => write!(f, "force_cancel"),
        }
    }
}

/// Errors from job state changes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("job is assigned to {assigned:?}, not {runner}")]
    NotAssigned {
        assigned: Option<RunnerId>,
        runner: RunnerId,
    },
    #[error("job already signaled {0}")]
    AlreadySignaled(Signal),
}

/// Work item for one phase of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub workspace_id: WorkspaceId,
    pub phase: Phase,
    pub status: JobStatus,
    /// None = built-in runner only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pool_id: Option<AgentPoolId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<RunnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaled: Option<Signal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaled_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Job {
    pub fn new(id: JobId, run: &Run, phase: Phase, now_ms: u64) -> Self {
        Self {
            id,
            run_id: run.id.clone(),
            workspace_id: run.workspace_id.clone(),
            phase,
            status: JobStatus::Unallocated,
            agent_pool_id: run.agent_pool_id.clone(),
            runner_id: None,
            signaled: None,
            signaled_at_ms: None,
            error: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&mut self, to: JobStatus, now_ms: u64) -> Result<(), JobError> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at_ms = now_ms;
        Ok(())
    }

    /// `Unallocated → Allocated` to `runner`.
    pub fn allocate(&mut self, runner: RunnerId, now_ms: u64) -> Result<(), JobError> {
        if self.status != JobStatus::Unallocated {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Allocated,
            });
        }
        self.transition(JobStatus::Allocated, now_ms)?;
        self.runner_id = Some(runner);
        Ok(())
    }

    /// Return an allocated job to the queue.
    pub fn reallocate(&mut self, now_ms: u64) -> Result<(), JobError> {
        self.transition(JobStatus::Unallocated, now_ms)?;
        self.runner_id = None;
        Ok(())
    }

    /// Reject calls from a runner the job is not assigned to.
    pub fn check_runner(&self, runner: &RunnerId) -> Result<(), JobError> {
        if self.runner_id.as_ref() == Some(runner) {
            Ok(())
        } else {
            Err(JobError::NotAssigned {
                assigned: self.runner_id.clone(),
                runner: runner.clone(),
            })
        }
    }

    pub fn start(&mut self, runner: &RunnerId, now_ms: u64) -> Result<(), JobError> {
        self.check_runner(runner)?;
        self.transition(JobStatus::Running, now_ms)
    }

    /// Request an interrupt. A soft cancel is recorded once; a force cancel
    /// may upgrade a pending soft cancel.
    pub fn signal(&mut self, signal: Signal, now_ms: u64) -> Result<(), JobError> {
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Canceled,
            });
        }
        match (self.signaled, signal) {
            (Some(Signal::ForceCancel), _) | (Some(Signal::Cancel), Signal::Cancel) => {
                return Err(JobError::AlreadySignaled(signal));
            }
            _ => {}
        }
        self.signaled = Some(signal);
        self.signaled_at_ms = Some(now_ms);
        self.updated_at_ms = now_ms;
        Ok(())
    }

    /// Terminal status for a runner-reported result. A job that was signaled
    /// and then exits is recorded as canceled regardless of exit status.
    pub fn finish(&mut self, error: Option<String>, now_ms: u64) -> Result<JobStatus, JobError> {
        let status = match (self.signaled, &error) {
            (Some(Signal::Cancel), _) => JobStatus::Canceled,
            (Some(Signal::ForceCancel), _) => JobStatus::ForceCanceled,
            (None, Some(_)) => JobStatus::Errored,
            (None, None) => JobStatus::Finished,
        };
        self.transition(status, now_ms)?;
        self.error = error;
        Ok(status)
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;

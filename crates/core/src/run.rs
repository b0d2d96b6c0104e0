// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run record and its status graph.
//!
//! A run moves through plan and (optionally) apply phases. Every status the
//! run enters is recorded in `status_timestamps`; the graph has no cycles, so
//! each status appears at most once.

use crate::config_version::ConfigVersionId;
use crate::runner::AgentPoolId;
use crate::workspace::{ExecutionMode, Workspace, WorkspaceId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

crate::define_id! {
    /// Unique identifier for a run.
    pub struct RunId("run");
}

/// Phase of a run executed by a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Plan => write!(f, "plan"),
            Phase::Apply => write!(f, "apply"),
        }
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    PlanQueued,
    Planning,
    Planned,
    PlannedAndFinished,
    ApplyQueued,
    Applying,
    Applied,
    Discarded,
    Canceled,
    ForceCanceled,
    Errored,
}

impl RunStatus {
    pub const ALL: [RunStatus; 12] = [
        RunStatus::Pending,
        RunStatus::PlanQueued,
        RunStatus::Planning,
        RunStatus::Planned,
        RunStatus::PlannedAndFinished,
        RunStatus::ApplyQueued,
        RunStatus::Applying,
        RunStatus::Applied,
        RunStatus::Discarded,
        RunStatus::Canceled,
        RunStatus::ForceCanceled,
        RunStatus::Errored,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Applied
                | RunStatus::PlannedAndFinished
                | RunStatus::Discarded
                | RunStatus::Canceled
                | RunStatus::ForceCanceled
                | RunStatus::Errored
        )
    }

    /// A phase job is executing (or about to) for this status.
    pub fn is_executing(self) -> bool {
        matches!(self, RunStatus::Planning | RunStatus::Applying)
    }

    pub fn is_queued(self) -> bool {
        matches!(self, RunStatus::PlanQueued | RunStatus::ApplyQueued)
    }

    /// Phase whose job belongs to this status, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            RunStatus::PlanQueued | RunStatus::Planning => Some(Phase::Plan),
            RunStatus::ApplyQueued | RunStatus::Applying => Some(Phase::Apply),
            _ => None,
        }
    }

    /// Whether `self → next` is an edge of the run status graph.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            Pending => matches!(next, PlanQueued | Canceled | Discarded),
            PlanQueued => matches!(next, Planning | Canceled | ForceCanceled),
            Planning => matches!(
                next,
                Planned | PlannedAndFinished | Errored | Canceled | ForceCanceled
            ),
            Planned => matches!(next, ApplyQueued | Discarded | Canceled),
            ApplyQueued => matches!(next, Applying | Canceled | ForceCanceled),
            Applying => matches!(next, Applied | Errored | Canceled | ForceCanceled),
            Applied | PlannedAndFinished | Discarded | Canceled | ForceCanceled | Errored => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::PlanQueued => "plan_queued",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::PlannedAndFinished => "planned_and_finished",
            RunStatus::ApplyQueued => "apply_queued",
            RunStatus::Applying => "applying",
            RunStatus::Applied => "applied",
            RunStatus::Discarded => "discarded",
            RunStatus::Canceled => "canceled",
            RunStatus::ForceCanceled => "force_canceled",
            RunStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Resource change counts produced by a plan or apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub additions: u32,
    pub changes: u32,
    pub destructions: u32,
}

impl Report {
    pub fn new(additions: u32, changes: u32, destructions: u32) -> Self {
        Self {
            additions,
            changes,
            destructions,
        }
    }

    pub fn has_changes(&self) -> bool {
        self.additions + self.changes + self.destructions > 0
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} ~{} -{}",
            self.additions, self.changes, self.destructions
        )
    }
}

/// Result of executing one phase, as reported by a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Succeeded { report: Report },
    Failed { reason: String },
}

/// Options for creating a run. Unset fields fall back to workspace or
/// config-version defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    pub plan_only: Option<bool>,
    pub is_destroy: bool,
    pub auto_apply: Option<bool>,
    pub refresh: Option<bool>,
    pub target_addrs: Vec<String>,
    pub replace_addrs: Vec<String>,
    pub message: Option<String>,
    pub source: Option<String>,
}

/// Errors from run state changes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("invalid run transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("{0} phase already started")]
    AlreadyStarted(Phase),
    #[error("run cannot be applied from status {0}")]
    NotConfirmable(RunStatus),
    #[error("plan-only runs cannot be applied")]
    PlanOnly,
    #[error("run cannot be canceled from status {0}")]
    NotCancelable(RunStatus),
    #[error("cancel already signaled")]
    CancelAlreadySignaled,
    #[error("run cannot be discarded from status {0}")]
    NotDiscardable(RunStatus),
    #[error("force cancel not available until a cancel was signaled and the grace period elapsed")]
    ForceCancelUnavailable,
}

/// Time spent in one status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPeriod {
    pub status: RunStatus,
    pub duration_ms: u64,
}

/// Breakdown of a run's elapsed time per status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeriodReport {
    pub total_ms: u64,
    pub periods: Vec<StatusPeriod>,
}

/// A plan/apply execution against a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workspace_id: WorkspaceId,
    pub config_version_id: ConfigVersionId,
    pub status: RunStatus,
    /// Epoch ms at which each status was entered, in entry order
    pub status_timestamps: IndexMap<RunStatus, u64>,
    #[serde(default)]
    pub plan_only: bool,
    #[serde(default)]
    pub is_destroy: bool,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default = "default_refresh")]
    pub refresh: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_addrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_addrs: Vec<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pool_id: Option<AgentPoolId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_report: Option<Report>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_report: Option<Report>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_signaled_at_ms: Option<u64>,
    /// Human-readable failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

fn default_refresh() -> bool {
    true
}

impl Run {
    /// Build a pending run for `workspace`.
    ///
    /// `speculative` is the config version's own plan-only flag; an explicit
    /// `opts.plan_only` takes precedence.
    pub fn new(
        id: RunId,
        workspace: &Workspace,
        config_version_id: ConfigVersionId,
        speculative: bool,
        opts: CreateOptions,
        now_ms: u64,
    ) -> Self {
        let mut status_timestamps = IndexMap::new();
        status_timestamps.insert(RunStatus::Pending, now_ms);
        Self {
            id,
            workspace_id: workspace.id.clone(),
            config_version_id,
            status: RunStatus::Pending,
            status_timestamps,
            plan_only: opts.plan_only.unwrap_or(speculative),
            is_destroy: opts.is_destroy,
            auto_apply: opts.auto_apply.unwrap_or(workspace.auto_apply),
            refresh: opts.refresh.unwrap_or(true),
            target_addrs: opts.target_addrs,
            replace_addrs: opts.replace_addrs,
            message: opts.message.unwrap_or_default(),
            source: opts.source.unwrap_or_else(|| "api".to_string()),
            execution_mode: workspace.execution_mode,
            agent_pool_id: workspace.job_pool(),
            plan_report: None,
            apply_report: None,
            cancel_signaled_at_ms: None,
            error: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move along one edge of the status graph, recording the timestamp.
    pub fn transition(&mut self, to: RunStatus, now_ms: u64) -> Result<(), RunError> {
        if !self.status.can_transition_to(to) {
            return Err(RunError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.status_timestamps.insert(to, now_ms);
        self.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn timestamp(&self, status: RunStatus) -> Option<u64> {
        self.status_timestamps.get(&status).copied()
    }

    pub fn enqueue_plan(&mut self, now_ms: u64) -> Result<(), RunError> {
        self.transition(RunStatus::PlanQueued, now_ms)
    }

    /// Start the queued phase, returning which phase started.
    pub fn start_phase(&mut self, now_ms: u64) -> Result<Phase, RunError> {
        match self.status {
            RunStatus::PlanQueued => {
                self.transition(RunStatus::Planning, now_ms)?;
                Ok(Phase::Plan)
            }
            RunStatus::ApplyQueued => {
                self.transition(RunStatus::Applying, now_ms)?;
                Ok(Phase::Apply)
            }
            RunStatus::Planning => Err(RunError::AlreadyStarted(Phase::Plan)),
            RunStatus::Applying => Err(RunError::AlreadyStarted(Phase::Apply)),
            other => Err(RunError::InvalidTransition {
                from: other,
                to: RunStatus::Planning,
            }),
        }
    }

    /// Record the plan result.
    ///
    /// Returns true when the apply should be enqueued automatically.
    pub fn finish_plan(&mut self, outcome: PhaseOutcome, now_ms: u64) -> Result<bool, RunError> {
        match outcome {
            PhaseOutcome::Failed { reason } => {
                self.transition(RunStatus::Errored, now_ms)?;
                self.error = Some(reason);
                Ok(false)
            }
            PhaseOutcome::Succeeded { report } => {
                if !report.has_changes() || self.plan_only {
                    self.transition(RunStatus::PlannedAndFinished, now_ms)?;
                    self.plan_report = Some(report);
                    return Ok(false);
                }
                self.transition(RunStatus::Planned, now_ms)?;
                self.plan_report = Some(report);
                Ok(self.auto_apply)
            }
        }
    }

    pub fn finish_apply(&mut self, outcome: PhaseOutcome, now_ms: u64) -> Result<(), RunError> {
        match outcome {
            PhaseOutcome::Failed { reason } => {
                self.transition(RunStatus::Errored, now_ms)?;
                self.error = Some(reason);
            }
            PhaseOutcome::Succeeded { report } => {
                self.transition(RunStatus::Applied, now_ms)?;
                self.apply_report = Some(report);
            }
        }
        Ok(())
    }

    /// `Planned` and not plan-only
    pub fn confirmable(&self) -> bool {
        self.status == RunStatus::Planned && !self.plan_only
    }

    pub fn enqueue_apply(&mut self, now_ms: u64) -> Result<(), RunError> {
        if self.plan_only {
            return Err(RunError::PlanOnly);
        }
        if self.status != RunStatus::Planned {
            return Err(RunError::NotConfirmable(self.status));
        }
        self.transition(RunStatus::ApplyQueued, now_ms)
    }

    pub fn discardable(&self) -> bool {
        matches!(self.status, RunStatus::Pending | RunStatus::Planned)
    }

    pub fn discard(&mut self, now_ms: u64) -> Result<(), RunError> {
        if !self.discardable() {
            return Err(RunError::NotDiscardable(self.status));
        }
        self.transition(RunStatus::Discarded, now_ms)
    }

    pub fn cancelable(&self) -> bool {
        self.cancel_signaled_at_ms.is_none()
            && matches!(
                self.status,
                RunStatus::Pending
                    | RunStatus::PlanQueued
                    | RunStatus::Planning
                    | RunStatus::Planned
                    | RunStatus::ApplyQueued
                    | RunStatus::Applying
            )
    }

    /// Note that an interrupt was sent to the executing runner. The status
    /// does not change until the runner acknowledges or the grace period ends.
    pub fn signal_cancel(&mut self, now_ms: u64) -> Result<(), RunError> {
        if !self.status.is_executing() {
            return Err(RunError::NotCancelable(self.status));
        }
        if self.cancel_signaled_at_ms.is_some() {
            return Err(RunError::CancelAlreadySignaled);
        }
        self.cancel_signaled_at_ms = Some(now_ms);
        self.updated_at_ms = now_ms;
        Ok(())
    }

    /// Epoch ms from which a force cancel is permitted, if a cancel was signaled.
    pub fn force_cancel_available_at(&self, grace_ms: u64) -> Option<u64> {
        if self.is_done() {
            return None;
        }
        self.cancel_signaled_at_ms.map(|t| t + grace_ms)
    }

    pub fn force_cancelable(&self, grace_ms: u64, now_ms: u64) -> bool {
        self.force_cancel_available_at(grace_ms)
            .is_some_and(|at| now_ms >= at)
    }

    /// Total time from creation to completion (or to `now_ms` while running).
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        let end = if self.is_done() {
            self.status_timestamps.values().last().copied().unwrap_or(now_ms)
        } else {
            now_ms
        };
        end.saturating_sub(self.created_at_ms)
    }

    /// Time spent in each status so far. Terminal statuses are instants and
    /// are not reported.
    pub fn period_report(&self, now_ms: u64) -> PeriodReport {
        let entries: Vec<(RunStatus, u64)> =
            self.status_timestamps.iter().map(|(s, t)| (*s, *t)).collect();
        let mut periods = Vec::with_capacity(entries.len());
        for (i, (status, entered)) in entries.iter().enumerate() {
            let left = match entries.get(i + 1) {
                Some((_, next)) => *next,
                None if status.is_terminal() => break,
                None => now_ms,
            };
            periods.push(StatusPeriod {
                status: *status,
                duration_ms: left.saturating_sub(*entered),
            });
        }
        PeriodReport {
            total_ms: self.elapsed_ms(now_ms),
            periods,
        }
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;

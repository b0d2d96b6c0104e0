// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run service: intake, phase enqueueing, confirmation, cancellation and
//! deletion.
//!
//! Every operation is one conditional transaction keyed on the statuses it
//! read. A caller that lost a race on any replica sees a `Conflict`; a
//! request the run's status does not allow is a `Validation` error.

use crate::authz::{AllowAll, Authorizer};
use crate::bus::{EventFilter, Subscription};
use crate::context::Ctx;
use crate::error::EngineError;
use ot_core::{
    Clock, ConfigVersionId, CreateOptions, Event, ExecutionMode, IdGen, Job, JobId, JobStatus,
    LockHolder, Phase, Run, RunError, RunId, RunStatus, Signal, Table, UserId, Workspace,
    WorkspaceId,
};
use ot_storage::MaterializedState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Criteria for listing runs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFilter {
    pub organization: Option<String>,
    pub workspace_id: Option<WorkspaceId>,
    pub statuses: Vec<RunStatus>,
    pub plan_only: Option<bool>,
}

impl RunFilter {
    fn matches(&self, state: &MaterializedState, run: &Run) -> bool {
        if self
            .workspace_id
            .as_ref()
            .is_some_and(|ws| *ws != run.workspace_id)
        {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&run.status) {
            return false;
        }
        if self.plan_only.is_some_and(|p| p != run.plan_only) {
            return false;
        }
        if let Some(org) = &self.organization {
            let ws_org = state
                .get_workspace(run.workspace_id.as_str())
                .map(|ws| ws.organization.as_str());
            if ws_org != Some(org.as_str()) {
                return false;
            }
        }
        true
    }
}

/// What `cancel` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// Nothing was executing; the run is canceled
    Canceled,
    /// A runner was asked to interrupt; the run finishes when it acknowledges
    /// or the grace period ends
    Signaled,
}

#[derive(Clone)]
pub struct RunService<C: Clock> {
    ctx: Ctx<C>,
    authorizer: Arc<dyn Authorizer>,
}

impl<C: Clock> RunService<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        Self {
            ctx,
            authorizer: Arc::new(AllowAll),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn create(
        &self,
        workspace_id: &WorkspaceId,
        config_version_id: &ConfigVersionId,
        opts: CreateOptions,
    ) -> Result<Run, EngineError> {
        let now = self.ctx.now_ms();
        let id = RunId::generate(&*self.ctx.ids);
        let run = self.ctx.commit(|state| {
            let ws = load_workspace(state, workspace_id)?;
            let cv = state
                .get_config_version(config_version_id.as_str())
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "config version {config_version_id} does not exist"
                    ))
                })?;
            if cv.workspace_id != *workspace_id {
                return Err(EngineError::Validation(format!(
                    "config version {} belongs to workspace {}",
                    cv.id, cv.workspace_id
                )));
            }
            let run = Run::new(id, &ws, cv.id.clone(), cv.speculative, opts, now);
            Ok((vec![run_saved(&run)], run))
        })?;
        info!(
            run_id = %run.id,
            workspace_id = %run.workspace_id,
            plan_only = run.plan_only,
            "run created"
        );
        Ok(run)
    }

    pub fn get(&self, run_id: &RunId) -> Result<Run, EngineError> {
        self.ctx.store.read(|state| load_run(state, run_id))
    }

    /// Matching runs, newest first
    pub fn list(&self, filter: &RunFilter) -> Vec<Run> {
        self.ctx.store.read(|state| {
            let mut runs: Vec<Run> = state
                .runs
                .values()
                .filter(|run| filter.matches(state, run))
                .cloned()
                .collect();
            runs.sort_by(|a, b| {
                (b.created_at_ms, b.id.as_str()).cmp(&(a.created_at_ms, a.id.as_str()))
            });
            runs
        })
    }

    /// `Pending → PlanQueued`: take the workspace lock (unless plan-only) and
    /// queue a plan job.
    pub fn enqueue_plan(&self, run_id: &RunId) -> Result<Run, EngineError> {
        let now = self.ctx.now_ms();
        let ids = self.ctx.ids.clone();
        let run = self.ctx.commit(|state| {
            let mut run = load_run(state, run_id)?;
            if run.execution_mode == ExecutionMode::Local {
                return Err(EngineError::Validation(format!(
                    "run {run_id} executes locally"
                )));
            }
            let mut events = Vec::new();
            if !run.plan_only {
                events.extend(take_lock(state, &run)?);
            }
            run.enqueue_plan(now)?;
            events.push(queue_job(&*ids, &run, Phase::Plan, now));
            events.push(run_saved(&run));
            Ok((events, run))
        })?;
        info!(run_id = %run.id, workspace_id = %run.workspace_id, "plan enqueued");
        Ok(run)
    }

    /// Confirm a planned run. Needs an explicit confirmation unless the run
    /// auto-applies.
    pub async fn apply(
        &self,
        run_id: &RunId,
        confirmed: bool,
        user: Option<&UserId>,
    ) -> Result<Run, EngineError> {
        let run = self.get(run_id)?;
        if !self.authorizer.can_apply(&run, user).await {
            return Err(EngineError::Forbidden(format!("apply of run {run_id}")));
        }
        if !confirmed && !run.auto_apply {
            return Err(EngineError::Validation(format!(
                "run {run_id} requires confirmation to apply"
            )));
        }
        let now = self.ctx.now_ms();
        let ids = self.ctx.ids.clone();
        let run = self.ctx.commit(|state| {
            let mut run = load_run(state, run_id)?;
            let events = enqueue_apply(state, &*ids, &mut run, now)?;
            Ok((events, run))
        })?;
        info!(run_id = %run.id, "apply enqueued");
        Ok(run)
    }

    /// Soft cancel. Runs without an executing job are canceled outright;
    /// an executing job is sent an interrupt.
    pub fn cancel(&self, run_id: &RunId) -> Result<CancelOutcome, EngineError> {
        let now = self.ctx.now_ms();
        let outcome = self.ctx.commit(|state| {
            let mut run = load_run(state, run_id)?;
            if !run.cancelable() {
                return Err(match run.cancel_signaled_at_ms {
                    Some(_) if !run.is_done() => RunError::CancelAlreadySignaled.into(),
                    _ => RunError::NotCancelable(run.status).into(),
                });
            }

            let running = run
                .status
                .phase()
                .filter(|_| run.status.is_executing())
                .and_then(|phase| state.active_job(&run.id, phase))
                .filter(|job| job.status == JobStatus::Running)
                .cloned();
            if let Some(mut job) = running {
                run.signal_cancel(now)?;
                job.signal(Signal::Cancel, now)?;
                return Ok((
                    vec![job_saved(&job), run_saved(&run)],
                    CancelOutcome::Signaled,
                ));
            }

            let mut events = Vec::new();
            for job in state.run_jobs(&run.id) {
                if job.is_done() {
                    continue;
                }
                let mut job = job.clone();
                job.transition(JobStatus::Canceled, now)?;
                events.push(job_saved(&job));
            }
            run.transition(RunStatus::Canceled, now)?;
            events.extend(release_lock(state, &run));
            events.push(run_saved(&run));
            Ok((events, CancelOutcome::Canceled))
        })?;
        info!(run_id = %run_id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    /// Operator force cancel, permitted once a soft cancel has gone
    /// unacknowledged for the grace period.
    pub fn force_cancel(&self, run_id: &RunId) -> Result<Run, EngineError> {
        let now = self.ctx.now_ms();
        let grace = self.ctx.config.grace_ms();
        let run = self.ctx.commit(|state| {
            let run = load_run(state, run_id)?;
            if !run.force_cancelable(grace, now) {
                return Err(RunError::ForceCancelUnavailable.into());
            }
            force_cancel(state, run, "force canceled by operator", now)
        })?;
        info!(run_id = %run_id, "run force canceled");
        Ok(run)
    }

    pub fn discard(&self, run_id: &RunId) -> Result<Run, EngineError> {
        let now = self.ctx.now_ms();
        let run = self.ctx.commit(|state| {
            let mut run = load_run(state, run_id)?;
            run.discard(now)?;
            let mut events = release_lock(state, &run).into_iter().collect::<Vec<_>>();
            events.push(run_saved(&run));
            Ok((events, run))
        })?;
        info!(run_id = %run_id, "run discarded");
        Ok(run)
    }

    /// Delete a run that is pending or finished, with its jobs and logs.
    pub fn delete(&self, run_id: &RunId) -> Result<(), EngineError> {
        self.ctx.commit(|state| {
            let run = load_run(state, run_id)?;
            if !run.is_done() && run.status != RunStatus::Pending {
                return Err(EngineError::Validation(format!(
                    "run {run_id} is {}; cancel it first",
                    run.status
                )));
            }
            Ok((delete_run(state, &run), ()))
        })?;
        info!(run_id = %run_id, "run deleted");
        Ok(())
    }

    /// Live run events. Add criteria to `filter` to narrow it.
    pub fn watch(&self, filter: EventFilter) -> Subscription {
        self.ctx.bus.subscribe(filter.table(Table::Run))
    }
}

// ── Transaction building blocks shared with jobs and sweepers ───────────────

pub(crate) fn load_run(state: &MaterializedState, id: &RunId) -> Result<Run, EngineError> {
    state
        .get_run(id.as_str())
        .cloned()
        .ok_or_else(|| EngineError::not_found(Table::Run, id))
}

pub(crate) fn load_workspace(
    state: &MaterializedState,
    id: &WorkspaceId,
) -> Result<Workspace, EngineError> {
    state
        .get_workspace(id.as_str())
        .cloned()
        .ok_or_else(|| EngineError::not_found(Table::Workspace, id))
}

pub(crate) fn load_job(state: &MaterializedState, id: &JobId) -> Result<Job, EngineError> {
    state
        .get_job(id.as_str())
        .cloned()
        .ok_or_else(|| EngineError::not_found(Table::Job, id))
}

pub(crate) fn run_saved(run: &Run) -> Event {
    Event::RunSaved {
        run: Box::new(run.clone()),
    }
}

pub(crate) fn job_saved(job: &Job) -> Event {
    Event::JobSaved {
        job: Box::new(job.clone()),
    }
}

/// Lock the run's workspace for it. `None` when it already holds the lock.
pub(crate) fn take_lock(state: &MaterializedState, run: &Run) -> Result<Option<Event>, EngineError> {
    let mut ws = load_workspace(state, &run.workspace_id)?;
    let holder = LockHolder::Run(run.id.clone());
    if ws.lock.as_ref() == Some(&holder) {
        return Ok(None);
    }
    ws.lock(holder)?;
    Ok(Some(Event::WorkspaceSaved { workspace: ws }))
}

/// Clear the workspace lock if `run` holds it.
pub(crate) fn release_lock(state: &MaterializedState, run: &Run) -> Option<Event> {
    let mut ws = state.get_workspace(run.workspace_id.as_str())?.clone();
    let holder = LockHolder::Run(run.id.clone());
    if ws.lock.as_ref() != Some(&holder) {
        return None;
    }
    ws.unlock(&holder, false).ok()?;
    Some(Event::WorkspaceSaved { workspace: ws })
}

pub(crate) fn queue_job(ids: &dyn IdGen, run: &Run, phase: Phase, now_ms: u64) -> Event {
    let job = Job::new(JobId::generate(ids), run, phase, now_ms);
    job_saved(&job)
}

/// `Planned → ApplyQueued` with its apply job. The lock is re-taken in case
/// it was cleared while the plan awaited confirmation.
pub(crate) fn enqueue_apply(
    state: &MaterializedState,
    ids: &dyn IdGen,
    run: &mut Run,
    now_ms: u64,
) -> Result<Vec<Event>, EngineError> {
    run.enqueue_apply(now_ms)?;
    let mut events: Vec<Event> = take_lock(state, run)?.into_iter().collect();
    events.push(queue_job(ids, run, Phase::Apply, now_ms));
    events.push(run_saved(run));
    Ok(events)
}

/// Force-cancel `run` and its live jobs and clear its lock, without asking
/// any runner. Returns the events and the updated run.
pub(crate) fn force_cancel(
    state: &MaterializedState,
    mut run: Run,
    reason: &str,
    now_ms: u64,
) -> Result<(Vec<Event>, Run), EngineError> {
    let mut events = Vec::new();
    for job in state.run_jobs(&run.id) {
        if job.is_done() {
            continue;
        }
        let mut job = job.clone();
        if job.status == JobStatus::Running && job.signaled != Some(Signal::ForceCancel) {
            job.signal(Signal::ForceCancel, now_ms)?;
        }
        job.transition(JobStatus::ForceCanceled, now_ms)?;
        job.error = Some(reason.to_string());
        events.push(job_saved(&job));
    }
    run.transition(RunStatus::ForceCanceled, now_ms)?;
    run.error = Some(reason.to_string());
    events.extend(release_lock(state, &run));
    events.push(run_saved(&run));
    Ok((events, run))
}

/// Delete events for a run: jobs first so each is announced, then the run,
/// whose deletion drops its logs.
pub(crate) fn delete_run(state: &MaterializedState, run: &Run) -> Vec<Event> {
    let mut events: Vec<Event> = state
        .run_jobs(&run.id)
        .into_iter()
        .map(|job| Event::JobDeleted { id: job.id.clone() })
        .collect();
    events.extend(release_lock(state, run));
    events.push(Event::RunDeleted { id: run.id.clone() });
    events
}

#[cfg(test)]
#[path = "runs_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job queue, allocator and runner registry.
//!
//! Jobs are claimed with a conditional update (`Unallocated → Allocated`)
//! so exactly one runner wins. Runners then start the job, stream progress
//! and report a result, which advances the run.

use crate::context::Ctx;
use crate::error::EngineError;
use crate::runs::{enqueue_apply, force_cancel, job_saved, load_job, load_run, release_lock, run_saved};
use ot_core::{
    AgentPoolId, Chunk, Clock, Event, Job, JobId, JobStatus, LogKey, Phase, PhaseLog,
    PhaseOutcome, Run, RunStatus, RunnerId, RunnerMeta, RunnerStatus, Signal, Table,
};
use ot_storage::MaterializedState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A started job and the run it executes a phase of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub job: Job,
    pub run: Run,
}

/// Heartbeat from a runner working on a job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Only `Running` may be reported here; terminal statuses go through
    /// `report_result`
    pub status: Option<JobStatus>,
    pub chunk: Option<Chunk>,
}

impl Progress {
    pub fn chunk(chunk: Chunk) -> Self {
        Self {
            status: None,
            chunk: Some(chunk),
        }
    }
}

#[derive(Clone)]
pub struct JobService<C: Clock> {
    ctx: Ctx<C>,
}

impl<C: Clock> JobService<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        Self { ctx }
    }

    pub fn get(&self, id: &JobId) -> Result<Job, EngineError> {
        self.ctx.store.read(|state| load_job(state, id))
    }

    /// Unallocated jobs for `pool` (none = built-in runner), oldest first
    pub fn list_unallocated(&self, pool: Option<&AgentPoolId>) -> Vec<Job> {
        self.ctx
            .store
            .read(|state| state.unallocated_jobs(pool).into_iter().cloned().collect())
    }

    pub fn claim(&self, job_id: &JobId, runner_id: &RunnerId) -> Result<Job, EngineError> {
        let now = self.ctx.now_ms();
        let job = self.ctx.commit(|state| {
            let mut job = load_job(state, job_id)?;
            if job.status != JobStatus::Unallocated {
                return Err(EngineError::Conflict(format!(
                    "job {job_id} already {}",
                    job.status
                )));
            }
            let runner = load_runner(state, runner_id)?;
            if !runner.matches_pool(job.agent_pool_id.as_ref()) {
                return Err(EngineError::Validation(format!(
                    "job {job_id} is not for runner {runner_id}'s pool"
                )));
            }
            if !runner.is_healthy() {
                return Err(EngineError::Conflict(format!(
                    "runner {runner_id} is {}",
                    runner.status
                )));
            }
            if !runner.has_capacity() {
                return Err(EngineError::Conflict(format!(
                    "runner {runner_id} is at capacity"
                )));
            }
            job.allocate(runner_id.clone(), now)?;
            Ok((vec![job_saved(&job)], job))
        })?;
        info!(job_id = %job.id, run_id = %job.run_id, runner = %runner_id, "job claimed");
        Ok(job)
    }

    /// Claim the oldest job this runner may take, if any.
    pub fn claim_next(&self, runner_id: &RunnerId) -> Result<Option<Job>, EngineError> {
        let candidates = self.ctx.store.read(|state| {
            let runner = load_runner(state, runner_id)?;
            if !runner.has_capacity() || !runner.is_healthy() {
                return Ok(Vec::new());
            }
            Ok::<_, EngineError>(
                state
                    .unallocated_jobs(runner.agent_pool_id.as_ref())
                    .into_iter()
                    .map(|job| job.id.clone())
                    .collect::<Vec<_>>(),
            )
        })?;
        for job_id in candidates {
            match self.claim(&job_id, runner_id) {
                Ok(job) => return Ok(Some(job)),
                Err(EngineError::Conflict(reason)) => {
                    debug!(job_id = %job_id, runner = %runner_id, %reason, "claim lost");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// `Allocated → Running`, moving the run into its executing phase.
    pub fn start(&self, job_id: &JobId, runner_id: &RunnerId) -> Result<Assignment, EngineError> {
        let now = self.ctx.now_ms();
        let assignment = self.ctx.commit(|state| {
            let mut job = load_job(state, job_id)?;
            job.start(runner_id, now)?;
            let mut run = load_run(state, &job.run_id)?;
            let phase = run.start_phase(now)?;
            if phase != job.phase {
                return Err(EngineError::invariant(format!(
                    "job {job_id} is for {} but run {} queued {phase}",
                    job.phase, run.id
                )));
            }
            Ok((
                vec![job_saved(&job), run_saved(&run)],
                Assignment { job, run },
            ))
        })?;
        info!(
            job_id = %job_id,
            run_id = %assignment.run.id,
            phase = %assignment.job.phase,
            runner = %runner_id,
            "job started"
        );
        Ok(assignment)
    }

    /// Record a heartbeat and any log output. Returns the interrupt the
    /// runner should deliver to the engine, if one is pending.
    pub fn report_progress(
        &self,
        job_id: &JobId,
        runner_id: &RunnerId,
        progress: Progress,
    ) -> Result<Option<Signal>, EngineError> {
        if let Some(status) = progress.status {
            if status != JobStatus::Running {
                return Err(EngineError::Validation(format!(
                    "progress may only report running, not {status}"
                )));
            }
            let job = self.get(job_id)?;
            if job.status == JobStatus::Allocated {
                self.start(job_id, runner_id)?;
            }
        }

        let now = self.ctx.now_ms();
        self.ctx.commit(|state| {
            let job = load_job(state, job_id)?;
            job.check_runner(runner_id)?;
            let mut events = Vec::new();
            if let Some(runner) = state.get_runner(runner_id.as_str()) {
                let mut runner = runner.clone();
                runner.last_ping_at_ms = now;
                events.push(Event::RunnerSaved { runner });
            }
            if job.is_done() {
                // Force-canceled behind the runner's back; make it stop
                return Ok((events, Some(Signal::ForceCancel)));
            }
            if let Some(chunk) = progress.chunk {
                check_chunk(state, &job, &chunk)?;
                events.push(Event::ChunkAppended { chunk });
            }
            Ok((events, job.signaled))
        })
    }

    /// Final outcome of a job. Advances the run: a successful plan that
    /// auto-applies queues its apply in the same transaction.
    pub fn report_result(
        &self,
        job_id: &JobId,
        runner_id: &RunnerId,
        outcome: PhaseOutcome,
    ) -> Result<Run, EngineError> {
        let now = self.ctx.now_ms();
        let ids = self.ctx.ids.clone();
        let run = self.ctx.commit(|state| {
            let mut job = load_job(state, job_id)?;
            job.check_runner(runner_id)?;
            if job.is_done() {
                return Err(EngineError::Conflict(format!(
                    "job {job_id} already {}",
                    job.status
                )));
            }
            let error = match &outcome {
                PhaseOutcome::Failed { reason } => Some(reason.clone()),
                PhaseOutcome::Succeeded { .. } => None,
            };
            let status = job.finish(error, now)?;
            let mut run = load_run(state, &job.run_id)?;
            if run.status.phase() != Some(job.phase) || !run.status.is_executing() {
                return Err(EngineError::invariant(format!(
                    "job {job_id} finished while run {} is {}",
                    run.id, run.status
                )));
            }

            let mut events = vec![job_saved(&job)];
            match status {
                JobStatus::Canceled => run.transition(RunStatus::Canceled, now)?,
                JobStatus::ForceCanceled => run.transition(RunStatus::ForceCanceled, now)?,
                _ => match job.phase {
                    Phase::Plan => {
                        if run.finish_plan(outcome, now)? {
                            events.extend(enqueue_apply(state, &*ids, &mut run, now)?);
                            return Ok((events, run));
                        }
                    }
                    Phase::Apply => run.finish_apply(outcome, now)?,
                },
            }
            if run.is_done() {
                events.extend(release_lock(state, &run));
            }
            events.push(run_saved(&run));
            Ok((events, run))
        })?;
        info!(
            job_id = %job_id,
            run_id = %run.id,
            status = %run.status,
            "job result reported"
        );
        Ok(run)
    }

    // ── Runner registry ─────────────────────────────────────────────────

    pub fn register(
        &self,
        name: &str,
        pool: Option<AgentPoolId>,
        max_jobs: u32,
    ) -> Result<RunnerMeta, EngineError> {
        let now = self.ctx.now_ms();
        let runner = RunnerMeta::new(RunnerId::generate(&*self.ctx.ids), name, pool, max_jobs, now);
        self.ctx.commit(|_| {
            Ok((
                vec![Event::RunnerSaved {
                    runner: runner.clone(),
                }],
                (),
            ))
        })?;
        info!(runner = %runner.id, name, max_jobs = runner.max_jobs, "runner registered");
        Ok(runner)
    }

    pub fn ping(&self, runner_id: &RunnerId, status: RunnerStatus) -> Result<RunnerMeta, EngineError> {
        let now = self.ctx.now_ms();
        self.ctx.commit(|state| {
            let mut runner = load_runner(state, runner_id)?;
            runner.status = status;
            runner.last_ping_at_ms = now;
            Ok((
                vec![Event::RunnerSaved {
                    runner: runner.clone(),
                }],
                runner,
            ))
        })
    }

    /// Remove a runner, returning its not-yet-running jobs to the queue.
    pub fn deregister(&self, runner_id: &RunnerId) -> Result<(), EngineError> {
        let now = self.ctx.now_ms();
        self.ctx.commit(|state| {
            load_runner(state, runner_id)?;
            let mut events = reallocate_jobs(state, runner_id, now)?;
            events.push(Event::RunnerDeleted {
                id: runner_id.clone(),
            });
            Ok((events, ()))
        })?;
        info!(runner = %runner_id, "runner deregistered");
        Ok(())
    }

    /// Mark runners that stopped pinging as errored and reallocate their
    /// allocated jobs. Returns how many runners were marked.
    pub fn sweep_stale_runners(&self) -> Result<usize, EngineError> {
        let now = self.ctx.now_ms();
        let stale_after = self.ctx.config.runner_stale_after.as_millis() as u64;
        let stale: Vec<RunnerId> = self.ctx.store.read(|state| {
            state
                .runners
                .values()
                .filter(|r| r.is_healthy() && r.is_stale(now, stale_after))
                .map(|r| r.id.clone())
                .collect()
        });
        let mut marked = 0;
        for runner_id in stale {
            let swept = self.ctx.commit(|state| {
                let mut runner = load_runner(state, &runner_id)?;
                if !runner.is_healthy() || !runner.is_stale(now, stale_after) {
                    return Ok((Vec::new(), false));
                }
                runner.status = RunnerStatus::Errored;
                let mut events = reallocate_jobs(state, &runner_id, now)?;
                events.push(Event::RunnerSaved { runner });
                Ok((events, true))
            })?;
            if swept {
                warn!(runner = %runner_id, "runner stopped pinging, marked errored");
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Force-cancel running jobs whose soft cancel went unacknowledged for
    /// the grace period. Returns how many runs were force-canceled.
    pub fn expire_interrupts(&self) -> Result<usize, EngineError> {
        let now = self.ctx.now_ms();
        let grace = self.ctx.config.grace_ms();
        let expired: Vec<JobId> = self.ctx.store.read(|state| {
            state
                .jobs
                .values()
                .filter(|job| grace_expired(job, grace, now))
                .map(|job| job.id.clone())
                .collect()
        });
        let mut canceled = 0;
        for job_id in expired {
            let run = self.ctx.commit(|state| {
                let job = load_job(state, &job_id)?;
                if !grace_expired(&job, grace, now) {
                    return Ok((Vec::new(), None));
                }
                let run = load_run(state, &job.run_id)?;
                let (events, run) =
                    force_cancel(state, run, "runner did not acknowledge cancel", now)?;
                Ok((events, Some(run)))
            })?;
            if let Some(run) = run {
                warn!(job_id = %job_id, run_id = %run.id, "grace period expired, run force canceled");
                canceled += 1;
            }
        }
        Ok(canceled)
    }
}

fn grace_expired(job: &Job, grace_ms: u64, now_ms: u64) -> bool {
    job.status == JobStatus::Running
        && job.signaled == Some(Signal::Cancel)
        && job
            .signaled_at_ms
            .is_some_and(|at| now_ms >= at.saturating_add(grace_ms))
}

fn load_runner(state: &MaterializedState, id: &RunnerId) -> Result<RunnerMeta, EngineError> {
    state
        .get_runner(id.as_str())
        .cloned()
        .ok_or_else(|| EngineError::not_found(Table::Runner, id))
}

fn reallocate_jobs(
    state: &MaterializedState,
    runner_id: &RunnerId,
    now_ms: u64,
) -> Result<Vec<Event>, EngineError> {
    let mut events = Vec::new();
    for job in state.runner_jobs(runner_id.as_str()) {
        if job.status != JobStatus::Allocated {
            continue;
        }
        let mut job = job.clone();
        job.reallocate(now_ms)?;
        info!(job_id = %job.id, runner = %runner_id, "job returned to queue");
        events.push(job_saved(&job));
    }
    Ok(events)
}

/// A chunk must belong to the job's own phase log and continue it exactly.
pub(crate) fn check_chunk(
    state: &MaterializedState,
    job: &Job,
    chunk: &Chunk,
) -> Result<(), EngineError> {
    if chunk.run_id != job.run_id || chunk.phase != job.phase {
        return Err(EngineError::Validation(format!(
            "chunk for {} sent on job {}",
            chunk.log_key(),
            job.id
        )));
    }
    check_append(state, chunk)
}

pub(crate) fn check_append(state: &MaterializedState, chunk: &Chunk) -> Result<(), EngineError> {
    let key: LogKey = chunk.log_key();
    let empty = PhaseLog::default();
    state.log(&key).unwrap_or(&empty).check(chunk)?;
    Ok(())
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;

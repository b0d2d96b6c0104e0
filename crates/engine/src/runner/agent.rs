// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel for remote agents of one pool

use super::{claim_and_start, fetch_config, stronger, RunnerChannel};
use crate::context::Ctx;
use crate::error::EngineError;
use crate::jobs::{Assignment, JobService, Progress};
use async_trait::async_trait;
use ot_core::{
    AgentPoolId, Chunk, Clock, ConfigVersionId, JobId, PhaseOutcome, RunnerId, RunnerMeta,
    RunnerStatus, Signal,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Agents cannot be called back, so interrupts wait in `pending` until the
/// agent's next progress report picks them up.
#[derive(Clone)]
pub struct AgentChannel<C: Clock> {
    ctx: Ctx<C>,
    jobs: JobService<C>,
    pool: AgentPoolId,
    pending: Arc<Mutex<HashMap<JobId, Signal>>>,
}

impl<C: Clock> AgentChannel<C> {
    pub fn new(ctx: Ctx<C>, pool: AgentPoolId) -> Self {
        let jobs = JobService::new(ctx.clone());
        Self {
            ctx,
            jobs,
            pool,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &AgentPoolId {
        &self.pool
    }

    /// Interrupt waiting for `job`'s next heartbeat
    pub fn pending(&self, job: &JobId) -> Option<Signal> {
        self.pending.lock().get(job).copied()
    }

    /// Drop any interrupt queued for a job that has finished. A finished
    /// job's agent is told to stop by the server itself, if it ever calls.
    pub fn forget(&self, job: &JobId) -> bool {
        self.pending.lock().remove(job).is_some()
    }
}

#[async_trait]
impl<C: Clock> RunnerChannel for AgentChannel<C> {
    async fn register(&self, name: &str, max_jobs: u32) -> Result<RunnerMeta, EngineError> {
        self.jobs.register(name, Some(self.pool.clone()), max_jobs)
    }

    async fn ping(&self, runner: &RunnerId, status: RunnerStatus) -> Result<(), EngineError> {
        self.jobs.ping(runner, status).map(|_| ())
    }

    async fn claim_job(
        &self,
        runner: &RunnerId,
        wait: Duration,
    ) -> Result<Option<Assignment>, EngineError> {
        claim_and_start(&self.ctx, &self.jobs, runner, wait).await
    }

    async fn report_progress(
        &self,
        job: &JobId,
        runner: &RunnerId,
        chunk: Option<Chunk>,
    ) -> Result<Option<Signal>, EngineError> {
        let progress = Progress {
            status: None,
            chunk,
        };
        let signaled = self.jobs.report_progress(job, runner, progress)?;
        let pending = self.pending.lock().remove(job);
        Ok(stronger(signaled, pending))
    }

    async fn download_config(&self, cv: &ConfigVersionId) -> Result<Option<Vec<u8>>, EngineError> {
        fetch_config(&self.ctx, cv).await
    }

    async fn report_result(
        &self,
        job: &JobId,
        runner: &RunnerId,
        outcome: PhaseOutcome,
    ) -> Result<(), EngineError> {
        self.pending.lock().remove(job);
        self.jobs.report_result(job, runner, outcome).map(|_| ())
    }

    fn interrupt(&self, job: &JobId, signal: Signal) -> bool {
        let ours = self
            .jobs
            .get(job)
            .is_ok_and(|j| j.agent_pool_id.as_ref() == Some(&self.pool));
        if !ours {
            return false;
        }
        let mut pending = self.pending.lock();
        let current = pending.get(job).copied();
        if let Some(next) = stronger(current, Some(signal)) {
            if Some(next) != current {
                info!(job_id = %job, %signal, pool = %self.pool, "interrupt queued for agent");
            }
            pending.insert(job.clone(), next);
        }
        true
    }

    fn interrupts(&self, _job: &JobId) -> Option<watch::Receiver<Option<Signal>>> {
        None
    }

    async fn deregister(&self, runner: &RunnerId) -> Result<(), EngineError> {
        self.jobs.deregister(runner)
    }
}

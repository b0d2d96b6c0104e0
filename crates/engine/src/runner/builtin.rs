// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process channel for the server's own runner

use super::{claim_and_start, fetch_config, stronger, RunnerChannel};
use crate::context::Ctx;
use crate::error::EngineError;
use crate::jobs::{Assignment, JobService, Progress};
use async_trait::async_trait;
use ot_core::{
    Chunk, Clock, ConfigVersionId, JobId, PhaseOutcome, RunnerId, RunnerMeta, RunnerStatus,
    Signal,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Channel for the built-in runner. Jobs with no agent pool are claimed
/// here, and interrupts reach the engine without waiting for a heartbeat.
#[derive(Clone)]
pub struct BuiltInChannel<C: Clock> {
    ctx: Ctx<C>,
    jobs: JobService<C>,
    inflight: Arc<Mutex<HashMap<JobId, watch::Sender<Option<Signal>>>>>,
}

impl<C: Clock> BuiltInChannel<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        let jobs = JobService::new(ctx.clone());
        Self {
            ctx,
            jobs,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Jobs claimed through this channel and not yet reported
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[async_trait]
impl<C: Clock> RunnerChannel for BuiltInChannel<C> {
    async fn register(&self, name: &str, max_jobs: u32) -> Result<RunnerMeta, EngineError> {
        self.jobs.register(name, None, max_jobs)
    }

    async fn ping(&self, runner: &RunnerId, status: RunnerStatus) -> Result<(), EngineError> {
        self.jobs.ping(runner, status).map(|_| ())
    }

    async fn claim_job(
        &self,
        runner: &RunnerId,
        wait: Duration,
    ) -> Result<Option<Assignment>, EngineError> {
        let assignment = claim_and_start(&self.ctx, &self.jobs, runner, wait).await?;
        if let Some(assignment) = &assignment {
            let (tx, _) = watch::channel(assignment.job.signaled);
            self.inflight.lock().insert(assignment.job.id.clone(), tx);
        }
        Ok(assignment)
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
        self.jobs.report_progress(job, runner, progress)
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
        // Closes the operation's interrupt stream whatever the outcome
        self.inflight.lock().remove(job);
        self.jobs.report_result(job, runner, outcome).map(|_| ())
    }

    fn interrupt(&self, job: &JobId, signal: Signal) -> bool {
        let inflight = self.inflight.lock();
        let Some(tx) = inflight.get(job) else {
            return false;
        };
        let raised = tx.send_if_modified(|current| {
            let next = stronger(*current, Some(signal));
            let changed = next != *current;
            *current = next;
            changed
        });
        if raised {
            info!(job_id = %job, %signal, "interrupt pushed to built-in runner");
        }
        true
    }

    fn interrupts(&self, job: &JobId) -> Option<watch::Receiver<Option<Signal>>> {
        self.inflight.lock().get(job).map(|tx| tx.subscribe())
    }

    async fn deregister(&self, runner: &RunnerId) -> Result<(), EngineError> {
        self.jobs.deregister(runner)
    }
}

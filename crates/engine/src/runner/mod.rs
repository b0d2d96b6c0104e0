// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runners: the claim, execute, report side of the job protocol.
//!
//! A runner talks to the server through a [`RunnerChannel`]. The built-in
//! runner uses [`BuiltInChannel`], which pushes interrupts in-process the
//! moment they are requested. Agents use [`AgentChannel`], which hands
//! interrupts back on the response to their next progress report.

mod agent;
mod builtin;
mod claim_loop;
mod dispatch;
mod operation;

pub use agent::AgentChannel;
pub use builtin::BuiltInChannel;
pub use claim_loop::{LoopState, RunnerLoop};
pub use dispatch::InterruptRouter;

use crate::bus::EventFilter;
use crate::context::Ctx;
use crate::error::EngineError;
use crate::jobs::{Assignment, JobService};
use async_trait::async_trait;
use ot_core::{
    Chunk, Clock, ConfigVersionId, JobId, PhaseOutcome, RunnerId, RunnerMeta, RunnerStatus,
    Signal, Table,
};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Control path between one runner and the server
#[async_trait]
pub trait RunnerChannel: Clone + Send + Sync + 'static {
    async fn register(&self, name: &str, max_jobs: u32) -> Result<RunnerMeta, EngineError>;

    async fn ping(&self, runner: &RunnerId, status: RunnerStatus) -> Result<(), EngineError>;

    /// Claim and start the next job for `runner`, waiting up to `wait` for
    /// one to appear. `Ok(None)` means the wait elapsed.
    async fn claim_job(
        &self,
        runner: &RunnerId,
        wait: Duration,
    ) -> Result<Option<Assignment>, EngineError>;

    /// Heartbeat with optional log output. Returns the interrupt the engine
    /// should receive, if any.
    async fn report_progress(
        &self,
        job: &JobId,
        runner: &RunnerId,
        chunk: Option<Chunk>,
    ) -> Result<Option<Signal>, EngineError>;

    /// Tarball to unpack before executing a phase of a run created from
    /// `cv`. `Ok(None)` when the version carries no content.
    async fn download_config(&self, cv: &ConfigVersionId) -> Result<Option<Vec<u8>>, EngineError>;

    async fn report_result(
        &self,
        job: &JobId,
        runner: &RunnerId,
        outcome: PhaseOutcome,
    ) -> Result<(), EngineError>;

    /// Queue `signal` for the runner executing `job`. Returns whether this
    /// channel carries that job.
    fn interrupt(&self, job: &JobId, signal: Signal) -> bool;

    /// Interrupts pushed for `job` outside of progress reports. Channels
    /// without a push path return `None`.
    fn interrupts(&self, job: &JobId) -> Option<watch::Receiver<Option<Signal>>>;

    async fn deregister(&self, runner: &RunnerId) -> Result<(), EngineError>;
}

/// The more severe of two interrupts
pub fn stronger(a: Option<Signal>, b: Option<Signal>) -> Option<Signal> {
    match (a, b) {
        (Some(Signal::ForceCancel), _) | (_, Some(Signal::ForceCancel)) => {
            Some(Signal::ForceCancel)
        }
        (Some(Signal::Cancel), _) | (_, Some(Signal::Cancel)) => Some(Signal::Cancel),
        (None, None) => None,
    }
}

/// Bytes behind a configuration version's artifact handle
pub(crate) async fn fetch_config<C: Clock>(
    ctx: &Ctx<C>,
    cv: &ConfigVersionId,
) -> Result<Option<Vec<u8>>, EngineError> {
    let artifact = ctx.store.read(|state| {
        state
            .get_config_version(cv.as_str())
            .map(|cv| cv.artifact.clone())
            .ok_or_else(|| EngineError::not_found(Table::ConfigVersion, cv))
    })?;
    let Some(artifact) = artifact else {
        return Ok(None);
    };
    match ctx.artifacts.fetch(&artifact).await? {
        Some(bytes) => Ok(Some(bytes)),
        None => Err(EngineError::NotFound(format!("artifact {artifact} of {cv}"))),
    }
}

/// Claim then start the oldest job `runner` may take, sleeping on job
/// events between attempts until `wait` elapses.
///
/// Claim and start run back to back with no await between them, so a
/// caller dropping this future never strands a claimed job.
pub(crate) async fn claim_and_start<C: Clock>(
    ctx: &Ctx<C>,
    jobs: &JobService<C>,
    runner: &RunnerId,
    wait: Duration,
) -> Result<Option<Assignment>, EngineError> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut events = ctx.bus.subscribe(EventFilter::all().table(Table::Job));
    loop {
        if let Some(job) = jobs.claim_next(runner)? {
            match jobs.start(&job.id, runner) {
                Ok(assignment) => return Ok(Some(assignment)),
                Err(EngineError::Conflict(reason)) => {
                    // Canceled between claim and start
                    debug!(job_id = %job.id, runner = %runner, %reason, "claimed job not started");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

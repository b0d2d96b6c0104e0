// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner claim loop.
//!
//! ```text
//!            ┌──────────── job done / ping ────────────┐
//!            ▼                                          │
//!   ──▶ Polling ── claimed ──▶ Dispatching ──▶ Polling ─┘
//!         │  ▲
//!   error │  │ delay elapsed
//!         ▼  │
//!        Backoff
//!
//!   any state ── shutdown ──▶ Draining ──▶ Stopped
//! ```
//!
//! The claim itself blocks for up to `claim_poll_timeout`, so an idle
//! runner makes one request per poll period rather than spinning.

use super::operation::Operation;
use super::RunnerChannel;
use crate::config::{Backoff, EngineConfig};
use crate::jobs::Assignment;
use ot_adapters::EngineAdapter;
use ot_core::{JobId, PhaseOutcome, RunnerId, RunnerMeta, RunnerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Polling,
    Dispatching(Box<Assignment>),
    Backoff(Duration),
    Draining,
    Stopped,
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Polling => "polling",
            LoopState::Dispatching(_) => "dispatching",
            LoopState::Backoff(_) => "backoff",
            LoopState::Draining => "draining",
            LoopState::Stopped => "stopped",
        }
    }
}

/// Claims jobs through a channel and executes them on an engine, up to
/// `max_jobs` at once.
pub struct RunnerLoop<R, E> {
    channel: R,
    engine: E,
    name: String,
    max_jobs: u32,
    config: Arc<EngineConfig>,
    shutdown: CancellationToken,
    state: watch::Sender<&'static str>,
}

impl<R: RunnerChannel, E: EngineAdapter> RunnerLoop<R, E> {
    pub fn new(
        channel: R,
        engine: E,
        name: impl Into<String>,
        max_jobs: u32,
        config: Arc<EngineConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Polling.name());
        Self {
            channel,
            engine,
            name: name.into(),
            max_jobs: max_jobs.max(1),
            config,
            shutdown,
            state,
        }
    }

    /// Name of the state the loop is in, updated on every transition
    pub fn states(&self) -> watch::Receiver<&'static str> {
        self.state.subscribe()
    }

    /// Register, then claim and execute jobs until shutdown. In-flight
    /// operations are soft-interrupted and awaited before deregistering.
    pub async fn run(self) {
        let Some(runner) = self.register().await else {
            self.state.send_replace(LoopState::Stopped.name());
            return;
        };
        info!(runner = %runner.id, name = %self.name, max_jobs = self.max_jobs, "runner started");

        let drain = CancellationToken::new();
        let mut ops: JoinSet<(JobId, PhaseOutcome)> = JoinSet::new();
        let mut backoff = Backoff::from_config(&self.config);
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = LoopState::Polling;

        loop {
            self.state.send_replace(state.name());
            state = match state {
                LoopState::Polling => {
                    while let Some(done) = ops.try_join_next() {
                        reap(done);
                    }
                    if self.shutdown.is_cancelled() {
                        LoopState::Draining
                    } else if ops.len() >= self.max_jobs as usize {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => LoopState::Draining,
                            Some(done) = ops.join_next() => {
                                reap(done);
                                LoopState::Polling
                            }
                            _ = ping.tick() => {
                                self.ping(&runner.id, ops.len()).await;
                                LoopState::Polling
                            }
                        }
                    } else {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => LoopState::Draining,
                            _ = ping.tick() => {
                                self.ping(&runner.id, ops.len()).await;
                                LoopState::Polling
                            }
                            claimed = self.channel.claim_job(&runner.id, self.config.claim_poll_timeout) => {
                                match claimed {
                                    Ok(Some(assignment)) => {
                                        backoff.reset();
                                        LoopState::Dispatching(Box::new(assignment))
                                    }
                                    Ok(None) => {
                                        backoff.reset();
                                        LoopState::Polling
                                    }
                                    Err(e) => {
                                        let delay = backoff.next_delay();
                                        if e.is_retryable() {
                                            warn!(runner = %runner.id, error = %e, ?delay, "claim failed");
                                        } else {
                                            error!(runner = %runner.id, error = %e, ?delay, "claim rejected");
                                        }
                                        LoopState::Backoff(delay)
                                    }
                                }
                            }
                        }
                    }
                }
                LoopState::Dispatching(assignment) => {
                    let operation = Operation {
                        channel: self.channel.clone(),
                        engine: self.engine.clone(),
                        runner: runner.id.clone(),
                        assignment: *assignment,
                        config: Arc::clone(&self.config),
                        shutdown: drain.clone(),
                    };
                    debug!(runner = %runner.id, job_id = %operation.job_id(), "dispatching");
                    ops.spawn(async move {
                        let job_id = operation.job_id().clone();
                        let outcome = operation.run().await;
                        (job_id, outcome)
                    });
                    LoopState::Polling
                }
                LoopState::Backoff(delay) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => LoopState::Draining,
                        _ = tokio::time::sleep(delay) => LoopState::Polling,
                    }
                }
                LoopState::Draining => {
                    if !ops.is_empty() {
                        info!(runner = %runner.id, inflight = ops.len(), "interrupting in-flight jobs");
                    }
                    drain.cancel();
                    while let Some(done) = ops.join_next().await {
                        reap(done);
                    }
                    if let Err(e) = self.channel.deregister(&runner.id).await {
                        warn!(runner = %runner.id, error = %e, "deregister failed");
                    }
                    LoopState::Stopped
                }
                LoopState::Stopped => break,
            };
        }
        info!(runner = %runner.id, "runner stopped");
    }

    /// Register with backoff. Returns `None` if shut down first.
    async fn register(&self) -> Option<RunnerMeta> {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            match self.channel.register(&self.name, self.max_jobs).await {
                Ok(runner) => return Some(runner),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(name = %self.name, error = %e, ?delay, "runner registration failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn ping(&self, runner: &RunnerId, inflight: usize) {
        let status = if inflight == 0 {
            RunnerStatus::Idle
        } else {
            RunnerStatus::Busy
        };
        if let Err(e) = self.channel.ping(runner, status).await {
            warn!(runner = %runner, error = %e, "ping failed");
        }
    }
}

fn reap(done: Result<(JobId, PhaseOutcome), tokio::task::JoinError>) {
    match done {
        Ok((job_id, outcome)) => debug!(job_id = %job_id, ?outcome, "operation done"),
        Err(e) => error!(error = %e, "operation task failed"),
    }
}

#[cfg(test)]
#[path = "claim_loop_tests.rs"]
mod tests;

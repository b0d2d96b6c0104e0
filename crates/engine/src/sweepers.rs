// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background sweeps over the whole store.
//!
//! The timeout and retention sweepers are cluster singletons: each scan
//! first takes or renews a store lease, and a replica that does not hold
//! it skips the pass. The watchdog is idempotent and runs everywhere.

use crate::config::EngineConfig;
use crate::context::Ctx;
use crate::error::EngineError;
use crate::jobs::JobService;
use crate::runs::{delete_run, force_cancel, load_run};
use ot_core::{Clock, ConfigVersionId, Event, Run, RunId, RunStatus};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const TIMEOUT_LEASE: &str = "sweeper:timeout";
pub const RETENTION_LEASE: &str = "sweeper:retention";

/// Force-cancels runs stuck in a phase past its timeout
#[derive(Clone)]
pub struct TimeoutSweeper<C: Clock> {
    ctx: Ctx<C>,
}

impl<C: Clock> TimeoutSweeper<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.ctx.config.timeout_scan_interval;
        singleton(&self.ctx, TIMEOUT_LEASE, interval, cancel, || self.sweep_once()).await;
    }

    /// One pass. Returns how many runs were force-canceled.
    pub fn sweep_once(&self) -> Result<usize, EngineError> {
        let now = self.ctx.now_ms();
        let config = &self.ctx.config;
        let overdue: Vec<RunId> = self.ctx.store.read(|state| {
            state
                .runs
                .values()
                .filter(|run| timed_out(run, config, now).is_some())
                .map(|run| run.id.clone())
                .collect()
        });

        let mut canceled = 0;
        for run_id in overdue {
            let run = self.ctx.commit(|state| {
                let run = load_run(state, &run_id)?;
                let Some(limit) = timed_out(&run, config, now) else {
                    return Ok((Vec::new(), None));
                };
                let reason = format!("{} exceeded timeout of {}s", run.status, limit.as_secs());
                let (events, run) = force_cancel(state, run, &reason, now)?;
                Ok((events, Some(run)))
            })?;
            if let Some(run) = run {
                warn!(run_id = %run.id, workspace_id = %run.workspace_id, "run timed out, force canceled");
                canceled += 1;
            }
        }
        Ok(canceled)
    }
}

/// The phase timeout `run` has exceeded, if any
fn timed_out(run: &Run, config: &EngineConfig, now_ms: u64) -> Option<Duration> {
    let phase = match run.status {
        RunStatus::Planning | RunStatus::Applying => run.status.phase()?,
        _ => return None,
    };
    let limit = config.phase_timeout(phase);
    if limit.is_zero() {
        return None;
    }
    let started = run.timestamp(run.status)?;
    (now_ms.saturating_sub(started) >= limit.as_millis() as u64).then_some(limit)
}

/// Deletes finished runs and unused config versions past their age
#[derive(Clone)]
pub struct RetentionSweeper<C: Clock> {
    ctx: Ctx<C>,
}

/// What one retention pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retained {
    pub runs: usize,
    pub config_versions: usize,
}

impl<C: Clock> RetentionSweeper<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.ctx.config.retention_scan_interval;
        singleton(&self.ctx, RETENTION_LEASE, interval, cancel, || {
            self.sweep_once().map(|r| r.runs + r.config_versions)
        })
        .await;
    }

    /// One pass. Runs go first so the config versions they held can be
    /// collected in the same pass.
    pub fn sweep_once(&self) -> Result<Retained, EngineError> {
        let now = self.ctx.now_ms();
        let mut retained = Retained::default();

        let run_age = self.ctx.config.run_retention.as_millis() as u64;
        if run_age > 0 {
            let expired: Vec<RunId> = self.ctx.store.read(|state| {
                state
                    .runs
                    .values()
                    .filter(|run| run.is_done() && now.saturating_sub(run.created_at_ms) >= run_age)
                    .map(|run| run.id.clone())
                    .collect()
            });
            for run_id in expired {
                let deleted = self.ctx.commit(|state| {
                    let Some(run) = state.get_run(run_id.as_str()) else {
                        return Ok((Vec::new(), false));
                    };
                    Ok((delete_run(state, run), true))
                })?;
                if deleted {
                    debug!(run_id = %run_id, "run expired");
                    retained.runs += 1;
                }
            }
        }

        let cv_age = self.ctx.config.config_version_retention.as_millis() as u64;
        if cv_age > 0 {
            let expired: Vec<ConfigVersionId> = self.ctx.store.read(|state| {
                state
                    .config_versions
                    .values()
                    .filter(|cv| now.saturating_sub(cv.created_at_ms) >= cv_age)
                    .map(|cv| cv.id.clone())
                    .collect()
            });
            for cv_id in expired {
                let deleted = self.ctx.commit(|state| {
                    if state.get_config_version(cv_id.as_str()).is_none()
                        || state.config_version_in_use(cv_id.as_str())
                    {
                        return Ok((Vec::new(), false));
                    }
                    Ok((vec![Event::ConfigVersionDeleted { id: cv_id.clone() }], true))
                })?;
                if deleted {
                    debug!(config_version_id = %cv_id, "config version expired");
                    retained.config_versions += 1;
                }
            }
        }

        if retained != Retained::default() {
            info!(
                runs = retained.runs,
                config_versions = retained.config_versions,
                "retention sweep"
            );
        }
        Ok(retained)
    }
}

/// Expires unacknowledged cancels and errors out silent runners
#[derive(Clone)]
pub struct Watchdog<C: Clock> {
    ctx: Ctx<C>,
    jobs: JobService<C>,
}

impl<C: Clock> Watchdog<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        let jobs = JobService::new(ctx.clone());
        Self { ctx, jobs }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.ctx.config.watchdog_interval;
        if interval.is_zero() {
            return;
        }
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.check_once() {
                warn!(error = %e, "watchdog pass failed");
            }
        }
    }

    pub fn check_once(&self) -> Result<(), EngineError> {
        self.jobs.expire_interrupts()?;
        self.jobs.sweep_stale_runners()?;
        Ok(())
    }
}

/// Call `pass` every `interval` while this replica holds lease `name`. A
/// zero interval disables the loop. The lease is released on the way out.
async fn singleton<C: Clock>(
    ctx: &Ctx<C>,
    name: &str,
    interval: Duration,
    cancel: CancellationToken,
    mut pass: impl FnMut() -> Result<usize, EngineError>,
) {
    if interval.is_zero() {
        debug!(sweeper = name, "disabled");
        return;
    }
    let ttl_ms = EngineConfig::lease_ttl(interval).as_millis() as u64;
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut holding = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let held = match ctx
            .store
            .try_acquire_lease(name, &ctx.replica, ttl_ms, ctx.now_ms())
        {
            Ok(held) => held,
            Err(e) => {
                warn!(sweeper = name, error = %e, "lease check failed");
                continue;
            }
        };
        if held != holding {
            info!(sweeper = name, replica = %ctx.replica, held, "lease changed hands");
            holding = held;
        }
        if !held {
            continue;
        }
        match pass() {
            Ok(0) => {}
            Ok(count) => debug!(sweeper = name, count, "sweep done"),
            Err(e) if e.is_retryable() => warn!(sweeper = name, error = %e, "sweep failed"),
            Err(e) => error!(sweeper = name, error = %e, "sweep failed"),
        }
    }
    if holding {
        if let Err(e) = ctx.store.release_lease(name, &ctx.replica) {
            warn!(sweeper = name, error = %e, "lease release failed");
        }
    }
}

#[cfg(test)]
#[path = "sweepers_tests.rs"]
mod tests;

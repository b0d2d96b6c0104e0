// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Route interrupts recorded in the store to the channel carrying the job.

use super::{AgentChannel, BuiltInChannel, RunnerChannel};
use crate::bus::EventFilter;
use crate::context::Ctx;
use ot_core::{AgentPoolId, Clock, ClusterEvent, Job, JobStatus, Payload, Signal, Table};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Watches job changes, local and relayed, and hands each new interrupt to
/// the replica's channel for the job's pool. A job with no pool belongs to
/// the built-in runner.
#[derive(Clone)]
pub struct InterruptRouter<C: Clock> {
    builtin: Option<BuiltInChannel<C>>,
    agents: Arc<Mutex<HashMap<AgentPoolId, AgentChannel<C>>>>,
}

impl<C: Clock> InterruptRouter<C> {
    pub fn new(builtin: Option<BuiltInChannel<C>>) -> Self {
        Self {
            builtin,
            agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The channel for `pool`, created on first use
    pub fn agent_channel(&self, ctx: &Ctx<C>, pool: &AgentPoolId) -> AgentChannel<C> {
        self.agents
            .lock()
            .entry(pool.clone())
            .or_insert_with(|| AgentChannel::new(ctx.clone(), pool.clone()))
            .clone()
    }

    /// Deliver the interrupt `job` now carries, if any. Returns whether a
    /// channel on this replica took it.
    pub fn route(&self, job: &Job) -> bool {
        if let Some(pool) = &job.agent_pool_id {
            let channel = self.agents.lock().get(pool).cloned();
            let Some(channel) = channel else {
                return false;
            };
            if job.is_done() {
                if channel.forget(&job.id) {
                    debug!(job_id = %job.id, pool = %pool, "dropped interrupt for finished job");
                }
                return false;
            }
            return pending_signal(job).is_some_and(|signal| channel.interrupt(&job.id, signal));
        }
        let Some(signal) = pending_signal(job) else {
            return false;
        };
        self.builtin
            .as_ref()
            .is_some_and(|channel| channel.interrupt(&job.id, signal))
    }

    pub async fn run(self, ctx: Ctx<C>, cancel: CancellationToken) {
        let mut events = ctx.bus.subscribe(EventFilter::all().table(Table::Job));
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let job = match event {
                Some(ClusterEvent {
                    payload: Some(Payload::Job(job)),
                    ..
                }) => job,
                Some(_) => continue,
                None => break,
            };
            if self.route(&job) {
                debug!(job_id = %job.id, "interrupt routed");
            }
        }
    }
}

/// Interrupt a runner must act on for a job in this state
fn pending_signal(job: &Job) -> Option<Signal> {
    match job.status {
        JobStatus::ForceCanceled => Some(Signal::ForceCancel),
        JobStatus::Running => job.signaled,
        _ => None,
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;

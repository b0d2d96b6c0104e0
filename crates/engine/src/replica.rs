// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One server replica: services plus the background tasks that drive them.
//!
//! Several replicas may share a store. Each relays the others' changes onto
//! its own bus, so schedulers and tailers see every mutation regardless of
//! which replica made it.

use crate::authz::Authorizer;
use crate::context::Ctx;
use crate::jobs::JobService;
use crate::logs::LogService;
use crate::relay::Relay;
use crate::runner::{AgentChannel, BuiltInChannel, InterruptRouter, RunnerLoop};
use crate::runs::RunService;
use crate::scheduler::Scheduler;
use crate::sweepers::{RetentionSweeper, TimeoutSweeper, Watchdog};
use crate::workspaces::WorkspaceService;
use ot_adapters::EngineAdapter;
use ot_core::{AgentPoolId, Clock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Replica<C: Clock> {
    pub ctx: Ctx<C>,
    pub runs: RunService<C>,
    pub jobs: JobService<C>,
    pub logs: LogService<C>,
    pub workspaces: WorkspaceService<C>,
    router: InterruptRouter<C>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    runner: Option<BuiltInRunner>,
}

/// Cloneable view of a running replica's services
#[derive(Clone)]
pub struct ReplicaHandle<C: Clock> {
    pub ctx: Ctx<C>,
    pub runs: RunService<C>,
    pub jobs: JobService<C>,
    pub logs: LogService<C>,
    pub workspaces: WorkspaceService<C>,
    router: InterruptRouter<C>,
}

impl<C: Clock> ReplicaHandle<C> {
    /// Same channel `Replica::agent_channel` returns for `pool`
    pub fn agent_channel(&self, pool: &AgentPoolId) -> AgentChannel<C> {
        self.router.agent_channel(&self.ctx, pool)
    }
}

struct BuiltInRunner {
    shutdown: CancellationToken,
    state: watch::Receiver<&'static str>,
    handle: JoinHandle<()>,
}

impl<C: Clock> Replica<C> {
    /// Start every background task. The built-in runner executes phases on
    /// `engine` when enabled in the config.
    pub fn start<E: EngineAdapter>(
        ctx: Ctx<C>,
        engine: E,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let cancel = CancellationToken::new();
        // Subscribe before anything else can commit
        let relay = Relay::new(ctx.clone());

        let runs = RunService::new(ctx.clone()).with_authorizer(authorizer);
        let builtin = ctx
            .config
            .builtin_runner
            .then(|| BuiltInChannel::new(ctx.clone()));
        let router = InterruptRouter::new(builtin.clone());

        let mut tasks = Vec::new();
        tasks.push(("relay", tokio::spawn(relay.run(cancel.child_token()))));
        tasks.push((
            "scheduler",
            tokio::spawn(Scheduler::new(ctx.clone(), runs.clone(), cancel.child_token()).run()),
        ));
        tasks.push((
            "interrupts",
            tokio::spawn(router.clone().run(ctx.clone(), cancel.child_token())),
        ));
        tasks.push((
            "watchdog",
            tokio::spawn(Watchdog::new(ctx.clone()).run(cancel.child_token())),
        ));
        tasks.push((
            "timeout sweeper",
            tokio::spawn(TimeoutSweeper::new(ctx.clone()).run(cancel.child_token())),
        ));
        tasks.push((
            "retention sweeper",
            tokio::spawn(RetentionSweeper::new(ctx.clone()).run(cancel.child_token())),
        ));

        let runner = builtin.map(|channel| {
            let shutdown = cancel.child_token();
            let runner = RunnerLoop::new(
                channel,
                engine,
                format!("{}-builtin", ctx.replica),
                ctx.config.builtin_max_jobs,
                Arc::clone(&ctx.config),
                shutdown.clone(),
            );
            let state = runner.states();
            BuiltInRunner {
                shutdown,
                state,
                handle: tokio::spawn(runner.run()),
            }
        });

        info!(
            replica = %ctx.replica,
            builtin_runner = runner.is_some(),
            "replica started"
        );
        Self {
            jobs: JobService::new(ctx.clone()),
            logs: LogService::new(ctx.clone()),
            workspaces: WorkspaceService::new(ctx.clone()),
            runs,
            router,
            cancel,
            tasks,
            runner,
            ctx,
        }
    }

    /// Control channel for agents of `pool` connecting to this replica
    pub fn agent_channel(&self, pool: &AgentPoolId) -> AgentChannel<C> {
        self.router.agent_channel(&self.ctx, pool)
    }

    /// Services of this replica for request handlers that outlive a borrow
    pub fn handle(&self) -> ReplicaHandle<C> {
        ReplicaHandle {
            ctx: self.ctx.clone(),
            runs: self.runs.clone(),
            jobs: self.jobs.clone(),
            logs: self.logs.clone(),
            workspaces: self.workspaces.clone(),
            router: self.router.clone(),
        }
    }

    /// State of the built-in runner's claim loop, if it runs here
    pub fn runner_state(&self) -> Option<&'static str> {
        self.runner.as_ref().map(|r| *r.state.borrow())
    }

    /// Stop the built-in runner first so in-flight phases can report, then
    /// everything else.
    pub async fn shutdown(self) {
        if let Some(runner) = self.runner {
            runner.shutdown.cancel();
            if let Err(e) = runner.handle.await {
                warn!(error = %e, "built-in runner task failed");
            }
        }
        self.cancel.cancel();
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "task failed");
            }
        }
        info!(replica = %self.ctx.replica, "replica stopped");
    }
}

#[cfg(test)]
#[path = "replica_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-workspace scheduling reactors.
//!
//! Each workspace gets its own task that handles kicks one at a time;
//! workspaces never wait on each other. A kick re-reads the workspace from
//! the store, so duplicated or stale events only cause a redundant pass.

use crate::bus::EventFilter;
use crate::config::Backoff;
use crate::context::Ctx;
use crate::error::EngineError;
use crate::runs::{load_workspace, RunService};
use ot_core::{
    ChangeKind, Clock, ClusterEvent, Event, ExecutionMode, LockHolder, RunId, RunStatus, Table,
    WorkspaceId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Reactor {
    kick: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Scheduler<C: Clock> {
    ctx: Ctx<C>,
    runs: RunService<C>,
    reactors: Arc<Mutex<HashMap<WorkspaceId, Reactor>>>,
    cancel: CancellationToken,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(ctx: Ctx<C>, runs: RunService<C>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            runs,
            reactors: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        }
    }

    /// Route bus events to reactors until cancelled, then stop them all.
    pub async fn run(self) {
        let mut events = self
            .ctx
            .bus
            .subscribe(EventFilter::all().table(Table::Run).table(Table::Workspace));
        self.seed();

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.route(&event),
                None => break,
            }
        }

        let reactors: Vec<Reactor> = self.reactors.lock().drain().map(|(_, r)| r).collect();
        for reactor in reactors {
            drop(reactor.kick);
            if let Err(e) = reactor.handle.await {
                warn!(error = %e, "reactor task failed");
            }
        }
        debug!(replica = %self.ctx.replica, "scheduler stopped");
    }

    /// Kick every workspace with unfinished runs, oldest run first, so
    /// scheduling resumes after a restart.
    fn seed(&self) {
        let workspaces: Vec<WorkspaceId> = self.ctx.store.read(|state| {
            let mut seen = Vec::new();
            for run in state.incomplete_runs() {
                if !seen.contains(&run.workspace_id) {
                    seen.push(run.workspace_id.clone());
                }
            }
            seen
        });
        info!(workspaces = workspaces.len(), "scheduler seeded");
        for ws in workspaces {
            self.kick(&ws);
        }
    }

    fn route(&self, event: &ClusterEvent) {
        match (event.table, event.kind) {
            (Table::Workspace, ChangeKind::Deleted) => {
                if let Some(reactor) = self
                    .reactors
                    .lock()
                    .remove(&WorkspaceId::new(event.id.as_str())) {
                    reactor.handle.abort();
                }
            }
            (Table::Workspace, _) => self.kick(&WorkspaceId::new(event.id.as_str())),
            (Table::Run, _) => {
                let Some(run) = event.run() else { return };
                if run.status == RunStatus::Pending || run.is_done() {
                    self.kick(&run.workspace_id);
                }
            }
            _ => {}
        }
    }

    /// Ask the workspace's reactor for a pass, starting it if needed. A kick
    /// while one is already pending is absorbed by it.
    pub fn kick(&self, ws: &WorkspaceId) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut reactors = self.reactors.lock();
        if let Some(reactor) = reactors.get(ws) {
            match reactor.kick.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => return,
                Err(TrySendError::Closed(())) => {}
            }
        }
        let (kick, kicks) = mpsc::channel(1);
        let _ = kick.try_send(());
        let handle = tokio::spawn(react(
            self.ctx.clone(),
            self.runs.clone(),
            ws.clone(),
            kicks,
            self.cancel.clone(),
        ));
        reactors.insert(ws.clone(), Reactor { kick, handle });
    }

    pub fn reactor_count(&self) -> usize {
        self.reactors.lock().len()
    }
}

async fn react<C: Clock>(
    ctx: Ctx<C>,
    runs: RunService<C>,
    ws: WorkspaceId,
    mut kicks: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::from_config(&ctx.config);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            kick = kicks.recv() => if kick.is_none() { return },
        }
        loop {
            match schedule_workspace(&ctx, &runs, &ws) {
                Ok(()) => {
                    backoff.reset();
                    break;
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    debug!(workspace_id = %ws, error = %e, ?delay, "scheduling retry");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(workspace_id = %ws, error = %e, "scheduling failed");
                    break;
                }
            }
        }
    }
}

/// One scheduling pass over a workspace.
///
/// Clears a lock left by a finished run, queues pending plan-only runs
/// (they never take the lock), then queues the oldest pending run if the
/// lock is free.
pub fn schedule_workspace<C: Clock>(
    ctx: &Ctx<C>,
    runs: &RunService<C>,
    ws: &WorkspaceId,
) -> Result<(), EngineError> {
    let Some(holder) = ctx.store.read(|state| {
        state
            .get_workspace(ws.as_str())
            .map(|w| w.lock.clone())
    }) else {
        return Ok(());
    };
    if let Some(LockHolder::Run(run_id)) = holder {
        release_finished_lock(ctx, ws, &run_id)?;
    }

    let (speculative, next) = ctx.store.read(|state| {
        let mut speculative: Vec<RunId> = Vec::new();
        let mut next = None;
        for run in state.workspace_runs(ws.as_str()) {
            if run.status != RunStatus::Pending || run.execution_mode == ExecutionMode::Local {
                continue;
            }
            if run.plan_only {
                speculative.push(run.id.clone());
            } else if next.is_none() {
                next = Some(run.id.clone());
            }
        }
        let free = state
            .get_workspace(ws.as_str())
            .is_some_and(|w| !w.is_locked());
        (speculative, next.filter(|_| free))
    });

    for run_id in speculative.iter().chain(next.iter()) {
        match runs.enqueue_plan(run_id) {
            Ok(_) => {}
            // Canceled or discarded since the read; its event kicks us again
            Err(EngineError::Validation(reason)) => {
                debug!(workspace_id = %ws, run_id = %run_id, %reason, "run no longer pending");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn release_finished_lock<C: Clock>(
    ctx: &Ctx<C>,
    ws: &WorkspaceId,
    run_id: &RunId,
) -> Result<(), EngineError> {
    let released = ctx.commit(|state| {
        let mut workspace = load_workspace(state, ws)?;
        let holder = LockHolder::Run(run_id.clone());
        let finished = state
            .get_run(run_id.as_str())
            .is_none_or(|run| run.is_done());
        if workspace.lock.as_ref() != Some(&holder) || !finished {
            return Ok((Vec::new(), false));
        }
        workspace.unlock(&holder, false)?;
        Ok((vec![Event::WorkspaceSaved { workspace }], true))
    })?;
    if released {
        info!(workspace_id = %ws, run_id = %run_id, "released lock of finished run");
    }
    Ok(())
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;

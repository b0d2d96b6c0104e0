// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for use across crates.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::{
    AgentPoolId, Chunk, ConfigVersion, ConfigVersionId, CreateOptions, Event, Phase, Run, RunId,
    RunStatus, Workspace, WorkspaceId,
};

// ── Record builders ─────────────────────────────────────────────────────────

/// Remote-mode workspace in org `acme`
pub fn workspace(id: &str) -> Workspace {
    Workspace::new(WorkspaceId::new(id), "acme")
}

pub fn agent_workspace(id: &str, pool: &str) -> Workspace {
    workspace(id).with_agent_pool(AgentPoolId::new(pool))
}

pub fn config_version(id: &str, workspace_id: &str) -> ConfigVersion {
    ConfigVersion::new(ConfigVersionId::new(id), WorkspaceId::new(workspace_id), 0)
}

/// Pending run on `ws` created at `created_at_ms`
pub fn pending_run(id: &str, ws: &Workspace, created_at_ms: u64) -> Run {
    Run::new(
        RunId::new(id),
        ws,
        ConfigVersionId::new("cv-test"),
        false,
        CreateOptions::default(),
        created_at_ms,
    )
}

/// Run forced to `status` with a timestamp for each status on the way.
/// Intended for seeding stores, not for exercising the graph.
pub fn run_in_status(id: &str, ws: &Workspace, status: RunStatus, at_ms: u64) -> Run {
    let mut run = pending_run(id, ws, at_ms);
    run.status = status;
    run.status_timestamps.insert(status, at_ms);
    run
}

pub fn chunk(run_id: &str, phase: Phase, offset: u64, data: &[u8]) -> Chunk {
    Chunk::new(RunId::new(run_id), phase, offset, data.to_vec())
}

// ── Event factory functions ─────────────────────────────────────────────────

pub fn run_saved_event(run: &Run) -> Event {
    Event::RunSaved {
        run: Box::new(run.clone()),
    }
}

pub fn workspace_saved_event(workspace: &Workspace) -> Event {
    Event::WorkspaceSaved {
        workspace: workspace.clone(),
    }
}

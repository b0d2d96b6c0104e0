// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace lock manager and the minimal workspace / config version mirror
//! kept for scheduling.

use crate::artifacts::ArtifactStore;
use crate::context::Ctx;
use crate::error::EngineError;
use crate::runs::{delete_run, load_workspace};
use ot_core::{
    Clock, ConfigVersion, ConfigVersionId, Event, LockHolder, Table, UserId, Workspace,
    WorkspaceId,
};
use tracing::info;

#[derive(Clone)]
pub struct WorkspaceService<C: Clock> {
    ctx: Ctx<C>,
}

impl<C: Clock> WorkspaceService<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        Self { ctx }
    }

    pub fn get(&self, id: &WorkspaceId) -> Result<Workspace, EngineError> {
        self.ctx.store.read(|state| load_workspace(state, id))
    }

    /// Insert or refresh the mirrored record. The lock is owned here and
    /// survives updates from the collaborator.
    pub fn upsert(&self, mut workspace: Workspace) -> Result<Workspace, EngineError> {
        let ws = self.ctx.commit(|state| {
            workspace.lock = state
                .get_workspace(workspace.id.as_str())
                .and_then(|existing| existing.lock.clone());
            Ok((
                vec![Event::WorkspaceSaved {
                    workspace: workspace.clone(),
                }],
                workspace,
            ))
        })?;
        Ok(ws)
    }

    /// Remove a workspace with its runs and config versions. Refused while
    /// a run holds the lock.
    pub fn delete(&self, id: &WorkspaceId) -> Result<(), EngineError> {
        self.ctx.commit(|state| {
            let ws = load_workspace(state, id)?;
            if let Some(LockHolder::Run(run_id)) = &ws.lock {
                if state.get_run(run_id.as_str()).is_some_and(|r| !r.is_done()) {
                    return Err(EngineError::Conflict(format!(
                        "workspace {id} is locked by active run {run_id}"
                    )));
                }
            }
            let mut events = Vec::new();
            for run in state.workspace_runs(id.as_str()) {
                events.extend(delete_run(state, run));
            }
            for cv in state.config_versions.values() {
                if cv.workspace_id == *id {
                    events.push(Event::ConfigVersionDeleted { id: cv.id.clone() });
                }
            }
            events.push(Event::WorkspaceDeleted { id: id.clone() });
            Ok((events, ()))
        })?;
        info!(workspace_id = %id, "workspace deleted");
        Ok(())
    }

    pub fn upload_config_version(&self, cv: ConfigVersion) -> Result<(), EngineError> {
        self.ctx.commit(|state| {
            load_workspace(state, &cv.workspace_id)?;
            Ok((vec![Event::ConfigVersionSaved { config_version: cv }], ()))
        })
    }

    /// Store `tarball` with the artifact collaborator and record a new
    /// version of `workspace_id` pointing at it.
    pub async fn create_config_version(
        &self,
        workspace_id: &WorkspaceId,
        speculative: bool,
        tarball: Vec<u8>,
    ) -> Result<ConfigVersion, EngineError> {
        self.get(workspace_id)?;
        let artifact = self.ctx.artifacts.put(tarball).await?;
        let id = ConfigVersionId::generate(&*self.ctx.ids);
        let mut cv = ConfigVersion::new(id, workspace_id.clone(), self.ctx.now_ms())
            .with_artifact(artifact);
        cv.speculative = speculative;
        self.upload_config_version(cv.clone())?;
        info!(workspace_id = %workspace_id, config_version_id = %cv.id, "config version uploaded");
        Ok(cv)
    }

    pub fn get_config_version(&self, id: &ConfigVersionId) -> Result<ConfigVersion, EngineError> {
        self.ctx.store.read(|state| {
            state
                .get_config_version(id.as_str())
                .cloned()
                .ok_or_else(|| EngineError::not_found(Table::ConfigVersion, id))
        })
    }

    /// Lock for a user. Nothing is scheduled on the workspace until unlocked.
    pub fn lock(&self, id: &WorkspaceId, user: &UserId) -> Result<Workspace, EngineError> {
        let ws = self.ctx.commit(|state| {
            let mut ws = load_workspace(state, id)?;
            ws.lock(LockHolder::User(user.clone()))?;
            Ok((
                vec![Event::WorkspaceSaved {
                    workspace: ws.clone(),
                }],
                ws,
            ))
        })?;
        info!(workspace_id = %id, user = %user, "workspace locked");
        Ok(ws)
    }

    /// Release the lock held by `subject`; another subject's lock needs
    /// `force`. The saved workspace wakes the scheduler.
    pub fn unlock(
        &self,
        id: &WorkspaceId,
        subject: &LockHolder,
        force: bool,
    ) -> Result<Workspace, EngineError> {
        let ws = self.ctx.commit(|state| {
            let mut ws = load_workspace(state, id)?;
            ws.unlock(subject, force)?;
            Ok((
                vec![Event::WorkspaceSaved {
                    workspace: ws.clone(),
                }],
                ws,
            ))
        })?;
        info!(workspace_id = %id, subject = %subject, force, "workspace unlocked");
        Ok(ws)
    }
}

#[cfg(test)]
#[path = "workspaces_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized tables derived from committed events

use ot_core::{
    AgentPoolId, ChangeKind, Chunk, ConfigVersion, Event, Job, JobStatus, Lease, LogKey, Phase,
    PhaseLog, Run, RunId, RunStatus, RunnerMeta, Workspace,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// All tables of the shared store, keyed by row id (`run-id/phase` for logs).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MaterializedState {
    #[serde(default)]
    pub runs: HashMap<String, Run>,
    #[serde(default)]
    pub jobs: HashMap<String, Job>,
    #[serde(default)]
    pub workspaces: HashMap<String, Workspace>,
    #[serde(default)]
    pub config_versions: HashMap<String, ConfigVersion>,
    #[serde(default)]
    pub logs: HashMap<String, PhaseLog>,
    #[serde(default)]
    pub runners: HashMap<String, RunnerMeta>,
    #[serde(default)]
    pub leases: HashMap<String, Lease>,
}

impl MaterializedState {
    pub fn get_run(&self, id: &str) -> Option<&Run> {
        self.runs.get(id)
    }

    pub fn get_job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_workspace(&self, id: &str) -> Option<&Workspace> {
        self.workspaces.get(id)
    }

    pub fn get_config_version(&self, id: &str) -> Option<&ConfigVersion> {
        self.config_versions.get(id)
    }

    pub fn get_runner(&self, id: &str) -> Option<&RunnerMeta> {
        self.runners.get(id)
    }

    pub fn log(&self, key: &LogKey) -> Option<&PhaseLog> {
        self.logs.get(&key.to_string())
    }

    /// Runs on a workspace, oldest first (ties by id).
    pub fn workspace_runs(&self, workspace_id: &str) -> Vec<&Run> {
        let mut runs: Vec<&Run> = self
            .runs
            .values()
            .filter(|r| r.workspace_id == workspace_id)
            .collect();
        runs.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        runs
    }

    /// Oldest pending run on a workspace.
    pub fn oldest_pending(&self, workspace_id: &str) -> Option<&Run> {
        self.workspace_runs(workspace_id)
            .into_iter()
            .find(|r| r.status == RunStatus::Pending)
    }

    /// Non-terminal runs across all workspaces, oldest first.
    pub fn incomplete_runs(&self) -> Vec<&Run> {
        let mut runs: Vec<&Run> = self.runs.values().filter(|r| !r.is_done()).collect();
        runs.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        runs
    }

    pub fn run_jobs(&self, run_id: &RunId) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| j.run_id == *run_id).collect();
        jobs.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        jobs
    }

    /// The non-terminal job for (run, phase), if any.
    pub fn active_job(&self, run_id: &RunId, phase: Phase) -> Option<&Job> {
        self.jobs
            .values()
            .find(|j| j.run_id == *run_id && j.phase == phase && !j.is_done())
    }

    /// Unallocated jobs tagged with `pool`, oldest first.
    pub fn unallocated_jobs(&self, pool: Option<&AgentPoolId>) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Unallocated && j.agent_pool_id.as_ref() == pool)
            .collect();
        jobs.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        jobs
    }

    /// Jobs currently held by a runner (allocated or running).
    pub fn runner_jobs(&self, runner_id: &str) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| {
                j.runner_id.as_ref().is_some_and(|r| r == runner_id)
                    && matches!(j.status, JobStatus::Allocated | JobStatus::Running)
            })
            .collect()
    }

    /// Whether any run still references a config version.
    pub fn config_version_in_use(&self, id: &str) -> bool {
        self.runs.values().any(|r| r.config_version_id == id)
    }

    /// Apply one committed event.
    ///
    /// Returns the kind of change made, or `None` when the event changed
    /// nothing (a delete of a missing row, a chunk already in its log).
    /// Applying an event twice leaves the state as applying it once.
    pub fn apply_event(&mut self, event: &Event) -> Option<ChangeKind> {
        match event {
            Event::RunSaved { run } => Some(upsert(&mut self.runs, run.id.to_string(), (**run).clone())),
            Event::RunDeleted { id } => {
                let removed = self.runs.remove(id.as_str()).is_some();
                // Cascade to jobs and logs of the run
                let job_ids: Vec<String> = self
                    .jobs
                    .iter()
                    .filter(|(_, j)| j.run_id == *id)
                    .map(|(k, _)| k.clone())
                    .collect();
                for job_id in job_ids {
                    self.remove_job(&job_id);
                }
                for phase in [Phase::Plan, Phase::Apply] {
                    self.logs.remove(&LogKey::new(id.clone(), phase).to_string());
                }
                removed.then_some(ChangeKind::Deleted)
            }
            Event::JobSaved { job } => {
                let previous_runner = self
                    .jobs
                    .get(job.id.as_str())
                    .and_then(|j| j.runner_id.clone());
                let kind = upsert(&mut self.jobs, job.id.to_string(), (**job).clone());
                if let Some(runner) = previous_runner {
                    self.refresh_runner_load(runner.as_str());
                }
                if let Some(runner) = &job.runner_id {
                    self.refresh_runner_load(runner.as_str());
                }
                Some(kind)
            }
            Event::JobDeleted { id } => self.remove_job(id.as_str()).then_some(ChangeKind::Deleted),
            Event::WorkspaceSaved { workspace } => Some(upsert(
                &mut self.workspaces,
                workspace.id.to_string(),
                workspace.clone(),
            )),
            Event::WorkspaceDeleted { id } => self
                .workspaces
                .remove(id.as_str())
                .map(|_| ChangeKind::Deleted),
            Event::ConfigVersionSaved { config_version } => Some(upsert(
                &mut self.config_versions,
                config_version.id.to_string(),
                config_version.clone(),
            )),
            Event::ConfigVersionDeleted { id } => self
                .config_versions
                .remove(id.as_str())
                .map(|_| ChangeKind::Deleted),
            Event::ChunkAppended { chunk } => self.append_chunk(chunk),
            Event::RunnerSaved { runner } => {
                let mut runner = runner.clone();
                runner.current_jobs = self.runner_jobs(runner.id.as_str()).len() as u32;
                Some(upsert(&mut self.runners, runner.id.to_string(), runner))
            }
            Event::RunnerDeleted { id } => self.runners.remove(id.as_str()).map(|_| ChangeKind::Deleted),
            Event::LeaseAcquired {
                name,
                holder,
                expires_at_ms,
            } => Some(upsert(
                &mut self.leases,
                name.clone(),
                Lease {
                    name: name.clone(),
                    holder: holder.clone(),
                    expires_at_ms: *expires_at_ms,
                },
            )),
            Event::LeaseReleased { name, holder } => {
                if self.leases.get(name).is_some_and(|l| l.holder == *holder) {
                    self.leases.remove(name);
                    Some(ChangeKind::Deleted)
                } else {
                    None
                }
            }
            Event::Custom => None,
        }
    }

    fn remove_job(&mut self, id: &str) -> bool {
        match self.jobs.remove(id) {
            Some(job) => {
                if let Some(runner) = &job.runner_id {
                    self.refresh_runner_load(runner.as_str());
                }
                true
            }
            None => false,
        }
    }

    fn refresh_runner_load(&mut self, runner_id: &str) {
        let load = self.runner_jobs(runner_id).len() as u32;
        if let Some(runner) = self.runners.get_mut(runner_id) {
            runner.current_jobs = load;
        }
    }

    fn append_chunk(&mut self, chunk: &Chunk) -> Option<ChangeKind> {
        let key = chunk.log_key().to_string();
        let log = self.logs.entry(key).or_default();
        if chunk.end() <= log.len() {
            // Replayed append already reflected in the log
            return None;
        }
        let created = log.is_empty();
        match log.append(chunk) {
            Ok(()) if created => Some(ChangeKind::Created),
            Ok(()) => Some(ChangeKind::Updated),
            Err(e) => {
                warn!(log = %chunk.log_key(), error = %e, "skipping chunk that does not fit log");
                None
            }
        }
    }
}

fn upsert<T>(table: &mut HashMap<String, T>, id: String, row: T) -> ChangeKind {
    match table.insert(id, row) {
        Some(_) => ChangeKind::Updated,
        None => ChangeKind::Created,
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;

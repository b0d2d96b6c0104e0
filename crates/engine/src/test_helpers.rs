// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for engine unit tests

use crate::artifacts::{ArtifactStore, MemoryArtifacts};
use crate::config::EngineConfig;
use crate::context::Ctx;
use crate::runs::RunService;
use ot_core::test_support::config_version;
use ot_core::{
    ConfigVersionId, CreateOptions, Event, FakeClock, IdGen, ReplicaId, Run, SequentialIdGen,
    Workspace, WorkspaceId,
};
use ot_storage::Store;
use std::sync::Arc;
use std::time::Duration;

/// Fast loops; grace and timeouts are measured on the fake clock.
pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        claim_poll_timeout: Duration::from_millis(50),
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(50),
        progress_interval: Duration::from_millis(10),
        ping_interval: Duration::from_millis(50),
        watchdog_interval: Duration::from_millis(10),
        timeout_scan_interval: Duration::from_millis(20),
        retention_scan_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

pub(crate) fn ctx() -> Ctx<FakeClock> {
    Peers::new().ctx("replica-a")
}

/// Replicas sharing one store, clock, id sequence and artifact store, as
/// nodes of a cluster.
pub(crate) struct Peers {
    pub store: Store,
    pub clock: FakeClock,
    ids: Arc<dyn IdGen>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl Peers {
    pub fn new() -> Self {
        let ids: Arc<dyn IdGen> = Arc::new(SequentialIdGen::new());
        Self {
            store: Store::in_memory(),
            clock: FakeClock::new(),
            artifacts: Arc::new(MemoryArtifacts::new(Arc::clone(&ids))),
            ids,
        }
    }

    pub fn ctx(&self, replica: &str) -> Ctx<FakeClock> {
        Ctx::new(
            self.store.clone(),
            ReplicaId::new(replica),
            self.clock.clone(),
            Arc::clone(&self.ids),
            test_config(),
        )
        .with_artifacts(Arc::clone(&self.artifacts))
    }
}

pub(crate) fn seed(ctx: &Ctx<FakeClock>, events: Vec<Event>) {
    ctx.commit(|_| Ok((events, ()))).unwrap();
}

/// Workspace plus a config version `cv-<ws>` belonging to it
pub(crate) fn seed_workspace(ctx: &Ctx<FakeClock>, ws: &Workspace) {
    let cv = config_version(&format!("cv-{}", ws.id), ws.id.as_str());
    seed(
        ctx,
        vec![
            Event::WorkspaceSaved {
                workspace: ws.clone(),
            },
            Event::ConfigVersionSaved { config_version: cv },
        ],
    );
}

/// Create a run on `ws` (seeded with [`seed_workspace`]) and queue its plan
pub(crate) fn queue_plan(ctx: &Ctx<FakeClock>, ws: &str) -> Run {
    let runs = RunService::new(ctx.clone());
    let run = runs
        .create(
            &WorkspaceId::new(ws),
            &ConfigVersionId::new(format!("cv-{ws}")),
            CreateOptions::default(),
        )
        .unwrap();
    runs.enqueue_plan(&run.id).unwrap()
}

/// Poll `check` until it holds, failing after five seconds.
pub(crate) async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

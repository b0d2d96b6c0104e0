//! Test helpers for behavioral specifications.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ot_adapters::FakeEngine;
use ot_core::test_support::config_version;
use ot_core::{
    ConfigVersionId, CreateOptions, FakeClock, IdGen, ReplicaId, RunId, RunStatus,
    SequentialIdGen, Workspace, WorkspaceId,
};
use ot_engine::{AllowAll, Ctx, EngineConfig, Replica, Tail};
use ot_storage::Store;

// Spec polling timeouts
pub const SPEC_POLL_INTERVAL_MS: u64 = 10;
pub const SPEC_WAIT_MAX_MS: u64 = 5000;

/// Returns the path to a binary, checking the llvm-cov target directory
/// first, then falling back to resolving relative to the test binary.
fn binary_path(name: &str) -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));

    let llvm_cov_path = manifest_dir.join("target/llvm-cov-target/debug").join(name);
    if llvm_cov_path.exists() {
        return llvm_cov_path;
    }

    let standard = manifest_dir.join("target/debug").join(name);
    if standard.exists() {
        return standard;
    }

    // The test binary lives at target/debug/deps/specs-<hash>
    if let Ok(exe) = std::env::current_exe() {
        if let Some(debug_dir) = exe.parent().and_then(|d| d.parent()) {
            let fallback = debug_dir.join(name);
            if fallback.exists() {
                return fallback;
            }
        }
    }

    standard
}

/// Returns the path to the otd daemon binary.
pub fn otd_binary() -> PathBuf {
    binary_path("otd")
}

/// `otd` with its state confined to `state_dir` and no inherited overrides
pub fn otd(state_dir: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new(otd_binary());
    cmd.env("OT_STATE_DIR", state_dir)
        .env("OT_ENGINE_BIN", "/bin/false")
        .env_remove("OT_REPLICA")
        .env_remove("OT_REPLICAS")
        .env_remove("OT_LISTEN_TCP")
        .env_remove("OT_AUTH_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

/// Poll `check` until it holds, failing after [`SPEC_WAIT_MAX_MS`].
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(SPEC_WAIT_MAX_MS);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(SPEC_POLL_INTERVAL_MS)).await;
    }
}

/// Blocking variant of [`eventually`] for process specs
pub fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_millis(SPEC_WAIT_MAX_MS);
    while !check() {
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(SPEC_POLL_INTERVAL_MS));
    }
}

/// Fast loops; grace periods and timeouts run on the fake clock.
pub fn fast_config() -> EngineConfig {
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

/// Replicas sharing one store, clock and ID space
pub struct Cluster {
    pub store: Store,
    pub clock: FakeClock,
    ids: Arc<dyn IdGen>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: Store::in_memory(),
            clock: FakeClock::new(),
            ids: Arc::new(SequentialIdGen::new()),
        }
    }

    /// A replica running the built-in runner on `engine`
    pub fn replica(&self, name: &str, engine: &FakeEngine) -> Replica<FakeClock> {
        self.replica_with(name, engine, fast_config())
    }

    /// A replica with no runner of its own
    pub fn api_replica(&self, name: &str) -> Replica<FakeClock> {
        let config = EngineConfig {
            builtin_runner: false,
            ..fast_config()
        };
        self.replica_with(name, &FakeEngine::new(), config)
    }

    pub fn replica_with(
        &self,
        name: &str,
        engine: &FakeEngine,
        config: EngineConfig,
    ) -> Replica<FakeClock> {
        let ctx = Ctx::new(
            self.store.clone(),
            ReplicaId::new(name),
            self.clock.clone(),
            Arc::clone(&self.ids),
            config,
        );
        Replica::start(ctx, engine.clone(), Arc::new(AllowAll))
    }
}

/// Mirror `ws` and upload config version `cv-<ws>` for it
pub fn seed_workspace(replica: &Replica<FakeClock>, ws: Workspace) {
    let cv = config_version(&format!("cv-{}", ws.id), ws.id.as_str());
    replica.workspaces.upsert(ws).unwrap();
    replica.workspaces.upload_config_version(cv).unwrap();
}

pub fn create_run(replica: &Replica<FakeClock>, ws: &str, opts: CreateOptions) -> RunId {
    replica
        .runs
        .create(
            &WorkspaceId::new(ws),
            &ConfigVersionId::new(format!("cv-{ws}")),
            opts,
        )
        .unwrap()
        .id
}

pub fn status(replica: &Replica<FakeClock>, run: &RunId) -> RunStatus {
    replica.runs.get(run).unwrap().status
}

pub fn is_locked(replica: &Replica<FakeClock>, ws: &str) -> bool {
    replica
        .workspaces
        .get(&WorkspaceId::new(ws))
        .unwrap()
        .is_locked()
}

/// Read a tail to its end as display text
pub async fn collect(mut tail: Tail) -> String {
    let mut text = String::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_millis(SPEC_WAIT_MAX_MS), tail.next())
        .await
        .expect("tail did not finish")
    {
        text.push_str(&chunk.text());
    }
    text
}

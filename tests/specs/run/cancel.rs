//! Cancellation and timeout specs
//!
//! Soft cancel asks the engine to stop; once the grace period passes
//! without an acknowledgement the run is force canceled.

use crate::prelude::*;
use ot_adapters::{FakeEngine, FakeOutcome};
use ot_core::test_support::workspace;
use ot_core::{CreateOptions, RunStatus, Signal, UserId, WorkspaceId};
use ot_engine::{CancelOutcome, EngineConfig};
use std::time::Duration;

#[tokio::test]
async fn pending_run_cancels_immediately() {
    let cluster = Cluster::new();
    let replica = cluster.replica("replica-a", &FakeEngine::new());
    seed_workspace(&replica, workspace("ws-1"));
    replica
        .workspaces
        .lock(&WorkspaceId::new("ws-1"), &UserId::new("alice"))
        .unwrap();

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    assert_eq!(replica.runs.cancel(&run).unwrap(), CancelOutcome::Canceled);
    assert_eq!(status(&replica, &run), RunStatus::Canceled);
    assert!(replica.runs.cancel(&run).is_err());
    replica.shutdown().await;
}

#[tokio::test]
async fn engine_that_honors_cancel_ends_canceled() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::hang(true));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("engine running", || engine.running() == 1).await;

    assert_eq!(replica.runs.cancel(&run).unwrap(), CancelOutcome::Signaled);
    // Only one soft cancel per run
    assert!(replica.runs.cancel(&run).is_err());

    eventually("canceled", || status(&replica, &run) == RunStatus::Canceled).await;
    assert_eq!(engine.calls()[0].signals, vec![Signal::Cancel]);
    assert!(!is_locked(&replica, "ws-1"));
    replica.shutdown().await;
}

#[tokio::test]
async fn ignored_cancel_is_forced_after_the_grace_period() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::hang(false));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("engine running", || engine.running() == 1).await;
    replica.runs.cancel(&run).unwrap();
    eventually("cancel delivered", || {
        engine.calls()[0].signals.contains(&Signal::Cancel)
    })
    .await;

    // Too early for an operator force cancel
    assert!(replica.runs.force_cancel(&run).is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(status(&replica, &run), RunStatus::Planning);

    cluster.clock.advance(replica.ctx.config.grace_period);
    eventually("force canceled", || {
        status(&replica, &run) == RunStatus::ForceCanceled
    })
    .await;
    eventually("engine stopped", || engine.running() == 0).await;
    assert!(!is_locked(&replica, "ws-1"));
    replica.shutdown().await;
}

#[tokio::test]
async fn phase_past_its_timeout_is_force_canceled() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::hang(false));
    let config = EngineConfig {
        planning_timeout: Duration::from_secs(60),
        ..fast_config()
    };
    let replica = cluster.replica_with("replica-a", &engine, config);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("planning", || status(&replica, &run) == RunStatus::Planning).await;

    cluster.clock.advance(Duration::from_secs(60));
    eventually("timed out", || {
        status(&replica, &run) == RunStatus::ForceCanceled
    })
    .await;
    let error = replica.runs.get(&run).unwrap().error.unwrap();
    assert_eq!(error, "planning exceeded timeout of 60s");
    eventually("engine stopped", || engine.running() == 0).await;
    replica.shutdown().await;
}

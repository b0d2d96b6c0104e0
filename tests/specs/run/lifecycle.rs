//! Run lifecycle specs
//!
//! A run moves from pending through plan (and apply) to a terminal status,
//! holding its workspace's lock while it can still change infrastructure.

use crate::prelude::*;
use ot_adapters::{FakeEngine, FakeOutcome};
use ot_core::test_support::workspace;
use ot_core::{CreateOptions, Phase, Report, RunStatus};
use ot_engine::EngineError;

#[tokio::test]
async fn confirmed_run_plans_then_applies() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(2, 1, 0)));
    engine.push(FakeOutcome::succeed(Report::new(2, 1, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("planned", || status(&replica, &run) == RunStatus::Planned).await;
    assert!(is_locked(&replica, "ws-1"));

    let planned = replica.runs.get(&run).unwrap();
    let report = planned.plan_report.unwrap();
    assert_eq!((report.additions, report.changes), (2, 1));

    replica.runs.apply(&run, true, None).await.unwrap();
    eventually("applied", || status(&replica, &run) == RunStatus::Applied).await;
    assert!(!is_locked(&replica, "ws-1"));

    let phases: Vec<Phase> = engine.calls().iter().map(|c| c.phase).collect();
    assert_eq!(phases, vec![Phase::Plan, Phase::Apply]);
    replica.shutdown().await;
}

#[tokio::test]
async fn apply_needs_confirmation_unless_auto_applied() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("planned", || status(&replica, &run) == RunStatus::Planned).await;

    let err = replica.runs.apply(&run, false, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "{err}");
    assert_eq!(status(&replica, &run), RunStatus::Planned);
    replica.shutdown().await;
}

#[tokio::test]
async fn auto_apply_workspace_applies_without_confirmation() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-auto").with_auto_apply(true));

    let run = create_run(&replica, "ws-auto", CreateOptions::default());
    eventually("applied", || status(&replica, &run) == RunStatus::Applied).await;
    assert_eq!(engine.calls().len(), 2);
    replica.shutdown().await;
}

#[tokio::test]
async fn plan_without_changes_finishes_and_unlocks() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(0, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("finished", || {
        status(&replica, &run) == RunStatus::PlannedAndFinished
    })
    .await;
    assert!(!is_locked(&replica, "ws-1"));
    replica.shutdown().await;
}

#[tokio::test]
async fn plan_only_runs_never_take_the_lock() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::hang(true));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let opts = CreateOptions {
        plan_only: Some(true),
        ..CreateOptions::default()
    };
    let run = create_run(&replica, "ws-1", opts);
    eventually("planning", || status(&replica, &run) == RunStatus::Planning).await;
    assert!(!is_locked(&replica, "ws-1"));

    replica.runs.cancel(&run).unwrap();
    eventually("canceled", || status(&replica, &run) == RunStatus::Canceled).await;
    replica.shutdown().await;
}

#[tokio::test]
async fn discarding_a_planned_run_releases_the_lock() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("planned", || status(&replica, &run) == RunStatus::Planned).await;

    replica.runs.discard(&run).unwrap();
    assert_eq!(status(&replica, &run), RunStatus::Discarded);
    assert!(!is_locked(&replica, "ws-1"));
    replica.shutdown().await;
}

#[tokio::test]
async fn failed_plan_errors_the_run_with_the_reason() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::fail("Error: provider crashed"));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("errored", || status(&replica, &run) == RunStatus::Errored).await;

    let errored = replica.runs.get(&run).unwrap();
    assert!(errored.error.unwrap().contains("provider crashed"));
    assert!(!is_locked(&replica, "ws-1"));
    replica.shutdown().await;
}

//! Log streaming specs
//!
//! A tail delivers a phase log in order from any offset, on any replica,
//! and ends once the phase has finished writing.

use crate::prelude::*;
use ot_adapters::{FakeEngine, FakeOutcome};
use ot_core::test_support::workspace;
use ot_core::{CreateOptions, Phase, Report, RunId, RunStatus, END_MARKER, START_MARKER};
use ot_engine::EngineError;

const PLAN_OUTPUT: &str = "Plan: 1 to add, 0 to change, 0 to destroy.\n";

#[tokio::test]
async fn tail_follows_a_plan_as_it_runs() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    let tail = replica.logs.tail(&run, Phase::Plan, 0).unwrap();
    assert_eq!(collect(tail).await, PLAN_OUTPUT);
    replica.shutdown().await;
}

#[tokio::test]
async fn finished_log_is_replayed_with_its_markers() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("planned", || status(&replica, &run) == RunStatus::Planned).await;

    let stored = replica.logs.get_chunk(&run, Phase::Plan, 0, 0).unwrap();
    assert_eq!(stored.data.first(), Some(&START_MARKER));
    assert_eq!(stored.data.last(), Some(&END_MARKER));

    let tail = replica.logs.tail(&run, Phase::Plan, 0).unwrap();
    assert_eq!(collect(tail).await, PLAN_OUTPUT);
    replica.shutdown().await;
}

#[tokio::test]
async fn tail_from_an_offset_skips_what_was_read() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("planned", || status(&replica, &run) == RunStatus::Planned).await;

    // One byte of start marker, then the first 16 bytes of output
    let skipped = "Plan: 1 to add, ";
    let offset = 1 + skipped.len() as u64;
    let tail = replica.logs.tail(&run, Phase::Plan, offset).unwrap();
    assert_eq!(collect(tail).await, &PLAN_OUTPUT[skipped.len()..]);
    replica.shutdown().await;
}

#[tokio::test]
async fn tail_on_another_replica_sees_both_phases() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let api = cluster.api_replica("replica-api");
    let worker = cluster.replica("replica-worker", &engine);
    seed_workspace(&api, workspace("ws-1"));

    let run = create_run(&api, "ws-1", CreateOptions::default());
    let plan = api.logs.tail(&run, Phase::Plan, 0).unwrap();
    assert_eq!(collect(plan).await, PLAN_OUTPUT);

    eventually("planned", || status(&api, &run) == RunStatus::Planned).await;
    let apply = api.logs.tail(&run, Phase::Apply, 0).unwrap();
    api.runs.apply(&run, true, None).await.unwrap();
    assert_eq!(collect(apply).await, PLAN_OUTPUT);
    eventually("applied", || status(&api, &run) == RunStatus::Applied).await;

    api.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn tail_of_unknown_run_is_not_found() {
    let cluster = Cluster::new();
    let replica = cluster.api_replica("replica-a");
    let err = replica
        .logs
        .tail(&RunId::new("run-missing"), Phase::Plan, 0)
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::NotFound(_)), "{err}");
    replica.shutdown().await;
}

//! Scheduling specs
//!
//! One run at a time per workspace, oldest first; workspaces are
//! independent of each other.

use crate::prelude::*;
use ot_adapters::{FakeEngine, FakeOutcome};
use ot_core::test_support::workspace;
use ot_core::{CreateOptions, LockHolder, Report, RunStatus, UserId, WorkspaceId};
use std::time::Duration;

#[tokio::test]
async fn second_run_waits_for_the_first_to_finish() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));

    let first = create_run(&replica, "ws-1", CreateOptions::default());
    let second = create_run(&replica, "ws-1", CreateOptions::default());
    eventually("first planned", || status(&replica, &first) == RunStatus::Planned).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status(&replica, &second), RunStatus::Pending);

    replica.runs.discard(&first).unwrap();
    eventually("second planned", || {
        status(&replica, &second) == RunStatus::Planned
    })
    .await;
    let ws = replica.workspaces.get(&WorkspaceId::new("ws-1")).unwrap();
    assert_eq!(ws.lock, Some(LockHolder::Run(second.clone())));
    replica.shutdown().await;
}

#[tokio::test]
async fn workspaces_are_scheduled_independently() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::hang(true));
    engine.push(FakeOutcome::hang(true));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));
    seed_workspace(&replica, workspace("ws-2"));

    let a = create_run(&replica, "ws-1", CreateOptions::default());
    let b = create_run(&replica, "ws-2", CreateOptions::default());
    eventually("both planning", || {
        status(&replica, &a) == RunStatus::Planning && status(&replica, &b) == RunStatus::Planning
    })
    .await;
    assert_eq!(engine.running(), 2);

    replica.runs.cancel(&a).unwrap();
    replica.runs.cancel(&b).unwrap();
    eventually("both canceled", || {
        status(&replica, &a) == RunStatus::Canceled && status(&replica, &b) == RunStatus::Canceled
    })
    .await;
    replica.shutdown().await;
}

#[tokio::test]
async fn user_lock_holds_runs_until_unlocked() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let replica = cluster.replica("replica-a", &engine);
    seed_workspace(&replica, workspace("ws-1"));
    let user = UserId::new("alice");
    let ws_id = WorkspaceId::new("ws-1");
    replica.workspaces.lock(&ws_id, &user).unwrap();

    let run = create_run(&replica, "ws-1", CreateOptions::default());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status(&replica, &run), RunStatus::Pending);
    assert!(engine.calls().is_empty());

    replica
        .workspaces
        .unlock(&ws_id, &LockHolder::User(user), false)
        .unwrap();
    eventually("planned", || status(&replica, &run) == RunStatus::Planned).await;
    replica.shutdown().await;
}

#[tokio::test]
async fn runs_queued_on_one_replica_execute_on_another() {
    let cluster = Cluster::new();
    let engine = FakeEngine::new();
    engine.push(FakeOutcome::succeed(Report::new(1, 0, 0)));
    let api = cluster.api_replica("replica-api");
    let worker = cluster.replica("replica-worker", &engine);
    seed_workspace(&api, workspace("ws-1"));

    let run = create_run(&api, "ws-1", CreateOptions::default());
    eventually("planned", || status(&api, &run) == RunStatus::Planned).await;
    assert_eq!(engine.calls().len(), 1);

    api.shutdown().await;
    worker.shutdown().await;
}

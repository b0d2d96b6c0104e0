// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::artifacts::ArtifactStore;
use crate::context::Ctx;
use crate::jobs::JobService;
use crate::logs::LogService;
use crate::runner::BuiltInChannel;
use crate::runs::RunService;
use crate::test_helpers::{ctx, eventually, queue_plan, seed, seed_workspace};
use ot_adapters::{FakeEngine, FakeOutcome};
use ot_core::test_support::{config_version, workspace};
use ot_core::{ArtifactId, Event, FakeClock, Report, Run, RunStatus};
use std::time::Duration;

struct Fixture {
    ctx: Ctx<FakeClock>,
    channel: BuiltInChannel<FakeClock>,
    engine: FakeEngine,
    run: Run,
}

async fn fixture() -> (Fixture, Operation<BuiltInChannel<FakeClock>, FakeEngine>) {
    fixture_with(CancellationToken::new()).await
}

async fn fixture_with(
    shutdown: CancellationToken,
) -> (Fixture, Operation<BuiltInChannel<FakeClock>, FakeEngine>) {
    let ctx = ctx();
    seed_workspace(&ctx, &workspace("ws-1"));
    let run = queue_plan(&ctx, "ws-1");
    let channel = BuiltInChannel::new(ctx.clone());
    let runner = channel.register("built-in", 1).await.unwrap();
    let assignment = channel
        .claim_job(&runner.id, Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    let engine = FakeEngine::new();
    let operation = Operation {
        channel: channel.clone(),
        engine: engine.clone(),
        runner: runner.id,
        assignment,
        config: Arc::clone(&ctx.config),
        shutdown,
    };
    (
        Fixture {
            ctx,
            channel,
            engine,
            run,
        },
        operation,
    )
}

impl Fixture {
    fn run(&self) -> Run {
        RunService::new(self.ctx.clone()).get(&self.run.id).unwrap()
    }

    fn log(&self) -> Chunk {
        LogService::new(self.ctx.clone())
            .get_chunk(&self.run.id, Phase::Plan, 0, 0)
            .unwrap()
    }
}

#[test]
fn log_writer_brackets_output_with_markers() {
    let mut writer = LogWriter::new(RunId::new("run-1"), Phase::Plan);
    assert!(writer.chunk().is_none());

    writer.write(b"hello");
    let first = writer.chunk().unwrap();
    assert_eq!(first.offset, 0);
    assert!(first.is_start());
    writer.ack(first.data.len());
    assert_eq!(writer.offset(), 6);

    writer.write(b" world");
    writer.finish();
    let last = writer.chunk().unwrap();
    assert_eq!(last.offset, 6);
    assert!(last.is_end());
    assert!(!last.is_start());
}

#[test]
fn log_writer_keeps_unacknowledged_bytes() {
    let mut writer = LogWriter::new(RunId::new("run-1"), Phase::Apply);
    writer.write(b"abc");
    let chunk = writer.chunk().unwrap();
    // Report failed: nothing acknowledged, the same span goes out again
    writer.write(b"def");
    let again = writer.chunk().unwrap();
    assert_eq!(again.offset, chunk.offset);
    assert_eq!(&again.data[..chunk.data.len()], &chunk.data[..]);

    writer.discard();
    assert!(writer.chunk().is_none());
    assert_eq!(writer.offset(), 0);
}

#[test]
fn empty_phase_still_writes_both_markers() {
    let mut writer = LogWriter::new(RunId::new("run-1"), Phase::Plan);
    writer.finish();
    assert_eq!(writer.chunk().unwrap().data, vec![START_MARKER, END_MARKER]);
}

#[tokio::test]
async fn successful_plan_streams_log_and_reports_result() {
    let (fx, operation) = fixture().await;
    fx.engine.push(FakeOutcome::succeed(Report::new(2, 0, 0)));

    let outcome = operation.run().await;

    assert!(matches!(outcome, PhaseOutcome::Succeeded { .. }));
    let run = fx.run();
    assert_eq!(run.status, RunStatus::Planned);
    assert_eq!(run.plan_report, Some(Report::new(2, 0, 0)));
    let log = fx.log();
    assert!(log.is_start());
    assert!(log.is_end());
    assert!(log.text().contains("Plan: 2 to add"));
    assert_eq!(fx.channel.inflight(), 0);
}

#[tokio::test]
async fn failed_plan_records_stderr_tail() {
    let (fx, operation) = fixture().await;
    fx.engine
        .push(FakeOutcome::fail("Warning: noise\nError: Unsupported argument\n"));

    let outcome = operation.run().await;

    let PhaseOutcome::Failed { reason } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(reason, "exit status 1: Error: Unsupported argument");
    let run = fx.run();
    assert_eq!(run.status, RunStatus::Errored);
    assert_eq!(run.error.as_deref(), Some(reason.as_str()));
    let log = fx.log();
    assert!(log.text().contains("Error: exit status 1"));
    assert!(log.is_end());
}

#[tokio::test]
async fn soft_cancel_from_server_reaches_engine() {
    let (fx, operation) = fixture().await;
    fx.engine.push(FakeOutcome::hang(true));
    let task = tokio::spawn(operation.run());
    eventually("engine running", || fx.engine.running() == 1).await;

    RunService::new(fx.ctx.clone()).cancel(&fx.run.id).unwrap();

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fx.run().status, RunStatus::Canceled);
    assert_eq!(fx.engine.calls()[0].signals, vec![Signal::Cancel]);
    assert!(fx.log().text().contains("interrupted"));
}

#[tokio::test]
async fn ignored_cancel_escalates_after_grace() {
    let (fx, operation) = fixture().await;
    fx.engine.push(FakeOutcome::hang(false));
    let task = tokio::spawn(operation.run());
    eventually("engine running", || fx.engine.running() == 1).await;

    RunService::new(fx.ctx.clone()).cancel(&fx.run.id).unwrap();
    eventually("cancel delivered", || {
        fx.engine.calls()[0].signals == vec![Signal::Cancel]
    })
    .await;

    fx.ctx.clock.advance(fx.ctx.config.grace_period);
    assert_eq!(JobService::new(fx.ctx.clone()).expire_interrupts().unwrap(), 1);

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        fx.engine.calls()[0].signals,
        vec![Signal::Cancel, Signal::ForceCancel]
    );
    let run = fx.run();
    assert_eq!(run.status, RunStatus::ForceCanceled);
    let locked = fx
        .ctx
        .store
        .read(|s| s.get_workspace("ws-1").is_some_and(|ws| ws.is_locked()));
    assert!(!locked);
}

#[tokio::test]
async fn runner_shutdown_soft_interrupts_engine() {
    let shutdown = CancellationToken::new();
    let (fx, operation) = fixture_with(shutdown.clone()).await;
    fx.engine.push(FakeOutcome::hang(true));
    let task = tokio::spawn(operation.run());
    eventually("engine running", || fx.engine.running() == 1).await;

    shutdown.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, PhaseOutcome::Failed { .. }));
    assert_eq!(fx.engine.calls()[0].signals, vec![Signal::Cancel]);
    // The server never asked for the interrupt, so the phase errored
    assert_eq!(fx.run().status, RunStatus::Errored);
}

/// Point the fixture's config version at `artifact`
fn attach_artifact(fx: &Fixture, artifact: ArtifactId) {
    let cv = config_version("cv-ws-1", "ws-1").with_artifact(artifact);
    seed(&fx.ctx, vec![Event::ConfigVersionSaved { config_version: cv }]);
}

#[tokio::test]
async fn engine_receives_the_configuration_tarball() {
    let (fx, operation) = fixture().await;
    let artifact = fx.ctx.artifacts.put(b"tarball bytes".to_vec()).await.unwrap();
    attach_artifact(&fx, artifact);

    let outcome = operation.run().await;

    assert!(matches!(outcome, PhaseOutcome::Succeeded { .. }));
    assert_eq!(fx.engine.calls()[0].config, Some(b"tarball bytes".to_vec()));
}

#[tokio::test]
async fn version_without_content_runs_on_an_empty_workdir() {
    let (fx, operation) = fixture().await;

    operation.run().await;

    assert_eq!(fx.engine.calls()[0].config, None);
}

#[tokio::test]
async fn missing_tarball_fails_the_phase_without_running_the_engine() {
    let (fx, operation) = fixture().await;
    attach_artifact(&fx, ArtifactId::new("art-gone"));

    let outcome = operation.run().await;

    let PhaseOutcome::Failed { reason } = outcome else {
        panic!("expected failure");
    };
    assert!(reason.starts_with("configuration unavailable"), "got: {reason}");
    assert!(fx.engine.calls().is_empty());
    assert_eq!(fx.run().status, RunStatus::Errored);
    assert!(fx.log().is_end());
}

#[yare::parameterized(
    exit_with_tail = { EngineAdapterError::Failed { code: Some(2), stderr_tail: "a\nboom\n\n".into() }, "exit status 2: boom" },
    signal_no_tail = { EngineAdapterError::Failed { code: None, stderr_tail: String::new() }, "terminated by signal" },
    spawn          = { EngineAdapterError::Spawn("no such file".into()), "spawn failed: no such file" },
)]
fn failure_reasons(error: EngineAdapterError, expected: &str) {
    assert_eq!(failure_reason(&error), expected);
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::runs::RunService;
use crate::test_helpers::{ctx, seed_workspace};
use ot_core::test_support::{agent_workspace, chunk, workspace};
use ot_core::{
    ConfigVersionId, CreateOptions, FakeClock, LockHolder, Report, RunId, Workspace, WorkspaceId,
};
use std::time::Duration;

struct Fixture {
    ctx: Ctx<FakeClock>,
    runs: RunService<FakeClock>,
    jobs: JobService<FakeClock>,
}

fn fixture() -> Fixture {
    let ctx = ctx();
    seed_workspace(&ctx, &workspace("ws-1"));
    seed_workspace(&ctx, &agent_workspace("ws-agent", "apool-1"));
    seed_workspace(&ctx, &workspace("ws-auto").with_auto_apply(true));
    Fixture {
        runs: RunService::new(ctx.clone()),
        jobs: JobService::new(ctx.clone()),
        ctx,
    }
}

fn succeeded(additions: u32) -> PhaseOutcome {
    PhaseOutcome::Succeeded {
        report: Report::new(additions, 0, 0),
    }
}

impl Fixture {
    /// A run on `ws` with its plan job queued
    fn queued(&self, ws: &str) -> (Run, Job) {
        let run = self
            .runs
            .create(
                &WorkspaceId::new(ws),
                &ConfigVersionId::new(format!("cv-{ws}")),
                CreateOptions::default(),
            )
            .unwrap();
        self.runs.enqueue_plan(&run.id).unwrap();
        let job = self
            .ctx
            .store
            .read(|s| s.active_job(&run.id, Phase::Plan).cloned())
            .unwrap();
        (run, job)
    }

    fn builtin(&self) -> RunnerMeta {
        self.jobs.register("built-in", None, 2).unwrap()
    }

    /// Plan job claimed and started by a fresh built-in runner
    fn running(&self, ws: &str) -> (Run, Job, RunnerMeta) {
        let (run, job) = self.queued(ws);
        let runner = self.builtin();
        self.jobs.claim(&job.id, &runner.id).unwrap();
        self.jobs.start(&job.id, &runner.id).unwrap();
        (run, job, runner)
    }

    fn run(&self, id: &RunId) -> Run {
        self.runs.get(id).unwrap()
    }

    fn workspace(&self, id: &str) -> Workspace {
        self.ctx
            .store
            .read(|s| s.get_workspace(id).cloned())
            .unwrap()
    }
}

#[test]
fn only_one_claimant_wins() {
    let f = fixture();
    let (_, job) = f.queued("ws-1");
    let a = f.builtin();
    let b = f.builtin();

    let claimed = f.jobs.claim(&job.id, &a.id).unwrap();
    assert_eq!(claimed.status, JobStatus::Allocated);
    assert_eq!(claimed.runner_id, Some(a.id.clone()));
    assert!(matches!(
        f.jobs.claim(&job.id, &b.id),
        Err(EngineError::Conflict(_))
    ));
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let f = fixture();
    let (_, job) = f.queued("ws-1");
    let runners: Vec<RunnerMeta> = (0..8).map(|_| f.builtin()).collect();

    let handles: Vec<_> = runners
        .into_iter()
        .map(|runner| {
            let jobs = f.jobs.clone();
            let job_id = job.id.clone();
            std::thread::spawn(move || jobs.claim(&job_id, &runner.id).is_ok())
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);
}

#[test]
fn pools_only_match_their_own_jobs() {
    let f = fixture();
    let (_, remote_job) = f.queued("ws-1");
    let (_, agent_job) = f.queued("ws-agent");
    let builtin = f.builtin();
    let agent = f
        .jobs
        .register("agent-a", Some(AgentPoolId::new("apool-1")), 1)
        .unwrap();

    assert_eq!(
        f.jobs
            .list_unallocated(Some(&AgentPoolId::new("apool-1")))
            .iter()
            .map(|j| j.id.clone())
            .collect::<Vec<_>>(),
        vec![agent_job.id.clone()]
    );
    assert!(matches!(
        f.jobs.claim(&agent_job.id, &builtin.id),
        Err(EngineError::Validation(_))
    ));
    assert_eq!(
        f.jobs.claim_next(&agent.id).unwrap().map(|j| j.id),
        Some(agent_job.id)
    );
    assert_eq!(
        f.jobs.claim_next(&builtin.id).unwrap().map(|j| j.id),
        Some(remote_job.id)
    );
}

#[test]
fn runner_at_capacity_gets_nothing() {
    let f = fixture();
    f.queued("ws-1");
    f.queued("ws-agent");
    let agent = f
        .jobs
        .register("agent-a", Some(AgentPoolId::new("apool-1")), 1)
        .unwrap();
    let builtin = f.jobs.register("built-in", None, 1).unwrap();

    assert!(f.jobs.claim_next(&builtin.id).unwrap().is_some());
    let (_, second) = f.queued("ws-auto");
    assert!(f.jobs.claim_next(&builtin.id).unwrap().is_none());
    assert!(matches!(
        f.jobs.claim(&second.id, &builtin.id),
        Err(EngineError::Conflict(_))
    ));
    assert!(f.jobs.claim_next(&agent.id).unwrap().is_some());
}

#[test]
fn start_moves_run_into_planning() {
    let f = fixture();
    let (run, job) = f.queued("ws-1");
    let runner = f.builtin();
    f.jobs.claim(&job.id, &runner.id).unwrap();

    let assignment = f.jobs.start(&job.id, &runner.id).unwrap();
    assert_eq!(assignment.job.status, JobStatus::Running);
    assert_eq!(assignment.run.status, RunStatus::Planning);
    assert_eq!(f.run(&run.id).status, RunStatus::Planning);
}

#[test]
fn start_by_another_runner_is_rejected() {
    let f = fixture();
    let (_, job) = f.queued("ws-1");
    let a = f.builtin();
    let b = f.builtin();
    f.jobs.claim(&job.id, &a.id).unwrap();
    assert!(matches!(
        f.jobs.start(&job.id, &b.id),
        Err(EngineError::Conflict(_))
    ));
}

#[test]
fn progress_can_report_running() {
    let f = fixture();
    let (run, job) = f.queued("ws-1");
    let runner = f.builtin();
    f.jobs.claim(&job.id, &runner.id).unwrap();

    let progress = Progress {
        status: Some(JobStatus::Running),
        chunk: None,
    };
    assert_eq!(
        f.jobs.report_progress(&job.id, &runner.id, progress).unwrap(),
        None
    );
    assert_eq!(f.run(&run.id).status, RunStatus::Planning);

    let bad = Progress {
        status: Some(JobStatus::Finished),
        chunk: None,
    };
    assert!(matches!(
        f.jobs.report_progress(&job.id, &runner.id, bad),
        Err(EngineError::Validation(_))
    ));
}

#[test]
fn plan_with_changes_waits_for_confirmation() {
    let f = fixture();
    let (run, job, runner) = f.running("ws-1");

    let after = f.jobs.report_result(&job.id, &runner.id, succeeded(2)).unwrap();
    assert_eq!(after.status, RunStatus::Planned);
    assert_eq!(after.plan_report, Some(Report::new(2, 0, 0)));
    assert_eq!(f.jobs.get(&job.id).unwrap().status, JobStatus::Finished);
    assert_eq!(
        f.workspace("ws-1").lock,
        Some(LockHolder::Run(run.id.clone()))
    );
}

#[test]
fn plan_without_changes_finishes_and_unlocks() {
    let f = fixture();
    let (_, job, runner) = f.running("ws-1");
    let after = f.jobs.report_result(&job.id, &runner.id, succeeded(0)).unwrap();
    assert_eq!(after.status, RunStatus::PlannedAndFinished);
    assert_eq!(f.workspace("ws-1").lock, None);
}

#[test]
fn auto_apply_queues_apply_in_same_transaction() {
    let f = fixture();
    let (run, job, runner) = f.running("ws-auto");

    let after = f.jobs.report_result(&job.id, &runner.id, succeeded(1)).unwrap();
    assert_eq!(after.status, RunStatus::ApplyQueued);
    let apply = f
        .ctx
        .store
        .read(|s| s.active_job(&run.id, Phase::Apply).cloned())
        .unwrap();
    assert_eq!(apply.status, JobStatus::Unallocated);

    f.jobs.claim(&apply.id, &runner.id).unwrap();
    f.jobs.start(&apply.id, &runner.id).unwrap();
    let done = f
        .jobs
        .report_result(&apply.id, &runner.id, succeeded(1))
        .unwrap();
    assert_eq!(done.status, RunStatus::Applied);
    assert_eq!(done.apply_report, Some(Report::new(1, 0, 0)));
    assert_eq!(f.workspace("ws-auto").lock, None);
}

#[test]
fn engine_failure_errors_the_run_with_reason() {
    let f = fixture();
    let (_, job, runner) = f.running("ws-1");
    let outcome = PhaseOutcome::Failed {
        reason: "exit status 1: Error: invalid provider".into(),
    };
    let after = f.jobs.report_result(&job.id, &runner.id, outcome).unwrap();
    assert_eq!(after.status, RunStatus::Errored);
    assert_eq!(
        after.error.as_deref(),
        Some("exit status 1: Error: invalid provider")
    );
    let job = f.jobs.get(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Errored);
    assert_eq!(f.workspace("ws-1").lock, None);
}

#[test]
fn progress_appends_chunks_in_order() {
    let f = fixture();
    let (run, job, runner) = f.running("ws-1");
    let id = run.id.as_str();

    f.jobs
        .report_progress(&job.id, &runner.id, Progress::chunk(chunk(id, Phase::Plan, 0, b"\x02abc")))
        .unwrap();
    let gap = f.jobs.report_progress(
        &job.id,
        &runner.id,
        Progress::chunk(chunk(id, Phase::Plan, 9, b"zzz")),
    );
    assert!(matches!(gap, Err(EngineError::Conflict(_))));
    let empty = f.jobs.report_progress(
        &job.id,
        &runner.id,
        Progress::chunk(chunk(id, Phase::Plan, 4, b"")),
    );
    assert!(matches!(empty, Err(EngineError::Validation(_))));
    let wrong_phase = f.jobs.report_progress(
        &job.id,
        &runner.id,
        Progress::chunk(chunk(id, Phase::Apply, 0, b"\x02x")),
    );
    assert!(matches!(wrong_phase, Err(EngineError::Validation(_))));

    let len = f
        .ctx
        .store
        .read(|s| s.log(&LogKey::new(run.id.clone(), Phase::Plan)).map(|l| l.len()));
    assert_eq!(len, Some(4));
}

#[test]
fn progress_from_unassigned_runner_is_rejected() {
    let f = fixture();
    let (_, job, _) = f.running("ws-1");
    let other = f.builtin();
    assert!(matches!(
        f.jobs.report_progress(&job.id, &other.id, Progress::default()),
        Err(EngineError::Conflict(_))
    ));
}

#[test]
fn progress_returns_pending_interrupt() {
    let f = fixture();
    let (run, job, runner) = f.running("ws-1");
    assert_eq!(
        f.jobs
            .report_progress(&job.id, &runner.id, Progress::default())
            .unwrap(),
        None
    );
    f.runs.cancel(&run.id).unwrap();
    assert_eq!(
        f.jobs
            .report_progress(&job.id, &runner.id, Progress::default())
            .unwrap(),
        Some(Signal::Cancel)
    );
}

#[test]
fn acknowledged_cancel_cancels_run() {
    let f = fixture();
    let (run, job, runner) = f.running("ws-1");
    f.runs.cancel(&run.id).unwrap();
    let outcome = PhaseOutcome::Failed {
        reason: "interrupted".into(),
    };
    let after = f.jobs.report_result(&job.id, &runner.id, outcome).unwrap();
    assert_eq!(after.status, RunStatus::Canceled);
    assert_eq!(f.jobs.get(&job.id).unwrap().status, JobStatus::Canceled);
    assert_eq!(f.workspace("ws-1").lock, None);
}

#[test]
fn unacknowledged_cancel_is_forced_after_grace() {
    let f = fixture();
    let (run, job, runner) = f.running("ws-1");
    f.runs.cancel(&run.id).unwrap();

    f.ctx.clock.advance(Duration::from_secs(5));
    assert_eq!(f.jobs.expire_interrupts().unwrap(), 0);
    f.ctx.clock.advance(Duration::from_secs(5));
    assert_eq!(f.jobs.expire_interrupts().unwrap(), 1);
    assert_eq!(f.jobs.expire_interrupts().unwrap(), 0);

    assert_eq!(f.run(&run.id).status, RunStatus::ForceCanceled);
    assert_eq!(f.jobs.get(&job.id).unwrap().status, JobStatus::ForceCanceled);
    assert_eq!(f.workspace("ws-1").lock, None);

    // A late runner is told to stop and cannot finish the job
    assert_eq!(
        f.jobs
            .report_progress(&job.id, &runner.id, Progress::default())
            .unwrap(),
        Some(Signal::ForceCancel)
    );
    assert!(matches!(
        f.jobs.report_result(&job.id, &runner.id, succeeded(1)),
        Err(EngineError::Conflict(_))
    ));
}

#[test]
fn stale_runner_loses_allocated_jobs() {
    let f = fixture();
    let (_, allocated) = f.queued("ws-1");
    let (_, running, _) = f.running("ws-auto");
    let stale = f.builtin();
    f.jobs.claim(&allocated.id, &stale.id).unwrap();

    let healthy = f.builtin();
    f.ctx.clock.advance(Duration::from_secs(61));
    f.jobs.ping(&healthy.id, RunnerStatus::Idle).unwrap();

    assert_eq!(f.jobs.sweep_stale_runners().unwrap(), 2);
    let stale = f.ctx.store.read(|s| s.get_runner(stale.id.as_str()).cloned()).unwrap();
    assert_eq!(stale.status, RunnerStatus::Errored);
    let allocated = f.jobs.get(&allocated.id).unwrap();
    assert_eq!(allocated.status, JobStatus::Unallocated);
    assert_eq!(allocated.runner_id, None);
    assert_eq!(f.jobs.get(&running.id).unwrap().status, JobStatus::Running);
    assert_eq!(f.jobs.sweep_stale_runners().unwrap(), 0);
}

#[test]
fn deregister_returns_jobs_to_queue() {
    let f = fixture();
    let (_, job) = f.queued("ws-1");
    let runner = f.builtin();
    f.jobs.claim(&job.id, &runner.id).unwrap();

    f.jobs.deregister(&runner.id).unwrap();
    assert_eq!(f.jobs.get(&job.id).unwrap().status, JobStatus::Unallocated);
    assert!(f.ctx.store.read(|s| s.runners.is_empty()));
    assert!(matches!(
        f.jobs.deregister(&runner.id),
        Err(EngineError::NotFound(_))
    ));
}

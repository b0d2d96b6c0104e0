// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ot-core: domain records and transition rules for run scheduling

pub mod chunk;
pub mod clock;
pub mod cluster;
pub mod config_version;
pub mod event;
pub mod id;
pub mod job;
pub mod run;
pub mod runner;
pub mod workspace;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use chunk::{Chunk, ChunkError, LogKey, PhaseLog, END_MARKER, START_MARKER};
pub use clock::{Clock, FakeClock, SystemClock};
pub use cluster::{ChangeKind, ClusterEvent, Lease, Payload, ReplicaId, Table};
pub use config_version::{ArtifactId, ConfigVersion, ConfigVersionId};
pub use event::Event;
pub use id::{IdGen, SequentialIdGen, UuidIdGen};
pub use job::{Job, JobError, JobId, JobStatus, Signal};
pub use run::{
    CreateOptions, PeriodReport, Phase, PhaseOutcome, Report, Run, RunError, RunId, RunStatus,
    StatusPeriod,
};
pub use runner::{AgentPoolId, RunnerId, RunnerMeta, RunnerStatus};
pub use workspace::{ExecutionMode, LockError, LockHolder, UserId, Workspace, WorkspaceId};

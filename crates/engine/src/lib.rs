// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Run scheduling and execution coordination

pub mod artifacts;
pub mod authz;
pub mod bus;
mod config;
mod context;
mod error;
mod jobs;
mod logs;
mod relay;
mod replica;
pub mod runner;
mod runs;
mod scheduler;
pub mod sweepers;
mod workspaces;

#[cfg(test)]
mod test_helpers;

pub use artifacts::{ArtifactStore, DirArtifacts, MemoryArtifacts};
pub use authz::{AllowAll, Authorizer};
pub use bus::{EventBus, EventFilter, Subscription};
pub use config::{Backoff, EngineConfig};
pub use context::Ctx;
pub use error::EngineError;
pub use jobs::{Assignment, JobService, Progress};
pub use logs::{LogService, Tail};
pub use relay::Relay;
pub use replica::{Replica, ReplicaHandle};
pub use runner::{AgentChannel, BuiltInChannel, LoopState, RunnerChannel, RunnerLoop};
pub use runs::{CancelOutcome, RunFilter, RunService};
pub use scheduler::{schedule_workspace, Scheduler};
pub use sweepers::{RetentionSweeper, Retained, TimeoutSweeper, Watchdog};
pub use workspaces::WorkspaceService;

//! Behavioral specifications for ot.
//!
//! Daemon specs are black-box: they invoke the `otd` binary and check
//! stdout, stderr, exit codes and the state directory. Run specs drive
//! in-process replicas over a shared store with a scripted engine.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

#[path = "specs/prelude.rs"]
mod prelude;

// daemon/
#[path = "specs/daemon/help.rs"]
mod daemon_help;
#[path = "specs/daemon/lifecycle.rs"]
mod daemon_lifecycle;

// run/
#[path = "specs/run/cancel.rs"]
mod run_cancel;
#[path = "specs/run/lifecycle.rs"]
mod run_lifecycle;
#[path = "specs/run/logs.rs"]
mod run_logs;
#[path = "specs/run/queue.rs"]
mod run_queue;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ot daemon library
//!
//! Configuration, lifecycle, listener and wire protocol of `otd`, plus the
//! client side used by `ot-agent`. Exposed so the binaries stay thin.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod client;
pub mod config;
pub mod env;
pub mod lifecycle;
pub mod listener;
pub mod protocol;
pub mod remote;

#[cfg(test)]
mod test_helpers;

pub use client::{ClientError, DaemonClient, Endpoint};
pub use config::{ConfigError, DaemonConfig, FileConfig};
pub use listener::{ListenCtx, Listener};
pub use remote::RemoteChannel;
pub use lifecycle::{Daemon, LifecycleError, Paths};

/// `<package version>+<git hash>`
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "+", env!("BUILD_GIT_HASH"));

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon crate.
//!
//! Unparseable values are ignored, leaving the file or default value.

use std::path::PathBuf;
use std::time::Duration;

use crate::lifecycle::LifecycleError;

/// Resolve state directory: OT_STATE_DIR > XDG_STATE_HOME/ot > ~/.local/state/ot
pub fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Some(dir) = non_empty("OT_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Some(xdg) = non_empty("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg).join("ot"));
    }
    let home = non_empty("HOME").ok_or(LifecycleError::NoStateDir)?;
    Ok(PathBuf::from(home).join(".local/state/ot"))
}

/// Replica name override
pub fn replica() -> Option<String> {
    non_empty("OT_REPLICA")
}

/// Number of replicas hosted by this process
pub fn replicas() -> Option<usize> {
    non_empty("OT_REPLICAS").and_then(|s| s.trim().parse().ok())
}

/// `host:port` to accept TCP connections on, besides the Unix socket
pub fn listen_tcp() -> Option<String> {
    non_empty("OT_LISTEN_TCP")
}

/// Token TCP clients present in `Hello`
pub fn auth_token() -> Option<String> {
    non_empty("OT_AUTH_TOKEN")
}

/// Daemon an agent connects to: a socket path or `tcp://host:port`
pub fn server() -> Option<String> {
    non_empty("OT_SERVER")
}

pub fn agent_pool() -> Option<String> {
    non_empty("OT_AGENT_POOL")
}

pub fn agent_name() -> Option<String> {
    non_empty("OT_AGENT_NAME")
}

pub fn agent_max_jobs() -> Option<u32> {
    non_empty("OT_AGENT_MAX_JOBS").and_then(|s| s.trim().parse().ok())
}

/// Root of an agent's per-run working directories
pub fn agent_workdir() -> Option<PathBuf> {
    non_empty("OT_AGENT_WORKDIR").map(PathBuf::from)
}

pub fn grace_period() -> Option<Duration> {
    millis("OT_GRACE_PERIOD_MS")
}

pub fn planning_timeout() -> Option<Duration> {
    secs("OT_PLANNING_TIMEOUT_SECS")
}

pub fn applying_timeout() -> Option<Duration> {
    secs("OT_APPLYING_TIMEOUT_SECS")
}

pub fn timeout_scan_interval() -> Option<Duration> {
    secs("OT_TIMEOUT_SCAN_SECS")
}

pub fn run_retention() -> Option<Duration> {
    secs("OT_RUN_RETENTION_SECS")
}

pub fn config_version_retention() -> Option<Duration> {
    secs("OT_CONFIG_VERSION_RETENTION_SECS")
}

pub fn retention_scan_interval() -> Option<Duration> {
    secs("OT_RETENTION_SCAN_SECS")
}

/// Whether this replica runs the built-in runner (`true`/`false`/`1`/`0`)
pub fn builtin_runner() -> Option<bool> {
    match non_empty("OT_BUILTIN_RUNNER")?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn builtin_max_jobs() -> Option<u32> {
    non_empty("OT_BUILTIN_MAX_JOBS").and_then(|s| s.parse().ok())
}

pub fn event_buffer() -> Option<usize> {
    non_empty("OT_EVENT_BUFFER").and_then(|s| s.parse().ok())
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn millis(key: &str) -> Option<Duration> {
    non_empty(key)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn secs(key: &str) -> Option<Duration> {
    non_empty(key)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;

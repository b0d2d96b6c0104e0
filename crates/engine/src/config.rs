// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tunables for a replica's services and background loops.
//!
//! A zero scan interval disables the corresponding loop; a zero retention
//! age disables deletion of that kind of row.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration, resolved by the daemon from file and environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time a running job has to acknowledge a soft cancel
    pub grace_period: Duration,
    pub planning_timeout: Duration,
    pub applying_timeout: Duration,
    pub timeout_scan_interval: Duration,
    pub run_retention: Duration,
    pub config_version_retention: Duration,
    pub retention_scan_interval: Duration,
    /// Per-subscriber buffer of the local event bus
    pub event_buffer: usize,
    /// Longest a runner waits in one claim poll
    pub claim_poll_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// How often an operation flushes output and reports progress
    pub progress_interval: Duration,
    pub ping_interval: Duration,
    pub runner_stale_after: Duration,
    /// Cadence of the grace and stale-runner watchdog
    pub watchdog_interval: Duration,
    pub builtin_runner: bool,
    pub builtin_max_jobs: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            planning_timeout: Duration::from_secs(2 * 60 * 60),
            applying_timeout: Duration::from_secs(2 * 60 * 60),
            timeout_scan_interval: Duration::from_secs(60),
            run_retention: Duration::ZERO,
            config_version_retention: Duration::ZERO,
            retention_scan_interval: Duration::from_secs(60 * 60),
            event_buffer: 256,
            claim_poll_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            progress_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(10),
            runner_stale_after: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(1),
            builtin_runner: true,
            builtin_max_jobs: 5,
        }
    }
}

impl EngineConfig {
    pub fn grace_ms(&self) -> u64 {
        self.grace_period.as_millis() as u64
    }

    pub fn phase_timeout(&self, phase: ot_core::Phase) -> Duration {
        match phase {
            ot_core::Phase::Plan => self.planning_timeout,
            ot_core::Phase::Apply => self.applying_timeout,
        }
    }

    /// Lease lifetime for a sweeper scanning every `interval`
    pub fn lease_ttl(interval: Duration) -> Duration {
        interval.saturating_mul(3)
    }
}

/// Capped exponential backoff with full jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.backoff_initial, config.backoff_max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay, before jitter
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Next delay, uniformly drawn from `[ceiling / 2, ceiling]`
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::random_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `otd.toml` and its resolution into an [`EngineConfig`].
//!
//! Precedence, lowest first: built-in defaults, the file, environment
//! variables. Every file field is optional and the file itself may be
//! absent.
//!
//! ```toml
//! [scheduler]
//! replica = "otd-1"
//! replicas = 2
//!
//! [listen]
//! tcp = "0.0.0.0:7450"
//!
//! [runner]
//! builtin = true
//! max_jobs = 5
//!
//! [timeouts]
//! grace_period_ms = 10000
//! planning_secs = 7200
//!
//! [retention]
//! runs_secs = 2592000
//!
//! [bus]
//! buffer = 256
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ot_core::ReplicaId;
use ot_engine::EngineConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::env;

/// Replica name when neither the file nor the environment sets one
pub const DEFAULT_REPLICA: &str = "otd";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Contents of `otd.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub scheduler: SchedulerSection,
    pub listen: ListenSection,
    pub runner: RunnerSection,
    pub timeouts: TimeoutsSection,
    pub retention: RetentionSection,
    pub bus: BusSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub replica: Option<String>,
    /// Replicas hosted by this process, all over the same store
    pub replicas: Option<usize>,
    pub watchdog_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenSection {
    /// `host:port` for remote agents and clients; the token comes from
    /// `OT_AUTH_TOKEN`
    pub tcp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSection {
    pub builtin: Option<bool>,
    pub max_jobs: Option<u32>,
    pub claim_poll_timeout_ms: Option<u64>,
    pub progress_interval_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsSection {
    pub grace_period_ms: Option<u64>,
    pub planning_secs: Option<u64>,
    pub applying_secs: Option<u64>,
    pub scan_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionSection {
    pub runs_secs: Option<u64>,
    pub config_versions_secs: Option<u64>,
    pub scan_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusSection {
    pub buffer: Option<usize>,
}

impl FileConfig {
    /// Read `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Everything `otd` needs to start its replicas and listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Replica name, or the stem of the names when hosting several
    pub replica: ReplicaId,
    pub replicas: usize,
    pub listen_tcp: Option<String>,
    pub auth_token: Option<String>,
    pub engine: EngineConfig,
}

impl DaemonConfig {
    /// Load `path` and apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve(FileConfig::load(path)?)
    }

    pub fn resolve(file: FileConfig) -> Result<Self, ConfigError> {
        let replica = env::replica()
            .or(file.scheduler.replica.clone())
            .unwrap_or_else(|| DEFAULT_REPLICA.to_string());
        if replica.trim().is_empty() {
            return Err(ConfigError::Invalid("replica name is empty".to_string()));
        }

        let replicas = env::replicas().or(file.scheduler.replicas).unwrap_or(1);
        if replicas == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.replicas must be at least 1".to_string(),
            ));
        }

        let listen_tcp = env::listen_tcp().or(file.listen.tcp.clone());
        let auth_token = env::auth_token();
        if listen_tcp.is_some() && auth_token.is_none() {
            return Err(ConfigError::Invalid(
                "listen.tcp requires OT_AUTH_TOKEN".to_string(),
            ));
        }

        let mut engine = EngineConfig::default();
        apply_file(&mut engine, &file);
        apply_env(&mut engine);
        validate(&engine)?;

        Ok(Self {
            replica: ReplicaId::new(replica),
            replicas,
            listen_tcp,
            auth_token,
            engine,
        })
    }

    /// One id per hosted replica: the configured name alone, or
    /// `<name>-<n>` counting from 1 when there are several
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        if self.replicas == 1 {
            return vec![self.replica.clone()];
        }
        (1..=self.replicas)
            .map(|n| ReplicaId::new(format!("{}-{n}", self.replica)))
            .collect()
    }
}

fn apply_file(engine: &mut EngineConfig, file: &FileConfig) {
    let ms = |v: Option<u64>| v.map(Duration::from_millis);
    let secs = |v: Option<u64>| v.map(Duration::from_secs);

    set(&mut engine.watchdog_interval, ms(file.scheduler.watchdog_interval_ms));

    let runner = &file.runner;
    set(&mut engine.builtin_runner, runner.builtin);
    set(&mut engine.builtin_max_jobs, runner.max_jobs);
    set(&mut engine.claim_poll_timeout, ms(runner.claim_poll_timeout_ms));
    set(&mut engine.progress_interval, ms(runner.progress_interval_ms));
    set(&mut engine.ping_interval, ms(runner.ping_interval_ms));
    set(&mut engine.runner_stale_after, secs(runner.stale_after_secs));
    set(&mut engine.backoff_initial, ms(runner.backoff_initial_ms));
    set(&mut engine.backoff_max, ms(runner.backoff_max_ms));

    let timeouts = &file.timeouts;
    set(&mut engine.grace_period, ms(timeouts.grace_period_ms));
    set(&mut engine.planning_timeout, secs(timeouts.planning_secs));
    set(&mut engine.applying_timeout, secs(timeouts.applying_secs));
    set(&mut engine.timeout_scan_interval, secs(timeouts.scan_interval_secs));

    let retention = &file.retention;
    set(&mut engine.run_retention, secs(retention.runs_secs));
    set(&mut engine.config_version_retention, secs(retention.config_versions_secs));
    set(&mut engine.retention_scan_interval, secs(retention.scan_interval_secs));

    set(&mut engine.event_buffer, file.bus.buffer);
}

fn apply_env(engine: &mut EngineConfig) {
    set(&mut engine.grace_period, env::grace_period());
    set(&mut engine.planning_timeout, env::planning_timeout());
    set(&mut engine.applying_timeout, env::applying_timeout());
    set(&mut engine.timeout_scan_interval, env::timeout_scan_interval());
    set(&mut engine.run_retention, env::run_retention());
    set(&mut engine.config_version_retention, env::config_version_retention());
    set(&mut engine.retention_scan_interval, env::retention_scan_interval());
    set(&mut engine.builtin_runner, env::builtin_runner());
    set(&mut engine.builtin_max_jobs, env::builtin_max_jobs());
    set(&mut engine.event_buffer, env::event_buffer());
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn validate(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.builtin_runner && engine.builtin_max_jobs == 0 {
        return Err(ConfigError::Invalid(
            "runner.max_jobs must be at least 1".to_string(),
        ));
    }
    if engine.event_buffer == 0 {
        return Err(ConfigError::Invalid(
            "bus.buffer must be at least 1".to_string(),
        ));
    }
    if engine.backoff_initial > engine.backoff_max {
        return Err(ConfigError::Invalid(format!(
            "runner.backoff_initial_ms ({}) exceeds runner.backoff_max_ms ({})",
            engine.backoff_initial.as_millis(),
            engine.backoff_max.as_millis()
        )));
    }
    if engine.claim_poll_timeout.is_zero()
        || engine.ping_interval.is_zero()
        || engine.progress_interval.is_zero()
    {
        return Err(ConfigError::Invalid(
            "runner poll, ping and progress intervals must be non-zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

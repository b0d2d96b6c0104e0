// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IaC engine adapters
//!
//! An `EngineAdapter` executes one phase (plan or apply) of a run. Output is
//! streamed as raw bytes on an mpsc channel while the phase runs; interrupt
//! requests arrive on a watch channel:
//!
//! ```text
//! runner ──watch<Option<Signal>>──▶ execute() ──mpsc<Vec<u8>>──▶ log writer
//!                                      │
//!                                      └──▶ Result<Report, EngineAdapterError>
//! ```

mod process;
mod report;

pub use process::ProcessEngine;
pub use report::{parse_report, ReportScanner};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{EngineCall, FakeEngine, FakeOutcome};

use async_trait::async_trait;
use ot_core::{ConfigVersionId, Phase, Report, Run, RunId, Signal};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors from phase execution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineAdapterError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("engine exited with {code:?}: {stderr_tail}")]
    Failed {
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("interrupted by {0}")]
    Interrupted(Signal),
    #[error("unrecognized engine output: {0}")]
    Output(String),
    #[error("io error: {0}")]
    Io(String),
    /// Configuration tarball missing or not unpackable
    #[error("configuration unavailable: {0}")]
    Config(String),
}

impl From<std::io::Error> for EngineAdapterError {
    fn from(e: std::io::Error) -> Self {
        EngineAdapterError::Io(e.to_string())
    }
}

/// Inputs for executing one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRequest {
    pub run_id: RunId,
    pub phase: Phase,
    pub config_version_id: ConfigVersionId,
    pub is_destroy: bool,
    pub refresh: bool,
    pub target_addrs: Vec<String>,
    pub replace_addrs: Vec<String>,
    /// Tarball unpacked into the workdir before the engine starts
    pub config: Option<Vec<u8>>,
}

impl PhaseRequest {
    pub fn for_run(run: &Run, phase: Phase) -> Self {
        Self {
            run_id: run.id.clone(),
            phase,
            config_version_id: run.config_version_id.clone(),
            is_destroy: run.is_destroy,
            refresh: run.refresh,
            target_addrs: run.target_addrs.clone(),
            replace_addrs: run.replace_addrs.clone(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: Option<Vec<u8>>) -> Self {
        self.config = config;
        self
    }

    /// Engine command-line arguments for this phase.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.phase.to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
        ];
        match self.phase {
            Phase::Plan => {
                if self.is_destroy {
                    args.push("-destroy".to_string());
                }
                if !self.refresh {
                    args.push("-refresh=false".to_string());
                }
                args.extend(self.target_addrs.iter().map(|a| format!("-target={a}")));
                args.extend(self.replace_addrs.iter().map(|a| format!("-replace={a}")));
            }
            Phase::Apply => {
                args.push("-auto-approve".to_string());
                if self.is_destroy {
                    args.push("-destroy".to_string());
                }
            }
        }
        args
    }
}

/// Adapter executing IaC phases
#[async_trait]
pub trait EngineAdapter: Clone + Send + Sync + 'static {
    /// Execute a phase to completion.
    ///
    /// Bytes written by the engine are sent on `output` as they arrive. A
    /// `Signal::Cancel` on `signals` interrupts the engine gracefully and a
    /// `Signal::ForceCancel` kills it. An interrupted phase returns
    /// `EngineAdapterError::Interrupted` whatever the engine's exit status.
    async fn execute(
        &self,
        request: PhaseRequest,
        output: mpsc::Sender<Vec<u8>>,
        signals: watch::Receiver<Option<Signal>>,
    ) -> Result<Report, EngineAdapterError>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake engine adapter for testing
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{EngineAdapter, EngineAdapterError, PhaseRequest};
use async_trait::async_trait;
use ot_core::{Phase, Report, RunId, Signal};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Scripted result of one `execute` call
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// Write `output`, then succeed with `report`
    Succeed { output: Vec<u8>, report: Report },
    /// Write `output`, then fail as a non-zero exit
    Fail { output: Vec<u8>, stderr: String },
    /// Write `output`, then run until interrupted. With `honor_soft` a
    /// soft cancel ends the phase; otherwise only a force cancel does.
    Hang { output: Vec<u8>, honor_soft: bool },
}

impl FakeOutcome {
    pub fn succeed(report: Report) -> Self {
        FakeOutcome::Succeed {
            output: format!(
                "Plan: {} to add, {} to change, {} to destroy.\n",
                report.additions, report.changes, report.destructions
            )
            .into_bytes(),
            report,
        }
    }

    pub fn fail(stderr: &str) -> Self {
        FakeOutcome::Fail {
            output: Vec::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn hang(honor_soft: bool) -> Self {
        FakeOutcome::Hang {
            output: b"working...\n".to_vec(),
            honor_soft,
        }
    }
}

/// Recorded execute call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub run_id: RunId,
    pub phase: Phase,
    /// Signals observed while executing, in order
    pub signals: Vec<Signal>,
    pub finished: bool,
    /// Configuration tarball handed to the phase
    pub config: Option<Vec<u8>>,
}

struct FakeEngineState {
    script: VecDeque<FakeOutcome>,
    calls: Vec<EngineCall>,
}

/// Fake engine returning scripted outcomes.
///
/// When the script is empty every phase succeeds with one addition, so an
/// unscripted run plans with changes and applies cleanly.
#[derive(Clone)]
pub struct FakeEngine {
    inner: Arc<Mutex<FakeEngineState>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeEngineState {
                script: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next unscripted `execute`.
    pub fn push(&self, outcome: FakeOutcome) {
        self.inner.lock().script.push_back(outcome);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.inner.lock().calls.clone()
    }

    /// Calls still executing
    pub fn running(&self) -> usize {
        self.inner.lock().calls.iter().filter(|c| !c.finished).count()
    }

    fn record_signal(&self, index: usize, signal: Signal) {
        if let Some(call) = self.inner.lock().calls.get_mut(index) {
            call.signals.push(signal);
        }
    }

    fn finish(&self, index: usize) {
        if let Some(call) = self.inner.lock().calls.get_mut(index) {
            call.finished = true;
        }
    }
}

#[async_trait]
impl EngineAdapter for FakeEngine {
    async fn execute(
        &self,
        request: PhaseRequest,
        output: mpsc::Sender<Vec<u8>>,
        mut signals: watch::Receiver<Option<Signal>>,
    ) -> Result<Report, EngineAdapterError> {
        let (index, outcome) = {
            let mut inner = self.inner.lock();
            inner.calls.push(EngineCall {
                run_id: request.run_id.clone(),
                phase: request.phase,
                signals: Vec::new(),
                finished: false,
                config: request.config.clone(),
            });
            let outcome = inner
                .script
                .pop_front()
                .unwrap_or_else(|| FakeOutcome::succeed(Report::new(1, 0, 0)));
            (inner.calls.len() - 1, outcome)
        };

        let result = match outcome {
            FakeOutcome::Succeed { output: bytes, report } => {
                let _ = output.send(bytes).await;
                Ok(report)
            }
            FakeOutcome::Fail {
                output: bytes,
                stderr,
            } => {
                let _ = output.send(bytes).await;
                let _ = output.send(stderr.clone().into_bytes()).await;
                Err(EngineAdapterError::Failed {
                    code: Some(1),
                    stderr_tail: stderr,
                })
            }
            FakeOutcome::Hang {
                output: bytes,
                honor_soft,
            } => {
                let _ = output.send(bytes).await;
                loop {
                    if signals.changed().await.is_err() {
                        // Runner dropped the control channel
                        break Err(EngineAdapterError::Interrupted(Signal::ForceCancel));
                    }
                    let Some(signal) = *signals.borrow_and_update() else {
                        continue;
                    };
                    self.record_signal(index, signal);
                    match signal {
                        Signal::Cancel if honor_soft => {
                            let _ = output.send(b"interrupted\n".to_vec()).await;
                            break Err(EngineAdapterError::Interrupted(Signal::Cancel));
                        }
                        Signal::Cancel => {}
                        Signal::ForceCancel => {
                            break Err(EngineAdapterError::Interrupted(Signal::ForceCancel));
                        }
                    }
                }
            }
        };
        self.finish(index);
        result
    }
}

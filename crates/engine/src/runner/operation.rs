// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One job executing on a runner.
//!
//! The run's configuration tarball is downloaded first and handed to the
//! engine. The engine runs while the operation forwards its output as log chunks
//! on every progress tick. Each progress report doubles as a heartbeat and
//! may come back with an interrupt, which is passed to the engine.

use super::{stronger, RunnerChannel};
use crate::config::{Backoff, EngineConfig};
use crate::error::EngineError;
use crate::jobs::Assignment;
use ot_adapters::{EngineAdapter, EngineAdapterError, PhaseRequest};
use ot_core::{Chunk, JobId, Phase, PhaseOutcome, RunId, RunnerId, Signal, END_MARKER, START_MARKER};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Attempts for reports that must land before the operation ends
const FINAL_REPORT_ATTEMPTS: u32 = 5;

/// Unacknowledged log output of one phase.
///
/// Bytes stay pending until a progress report carrying them succeeds, so a
/// failed report resends the same span at the same offset.
#[derive(Debug)]
pub(crate) struct LogWriter {
    run_id: RunId,
    phase: Phase,
    offset: u64,
    pending: Vec<u8>,
    started: bool,
}

impl LogWriter {
    pub(crate) fn new(run_id: RunId, phase: Phase) -> Self {
        Self {
            run_id,
            phase,
            offset: 0,
            pending: Vec::new(),
            started: false,
        }
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        if !self.started {
            self.pending.push(START_MARKER);
            self.started = true;
        }
        self.pending.extend_from_slice(bytes);
    }

    /// Close the log. A phase that wrote nothing still gets both markers.
    pub(crate) fn finish(&mut self) {
        self.write(&[]);
        self.pending.push(END_MARKER);
    }

    /// Pending bytes as a chunk at the acknowledged offset
    pub(crate) fn chunk(&self) -> Option<Chunk> {
        if self.pending.is_empty() {
            return None;
        }
        Some(Chunk::new(
            self.run_id.clone(),
            self.phase,
            self.offset,
            self.pending.clone(),
        ))
    }

    pub(crate) fn ack(&mut self, len: usize) {
        let len = len.min(self.pending.len());
        self.pending.drain(..len);
        self.offset += len as u64;
    }

    /// Give up on pending bytes the server refused. The offset stays put so
    /// later output still lines up with what the server holds.
    pub(crate) fn discard(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }
}

pub(crate) struct Operation<R, E> {
    pub(crate) channel: R,
    pub(crate) engine: E,
    pub(crate) runner: RunnerId,
    pub(crate) assignment: Assignment,
    pub(crate) config: Arc<EngineConfig>,
    /// Cancelled when the runner drains; the engine gets a soft cancel
    pub(crate) shutdown: CancellationToken,
}

impl<R: RunnerChannel, E: EngineAdapter> Operation<R, E> {
    pub(crate) fn job_id(&self) -> &JobId {
        &self.assignment.job.id
    }

    /// Execute the phase and report its outcome. Returns what was reported.
    pub(crate) async fn run(self) -> PhaseOutcome {
        let job = &self.assignment.job;
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (signal_tx, signal_rx) = watch::channel(None);
        let mut pushed = self.channel.interrupts(&job.id);
        let mut writer = LogWriter::new(job.run_id.clone(), job.phase);
        let mut signaled: Option<Signal> = None;
        let mut tick = tokio::time::interval(self.config.progress_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(job_id = %job.id, run_id = %job.run_id, phase = %job.phase, "operation started");
        let result = match self.download_config().await {
            Err(reason) => Err(EngineAdapterError::Config(reason)),
            Ok(config) => {
                let request =
                    PhaseRequest::for_run(&self.assignment.run, job.phase).with_config(config);
                let execution = self.engine.execute(request, out_tx, signal_rx);
                tokio::pin!(execution);

                loop {
                    tokio::select! {
                        result = &mut execution => break result,
                        Some(bytes) = out_rx.recv() => writer.write(&bytes),
                        _ = tick.tick() => {
                            let signal = self.flush(&mut writer).await;
                            self.deliver(&signal_tx, &mut signaled, signal);
                        }
                        Some(signal) = next_pushed(&mut pushed) => {
                            self.deliver(&signal_tx, &mut signaled, Some(signal));
                        }
                        _ = self.shutdown.cancelled(), if signaled.is_none() => {
                            self.deliver(&signal_tx, &mut signaled, Some(Signal::Cancel));
                        }
                    }
                }
            }
        };
        while let Ok(bytes) = out_rx.try_recv() {
            writer.write(&bytes);
        }

        let outcome = match result {
            Ok(report) => PhaseOutcome::Succeeded { report },
            Err(e) => {
                let reason = failure_reason(&e);
                writer.write(format!("\nError: {reason}\n").as_bytes());
                PhaseOutcome::Failed { reason }
            }
        };
        writer.finish();

        let mut backoff = Backoff::from_config(&self.config);
        loop {
            match self.send_chunk(&mut writer).await {
                Err(EngineError::Transient(reason)) if backoff.attempt() + 1 < FINAL_REPORT_ATTEMPTS => {
                    self.pause(&mut backoff, "final log flush", &reason).await;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "final log output lost");
                    break;
                }
                Ok(_) => break,
            }
        }

        backoff.reset();
        let reported = loop {
            match self
                .channel
                .report_result(&job.id, &self.runner, outcome.clone())
                .await
            {
                Err(EngineError::Transient(reason)) if backoff.attempt() + 1 < FINAL_REPORT_ATTEMPTS => {
                    self.pause(&mut backoff, "result", &reason).await;
                }
                other => break other,
            }
        };
        match reported {
            Ok(()) => info!(job_id = %job.id, run_id = %job.run_id, "operation finished"),
            Err(EngineError::Conflict(reason)) => {
                // Force-canceled while the engine was still running
                info!(job_id = %job.id, %reason, "result superseded");
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "result not recorded"),
        }
        outcome
    }

    /// Configuration tarball for the run, retrying transient failures.
    /// Anything else fails the phase with the returned reason.
    async fn download_config(&self) -> Result<Option<Vec<u8>>, String> {
        let cv = &self.assignment.run.config_version_id;
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            match self.channel.download_config(cv).await {
                Ok(config) => return Ok(config),
                Err(EngineError::Transient(reason))
                    if backoff.attempt() + 1 < FINAL_REPORT_ATTEMPTS =>
                {
                    self.pause(&mut backoff, "configuration download", &reason).await;
                }
                Err(e) => {
                    warn!(job_id = %self.job_id(), config_version_id = %cv, error = %e, "configuration unavailable");
                    return Err(e.to_string());
                }
            }
        }
    }

    /// Report progress with any pending output. Returns the interrupt the
    /// server asked for.
    async fn flush(&self, writer: &mut LogWriter) -> Option<Signal> {
        match self.send_chunk(writer).await {
            Ok(signal) => signal,
            Err(EngineError::Transient(reason)) => {
                warn!(job_id = %self.job_id(), %reason, "progress not reported, will resend");
                None
            }
            Err(e) => {
                warn!(
                    job_id = %self.job_id(),
                    offset = writer.offset(),
                    error = %e,
                    "progress rejected, dropping pending output"
                );
                writer.discard();
                None
            }
        }
    }

    async fn send_chunk(&self, writer: &mut LogWriter) -> Result<Option<Signal>, EngineError> {
        let chunk = writer.chunk();
        let len = chunk.as_ref().map_or(0, |c| c.data.len());
        let signal = self
            .channel
            .report_progress(self.job_id(), &self.runner, chunk)
            .await?;
        writer.ack(len);
        Ok(signal)
    }

    fn deliver(
        &self,
        tx: &watch::Sender<Option<Signal>>,
        signaled: &mut Option<Signal>,
        incoming: Option<Signal>,
    ) {
        let next = stronger(*signaled, incoming);
        if next == *signaled {
            return;
        }
        *signaled = next;
        if let Some(signal) = next {
            info!(job_id = %self.job_id(), %signal, "interrupting engine");
        }
        tx.send_replace(next);
    }

    async fn pause(&self, backoff: &mut Backoff, what: &str, reason: &str) {
        let delay = backoff.next_delay();
        warn!(job_id = %self.job_id(), what, %reason, ?delay, "report failed, retrying");
        tokio::time::sleep(delay).await;
    }
}

/// Next interrupt pushed out of band. Pends forever on channels without a
/// push path or once the sender is gone.
async fn next_pushed(rx: &mut Option<watch::Receiver<Option<Signal>>>) -> Option<Signal> {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    if inner.changed().await.is_err() {
        *rx = None;
        return std::future::pending().await;
    }
    *inner.borrow_and_update()
}

/// Reason recorded on the run for a failed phase
pub(crate) fn failure_reason(error: &EngineAdapterError) -> String {
    match error {
        EngineAdapterError::Failed { code, stderr_tail } => {
            let status = match code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            };
            match stderr_tail.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(line) => format!("{status}: {}", line.trim()),
                None => status,
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "operation_tests.rs"]
mod tests;

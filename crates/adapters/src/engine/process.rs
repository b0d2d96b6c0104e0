// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine adapter running the IaC binary as a child process

use super::{EngineAdapter, EngineAdapterError, PhaseRequest, ReportScanner};
use crate::subprocess::{run_with_timeout, send_signal, SIGNAL_TIMEOUT};
use async_trait::async_trait;
use ot_core::{Phase, Report, Signal};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Bytes of stderr kept for error reports
const STDERR_TAIL_BYTES: usize = 4096;

const READ_BUF_BYTES: usize = 8192;

/// Name of the configuration tarball while it is being unpacked
const CONFIG_TARBALL: &str = ".ot-config.tar";

const UNPACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Unpack `tarball` into `workdir` with the system `tar`, which also
/// detects gzip compression. The tarball is removed afterwards.
async fn unpack(workdir: &Path, tarball: &[u8]) -> Result<(), EngineAdapterError> {
    let path = workdir.join(CONFIG_TARBALL);
    tokio::fs::write(&path, tarball).await?;

    let mut cmd = Command::new("tar");
    cmd.arg("-xf")
        .arg(CONFIG_TARBALL)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let result = run_with_timeout(cmd, UNPACK_TIMEOUT, "tar -xf").await;
    let _ = tokio::fs::remove_file(&path).await;

    let output = result.map_err(EngineAdapterError::Config)?;
    if !output.status.success() {
        return Err(EngineAdapterError::Config(format!(
            "tar -xf: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Runs `<binary> plan|apply ...` in `<workdir_root>/<run_id>`, after
/// unpacking the request's configuration tarball there.
///
/// The child is killed if the execute future is dropped, so a runner that
/// goes away never leaves an engine process behind.
#[derive(Clone, Debug)]
pub struct ProcessEngine {
    binary: PathBuf,
    workdir_root: PathBuf,
}

impl ProcessEngine {
    pub fn new(binary: impl Into<PathBuf>, workdir_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workdir_root: workdir_root.into(),
        }
    }

    /// Binary from `OT_ENGINE_BIN` (default `terraform`).
    pub fn from_env(workdir_root: impl Into<PathBuf>) -> Self {
        Self::new(crate::env::engine_bin(), workdir_root)
    }
}

/// What a pump keeps of a stream besides forwarding it
trait Retain: Send + 'static {
    fn feed(&mut self, bytes: &[u8]);
}

impl Retain for ReportScanner {
    fn feed(&mut self, bytes: &[u8]) {
        ReportScanner::feed(self, bytes);
    }
}

/// Last `limit` bytes of a stream
struct Tail {
    bytes: Vec<u8>,
    limit: usize,
}

impl Retain for Tail {
    fn feed(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        if self.bytes.len() > self.limit {
            self.bytes.drain(..self.bytes.len() - self.limit);
        }
    }
}

/// Forward everything read from `reader` to `output`, handing it to `keep`
/// on the way.
fn pump<R, K>(mut reader: R, output: mpsc::Sender<Vec<u8>>, mut keep: K) -> JoinHandle<K>
where
    R: AsyncRead + Unpin + Send + 'static,
    K: Retain,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_BYTES];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            keep.feed(&buf[..n]);
            // Log writer gone: keep draining so the child never blocks on a full pipe
            let _ = output.send(buf[..n].to_vec()).await;
        }
        keep
    })
}

#[async_trait]
impl EngineAdapter for ProcessEngine {
    async fn execute(
        &self,
        request: PhaseRequest,
        output: mpsc::Sender<Vec<u8>>,
        mut signals: watch::Receiver<Option<Signal>>,
    ) -> Result<Report, EngineAdapterError> {
        let workdir = self.workdir_root.join(request.run_id.as_str());
        tokio::fs::create_dir_all(&workdir).await?;
        if let Some(tarball) = &request.config {
            unpack(&workdir, tarball).await?;
            tracing::debug!(run_id = %request.run_id, bytes = tarball.len(), "configuration unpacked");
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(request.args())
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineAdapterError::Spawn(format!("{}: {e}", self.binary.display())))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .map(|r| pump(r, output.clone(), ReportScanner::new(request.phase)));
        let stderr = child.stderr.take().map(|r| {
            let tail = Tail {
                bytes: Vec::new(),
                limit: STDERR_TAIL_BYTES,
            };
            pump(r, output.clone(), tail)
        });

        let mut interrupted: Option<Signal> = None;
        let mut listening = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                changed = signals.changed(), if listening => {
                    if changed.is_err() {
                        listening = false;
                        continue;
                    }
                    let signal = *signals.borrow_and_update();
                    let Some(pid) = pid else { continue };
                    match (signal, interrupted) {
                        (Some(Signal::Cancel), None) => {
                            tracing::info!(pid, "interrupting engine");
                            interrupted = Some(Signal::Cancel);
                            if let Err(e) = send_signal("-INT", pid, SIGNAL_TIMEOUT).await {
                                tracing::warn!(pid, error = %e, "interrupt failed");
                            }
                        }
                        (Some(Signal::ForceCancel), _) => {
                            tracing::warn!(pid, "killing engine");
                            interrupted = Some(Signal::ForceCancel);
                            listening = false;
                            if let Err(e) = send_signal("-KILL", pid, SIGNAL_TIMEOUT).await {
                                tracing::warn!(pid, error = %e, "kill failed");
                            }
                        }
                        _ => {}
                    }
                }
            }
        };

        let report = match stdout {
            Some(task) => task.await.ok().and_then(ReportScanner::finish),
            None => None,
        };
        let stderr_tail = match stderr {
            Some(task) => task.await.map(|tail| tail.bytes).unwrap_or_default(),
            None => Vec::new(),
        };

        if let Some(signal) = interrupted {
            return Err(EngineAdapterError::Interrupted(signal));
        }
        if !status.success() {
            return Err(EngineAdapterError::Failed {
                code: status.code(),
                stderr_tail: String::from_utf8_lossy(&stderr_tail).trim().to_string(),
            });
        }

        report.ok_or_else(|| {
            let what = match request.phase {
                Phase::Plan => "plan summary",
                Phase::Apply => "apply summary",
            };
            EngineAdapterError::Output(format!("no {what} in engine output"))
        })
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subprocess execution helpers

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Timeout for delivering a signal with `kill`.
pub const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a subprocess command with a timeout.
///
/// The child process is killed automatically if the timeout elapses (via the
/// tokio `Child` drop implementation).
pub async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    description: &str,
) -> Result<Output, String> {
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(io_err)) => Err(format!("{} failed: {}", description, io_err)),
        Err(_elapsed) => Err(format!(
            "{} timed out after {}s",
            description,
            timeout.as_secs()
        )),
    }
}

/// Send `signal` (e.g. `-INT`, `-KILL`) to `pid` using `kill`.
pub async fn send_signal(signal: &str, pid: u32, timeout: Duration) -> Result<(), String> {
    let mut cmd = Command::new("kill");
    cmd.args([signal, &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let description = format!("kill {signal} {pid}");
    let output = run_with_timeout(cmd, timeout, &description).await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{description}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
#[path = "subprocess_tests.rs"]
mod tests;

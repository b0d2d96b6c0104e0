// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Traced adapter wrappers for consistent observability

use crate::engine::{EngineAdapter, EngineAdapterError, PhaseRequest};
use async_trait::async_trait;
use ot_core::{Report, Signal};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// Wrapper that adds tracing to any EngineAdapter
#[derive(Clone)]
pub struct TracedEngine<E> {
    inner: E,
}

impl<E> TracedEngine<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<E: EngineAdapter> EngineAdapter for TracedEngine<E> {
    async fn execute(
        &self,
        request: PhaseRequest,
        output: mpsc::Sender<Vec<u8>>,
        signals: watch::Receiver<Option<Signal>>,
    ) -> Result<Report, EngineAdapterError> {
        let span = tracing::info_span!(
            "engine.execute",
            run_id = %request.run_id,
            phase = %request.phase,
        );
        async {
            tracing::info!(
                destroy = request.is_destroy,
                targets = request.target_addrs.len(),
                "starting"
            );
            let start = std::time::Instant::now();
            let result = self.inner.execute(request, output, signals).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match &result {
                Ok(report) => tracing::info!(elapsed_ms, %report, "phase finished"),
                Err(EngineAdapterError::Interrupted(signal)) => {
                    tracing::info!(elapsed_ms, %signal, "phase interrupted")
                }
                Err(e) => tracing::error!(elapsed_ms, error = %e, "phase failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[path = "traced_tests.rs"]
mod tests;

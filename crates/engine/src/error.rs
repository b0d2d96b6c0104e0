// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for engine services

use ot_core::{ChunkError, JobError, LockError, RunError, Table};
use ot_storage::StoreError;
use thiserror::Error;

/// Errors returned by engine services.
///
/// `Conflict` and `Transient` are worth retrying; the rest are final for the
/// request that produced them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request or one the run's status does not allow; rejected
    /// synchronously
    #[error("invalid request: {0}")]
    Validation(String),
    /// Lock held, job already claimed, or a concurrent update won
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Store or connection trouble
    #[error("transient failure: {0}")]
    Transient(String),
    /// Engine exited non-zero
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_) | EngineError::Transient(_))
    }

    pub fn not_found(table: Table, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{table} {id}"))
    }

    /// A state the services never produce. Logged as a bug.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "invariant violated");
        EngineError::Invariant(message)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { table, id } => EngineError::not_found(table, id),
            StoreError::Conflict(msg) => EngineError::Conflict(msg),
            StoreError::Wal(_) | StoreError::Snapshot(_) => EngineError::Transient(err.to_string()),
        }
    }
}

impl From<RunError> for EngineError {
    fn from(err: RunError) -> Self {
        match err {
            // Lost a race with a runner starting the same phase
            RunError::AlreadyStarted(_) => EngineError::Conflict(err.to_string()),
            RunError::InvalidTransition { .. }
            | RunError::NotConfirmable(_)
            | RunError::PlanOnly
            | RunError::NotCancelable(_)
            | RunError::CancelAlreadySignaled
            | RunError::NotDiscardable(_)
            | RunError::ForceCancelUnavailable => EngineError::Validation(err.to_string()),
        }
    }
}

impl From<JobError> for EngineError {
    fn from(err: JobError) -> Self {
        EngineError::Conflict(err.to_string())
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::NotLocked => EngineError::Validation(err.to_string()),
            LockError::AlreadyLocked(_) | LockError::HeldByOther { .. } => {
                EngineError::Conflict(err.to_string())
            }
        }
    }
}

impl From<ChunkError> for EngineError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Empty => EngineError::Validation(err.to_string()),
            ChunkError::OffsetMismatch { .. } | ChunkError::Complete => {
                EngineError::Conflict(err.to_string())
            }
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

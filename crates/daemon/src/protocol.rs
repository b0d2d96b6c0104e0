// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request protocol spoken by `otd`, its clients and remote agents.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload
//!
//! A connection carries one request, optionally preceded by `Hello`. TCP
//! connections must open with `Hello` carrying the auth token. `Watch` and
//! `Tail` answer `Ok` (or `Error`), then a stream of frames closed by `End`;
//! everything else answers with a single frame.

use ot_core::{
    AgentPoolId, Chunk, ClusterEvent, ConfigVersion, ConfigVersionId, CreateOptions, Job, JobId,
    LockHolder, Phase, PhaseOutcome, Run, RunId, RunnerId, RunnerMeta, RunnerStatus, Signal,
    Table, UserId, Workspace, WorkspaceId,
};
use ot_engine::{Assignment, CancelOutcome, EngineError, EventFilter, RunFilter};
use serde::{Deserialize, Serialize};

#[path = "protocol_wire.rs"]
mod wire;
pub use wire::{
    decode, encode, read_message, read_request, write_message, write_response, ProtocolError,
    DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE,
};

/// Version exchanged in the `Hello` handshake
pub const PROTOCOL_VERSION: &str = crate::VERSION;

/// Longest a `ClaimJob` may hold its connection open
pub const MAX_CLAIM_WAIT_MS: u64 = 60_000;

/// Request from a client or agent to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Health check ping
    Ping,

    /// Version handshake; `token` authenticates TCP connections
    Hello {
        version: String,
        #[serde(default)]
        token: Option<String>,
    },

    // -- runs --
    CreateRun {
        workspace_id: WorkspaceId,
        config_version_id: ConfigVersionId,
        #[serde(default)]
        options: CreateOptions,
    },
    GetRun {
        run_id: RunId,
    },
    ListRuns {
        #[serde(default)]
        filter: RunFilter,
    },
    EnqueuePlan {
        run_id: RunId,
    },
    ApplyRun {
        run_id: RunId,
        #[serde(default)]
        confirmed: bool,
        #[serde(default)]
        user: Option<UserId>,
    },
    CancelRun {
        run_id: RunId,
    },
    ForceCancelRun {
        run_id: RunId,
    },
    DiscardRun {
        run_id: RunId,
    },
    DeleteRun {
        run_id: RunId,
    },
    /// Stream cluster events matching `filter` until the client hangs up
    Watch {
        #[serde(default)]
        filter: WatchFilter,
    },

    // -- workspaces --
    UpsertWorkspace {
        workspace: Workspace,
    },
    GetWorkspace {
        workspace_id: WorkspaceId,
    },
    DeleteWorkspace {
        workspace_id: WorkspaceId,
    },
    /// Store a configuration tarball as a new version of the workspace
    UploadConfigVersion {
        workspace_id: WorkspaceId,
        #[serde(default)]
        speculative: bool,
        tarball: Vec<u8>,
    },
    GetConfigVersion {
        config_version_id: ConfigVersionId,
    },
    LockWorkspace {
        workspace_id: WorkspaceId,
        user: UserId,
    },
    UnlockWorkspace {
        workspace_id: WorkspaceId,
        subject: LockHolder,
        #[serde(default)]
        force: bool,
    },

    // -- jobs, as driven by agents of `pool` --
    ListUnallocated {
        #[serde(default)]
        pool: Option<AgentPoolId>,
    },
    RegisterRunner {
        pool: AgentPoolId,
        name: String,
        max_jobs: u32,
    },
    PingRunner {
        pool: AgentPoolId,
        runner_id: RunnerId,
        status: RunnerStatus,
    },
    /// Claim and start the next job, holding the connection up to `wait_ms`
    ClaimJob {
        pool: AgentPoolId,
        runner_id: RunnerId,
        wait_ms: u64,
    },
    ReportProgress {
        pool: AgentPoolId,
        job_id: JobId,
        runner_id: RunnerId,
        #[serde(default)]
        chunk: Option<Chunk>,
    },
    ReportResult {
        pool: AgentPoolId,
        job_id: JobId,
        runner_id: RunnerId,
        outcome: PhaseOutcome,
    },
    DownloadConfig {
        pool: AgentPoolId,
        config_version_id: ConfigVersionId,
    },
    DeregisterRunner {
        pool: AgentPoolId,
        runner_id: RunnerId,
    },

    // -- logs --
    PutChunk {
        chunk: Chunk,
    },
    GetChunk {
        run_id: RunId,
        phase: Phase,
        #[serde(default)]
        offset: u64,
        /// Zero reads to the end
        #[serde(default)]
        limit: u64,
    },
    /// Stream a phase log from `offset` until it is complete
    Tail {
        run_id: RunId,
        phase: Phase,
        #[serde(default)]
        offset: u64,
    },
}

impl Request {
    /// Requests answered with a stream of frames
    pub fn is_stream(&self) -> bool {
        matches!(self, Request::Watch { .. } | Request::Tail { .. })
    }

    /// Variant name for logs; payloads may carry whole tarballs
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Hello { .. } => "Hello",
            Request::CreateRun { .. } => "CreateRun",
            Request::GetRun { .. } => "GetRun",
            Request::ListRuns { .. } => "ListRuns",
            Request::EnqueuePlan { .. } => "EnqueuePlan",
            Request::ApplyRun { .. } => "ApplyRun",
            Request::CancelRun { .. } => "CancelRun",
            Request::ForceCancelRun { .. } => "ForceCancelRun",
            Request::DiscardRun { .. } => "DiscardRun",
            Request::DeleteRun { .. } => "DeleteRun",
            Request::Watch { .. } => "Watch",
            Request::UpsertWorkspace { .. } => "UpsertWorkspace",
            Request::GetWorkspace { .. } => "GetWorkspace",
            Request::DeleteWorkspace { .. } => "DeleteWorkspace",
            Request::UploadConfigVersion { .. } => "UploadConfigVersion",
            Request::GetConfigVersion { .. } => "GetConfigVersion",
            Request::LockWorkspace { .. } => "LockWorkspace",
            Request::UnlockWorkspace { .. } => "UnlockWorkspace",
            Request::ListUnallocated { .. } => "ListUnallocated",
            Request::RegisterRunner { .. } => "RegisterRunner",
            Request::PingRunner { .. } => "PingRunner",
            Request::ClaimJob { .. } => "ClaimJob",
            Request::ReportProgress { .. } => "ReportProgress",
            Request::ReportResult { .. } => "ReportResult",
            Request::DownloadConfig { .. } => "DownloadConfig",
            Request::DeregisterRunner { .. } => "DeregisterRunner",
            Request::PutChunk { .. } => "PutChunk",
            Request::GetChunk { .. } => "GetChunk",
            Request::Tail { .. } => "Tail",
        }
    }

    /// Frequent requests from agents and pollers, logged at debug
    pub fn is_chatty(&self) -> bool {
        matches!(
            self,
            Request::Ping
                | Request::PingRunner { .. }
                | Request::ClaimJob { .. }
                | Request::ReportProgress { .. }
                | Request::GetRun { .. }
                | Request::GetChunk { .. }
                | Request::ListRuns { .. }
        )
    }
}

/// Response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    /// Generic success
    Ok,
    Pong,
    Hello {
        version: String,
    },
    Run {
        run: Box<Run>,
    },
    Runs {
        runs: Vec<Run>,
    },
    Canceled {
        outcome: CancelOutcome,
    },
    Workspace {
        workspace: Workspace,
    },
    ConfigVersion {
        config_version: ConfigVersion,
    },
    Jobs {
        jobs: Vec<Job>,
    },
    Runner {
        runner: RunnerMeta,
    },
    /// None when the claim wait elapsed
    Assignment {
        assignment: Option<Box<Assignment>>,
    },
    /// Interrupt the agent should pass to its engine
    Signal {
        signal: Option<Signal>,
    },
    Config {
        tarball: Option<Vec<u8>>,
    },
    Chunk {
        chunk: Chunk,
    },
    Event {
        event: Box<ClusterEvent>,
    },
    /// Last frame of a stream
    End,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }
}

impl From<EngineError> for Response {
    fn from(err: EngineError) -> Self {
        let (kind, message) = match err {
            EngineError::Validation(m) => (ErrorKind::Validation, m),
            EngineError::Conflict(m) => (ErrorKind::Conflict, m),
            EngineError::NotFound(m) => (ErrorKind::NotFound, m),
            EngineError::Forbidden(m) => (ErrorKind::Forbidden, m),
            EngineError::Transient(m) => (ErrorKind::Transient, m),
            EngineError::Execution(m) => (ErrorKind::Execution, m),
            EngineError::Invariant(m) => (ErrorKind::Invariant, m),
        };
        Response::Error { kind, message }
    }
}

/// Error class carried on the wire, so retryability survives the hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Forbidden,
    Transient,
    Execution,
    Invariant,
}

impl ErrorKind {
    pub fn into_error(self, message: String) -> EngineError {
        match self {
            ErrorKind::Validation => EngineError::Validation(message),
            ErrorKind::Conflict => EngineError::Conflict(message),
            ErrorKind::NotFound => EngineError::NotFound(message),
            ErrorKind::Forbidden => EngineError::Forbidden(message),
            ErrorKind::Transient => EngineError::Transient(message),
            ErrorKind::Execution => EngineError::Execution(message),
            ErrorKind::Invariant => EngineError::Invariant(message),
        }
    }
}

/// Serializable form of an [`EventFilter`]. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchFilter {
    pub tables: Vec<Table>,
    pub workspace_id: Option<WorkspaceId>,
    pub run_id: Option<RunId>,
}

impl WatchFilter {
    pub fn run(id: RunId) -> Self {
        Self {
            run_id: Some(id),
            ..Self::default()
        }
    }

    pub fn to_event_filter(&self) -> EventFilter {
        let mut filter = EventFilter::all();
        for table in &self.tables {
            filter = filter.table(*table);
        }
        if let Some(ws) = &self.workspace_id {
            filter = filter.workspace(ws.clone());
        }
        if let Some(run) = &self.run_id {
            filter = filter.run(run.clone());
        }
        filter
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;

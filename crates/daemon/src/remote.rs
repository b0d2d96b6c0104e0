// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner channel for agents in another process, spoken over the daemon
//! socket. The daemon side is an `AgentChannel` for the same pool.

use std::time::Duration;

use async_trait::async_trait;
use ot_core::{
    AgentPoolId, Chunk, ConfigVersionId, JobId, PhaseOutcome, RunnerId, RunnerMeta, RunnerStatus,
    Signal,
};
use ot_engine::{Assignment, EngineError, RunnerChannel};
use tokio::sync::watch;

use crate::client::{ClientError, DaemonClient};
use crate::protocol::{Request, Response};

#[derive(Debug, Clone)]
pub struct RemoteChannel {
    client: DaemonClient,
    pool: AgentPoolId,
}

impl RemoteChannel {
    pub fn new(client: DaemonClient, pool: AgentPoolId) -> Self {
        Self { client, pool }
    }

    pub fn pool(&self) -> &AgentPoolId {
        &self.pool
    }

    async fn ok(&self, request: Request) -> Result<(), EngineError> {
        match self.client.send(&request).await? {
            Response::Ok => Ok(()),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }
}

#[async_trait]
impl RunnerChannel for RemoteChannel {
    async fn register(&self, name: &str, max_jobs: u32) -> Result<RunnerMeta, EngineError> {
        let request = Request::RegisterRunner {
            pool: self.pool.clone(),
            name: name.to_string(),
            max_jobs,
        };
        match self.client.send(&request).await? {
            Response::Runner { runner } => Ok(runner),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    async fn ping(&self, runner: &RunnerId, status: RunnerStatus) -> Result<(), EngineError> {
        self.ok(Request::PingRunner {
            pool: self.pool.clone(),
            runner_id: runner.clone(),
            status,
        })
        .await
    }

    async fn claim_job(
        &self,
        runner: &RunnerId,
        wait: Duration,
    ) -> Result<Option<Assignment>, EngineError> {
        let request = Request::ClaimJob {
            pool: self.pool.clone(),
            runner_id: runner.clone(),
            wait_ms: wait.as_millis().try_into().unwrap_or(u64::MAX),
        };
        // The daemon holds the connection for up to `wait`
        let read_timeout = wait + self.client.timeout();
        match self.client.send_with_timeout(&request, read_timeout).await? {
            Response::Assignment { assignment } => Ok(assignment.map(|a| *a)),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    async fn report_progress(
        &self,
        job: &JobId,
        runner: &RunnerId,
        chunk: Option<Chunk>,
    ) -> Result<Option<Signal>, EngineError> {
        let request = Request::ReportProgress {
            pool: self.pool.clone(),
            job_id: job.clone(),
            runner_id: runner.clone(),
            chunk,
        };
        match self.client.send(&request).await? {
            Response::Signal { signal } => Ok(signal),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    async fn download_config(&self, cv: &ConfigVersionId) -> Result<Option<Vec<u8>>, EngineError> {
        let request = Request::DownloadConfig {
            pool: self.pool.clone(),
            config_version_id: cv.clone(),
        };
        match self.client.send(&request).await? {
            Response::Config { tarball } => Ok(tarball),
            _ => Err(ClientError::UnexpectedResponse.into()),
        }
    }

    async fn report_result(
        &self,
        job: &JobId,
        runner: &RunnerId,
        outcome: PhaseOutcome,
    ) -> Result<(), EngineError> {
        self.ok(Request::ReportResult {
            pool: self.pool.clone(),
            job_id: job.clone(),
            runner_id: runner.clone(),
            outcome,
        })
        .await
    }

    /// Interrupts reach remote agents on progress responses only
    fn interrupt(&self, _job: &JobId, _signal: Signal) -> bool {
        false
    }

    fn interrupts(&self, _job: &JobId) -> Option<watch::Receiver<Option<Signal>>> {
        None
    }

    async fn deregister(&self, runner: &RunnerId) -> Result<(), EngineError> {
        self.ok(Request::DeregisterRunner {
            pool: self.pool.clone(),
            runner_id: runner.clone(),
        })
        .await
    }
}

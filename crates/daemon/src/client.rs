// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client side of the daemon protocol, used by agents and tools.

use std::path::PathBuf;
use std::time::Duration;

use ot_core::{
    Chunk, ClusterEvent, ConfigVersion, ConfigVersionId, CreateOptions, LockHolder, Phase, Run,
    RunId, UserId, Workspace, WorkspaceId,
};
use ot_engine::{CancelOutcome, EngineError, RunFilter};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::protocol::{
    self, ErrorKind, ProtocolError, Request, Response, WatchFilter, DEFAULT_TIMEOUT,
    PROTOCOL_VERSION,
};

type Reader = Box<dyn AsyncRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// Where the daemon listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl Endpoint {
    /// `tcp://host:port` for TCP; anything else is a socket path
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("tcp://") {
            Some(addr) => Endpoint::Tcp(addr.to_string()),
            None => Endpoint::Unix(PathBuf::from(s)),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rejected ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("Unexpected response from daemon")]
    UnexpectedResponse,
}

impl From<ClientError> for EngineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rejected { kind, message } => kind.into_error(message),
            ClientError::Protocol(_) | ClientError::Io(_) => {
                EngineError::Transient(format!("daemon unreachable: {err}"))
            }
            ClientError::UnexpectedResponse => EngineError::Validation(err.to_string()),
        }
    }
}

fn rejected(response: Response) -> ClientError {
    match response {
        Response::Error { kind, message } => ClientError::Rejected { kind, message },
        _ => ClientError::UnexpectedResponse,
    }
}

/// Daemon client. Every call opens its own connection.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    endpoint: Endpoint,
    token: Option<String>,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Token sent in `Hello`; required by daemons that listen on TCP
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connect(&self) -> Result<(Reader, Writer), ClientError> {
        Ok(match &self.endpoint {
            Endpoint::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                (Box::new(r) as Reader, Box::new(w) as Writer)
            }
            Endpoint::Tcp(addr) => {
                let (r, w) = TcpStream::connect(addr).await?.into_split();
                (Box::new(r) as Reader, Box::new(w) as Writer)
            }
        })
    }

    async fn handshake(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<String, ClientError> {
        let hello = Request::Hello {
            version: PROTOCOL_VERSION.to_string(),
            token: self.token.clone(),
        };
        write_request(writer, &hello, self.timeout).await?;
        match read_response(reader, self.timeout).await? {
            Response::Hello { version } => Ok(version),
            other => Err(rejected(other)),
        }
    }

    /// Connect, handshaking first over TCP or when a token is set.
    async fn open(&self) -> Result<(Reader, Writer), ClientError> {
        let (mut reader, mut writer) = self.connect().await?;
        if matches!(self.endpoint, Endpoint::Tcp(_)) || self.token.is_some() {
            self.handshake(&mut reader, &mut writer).await?;
        }
        Ok((reader, writer))
    }

    /// Send a request and receive a response
    pub async fn send(&self, request: &Request) -> Result<Response, ClientError> {
        self.send_with_timeout(request, self.timeout).await
    }

    /// Send a request, waiting up to `read_timeout` for the response
    pub async fn send_with_timeout(
        &self,
        request: &Request,
        read_timeout: Duration,
    ) -> Result<Response, ClientError> {
        let (mut reader, mut writer) = self.open().await?;
        write_request(&mut writer, request, self.timeout).await?;
        // The writer stays open until the response arrives; closing it
        // reads as a hang-up on the daemon side
        let response = read_response(&mut reader, read_timeout).await;
        drop(writer);
        match response? {
            Response::Error { kind, message } => Err(ClientError::Rejected { kind, message }),
            response => Ok(response),
        }
    }

    /// Open a `Watch` or `Tail` stream
    pub async fn stream(&self, request: &Request) -> Result<ResponseStream, ClientError> {
        let (mut reader, mut writer) = self.open().await?;
        write_request(&mut writer, request, self.timeout).await?;
        match read_response(&mut reader, self.timeout).await? {
            Response::Ok => Ok(ResponseStream {
                reader,
                _writer: writer,
            }),
            other => Err(rejected(other)),
        }
    }

    /// Version of the daemon
    pub async fn hello(&self) -> Result<String, ClientError> {
        let (mut reader, mut writer) = self.connect().await?;
        self.handshake(&mut reader, &mut writer).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send(&Request::Ping).await? {
            Response::Pong => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn create_run(
        &self,
        workspace_id: &WorkspaceId,
        config_version_id: &ConfigVersionId,
        options: CreateOptions,
    ) -> Result<Run, ClientError> {
        self.run(Request::CreateRun {
            workspace_id: workspace_id.clone(),
            config_version_id: config_version_id.clone(),
            options,
        })
        .await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Run, ClientError> {
        self.run(Request::GetRun {
            run_id: run_id.clone(),
        })
        .await
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, ClientError> {
        match self.send(&Request::ListRuns { filter }).await? {
            Response::Runs { runs } => Ok(runs),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn enqueue_plan(&self, run_id: &RunId) -> Result<Run, ClientError> {
        self.run(Request::EnqueuePlan {
            run_id: run_id.clone(),
        })
        .await
    }

    pub async fn apply(
        &self,
        run_id: &RunId,
        confirmed: bool,
        user: Option<UserId>,
    ) -> Result<Run, ClientError> {
        self.run(Request::ApplyRun {
            run_id: run_id.clone(),
            confirmed,
            user,
        })
        .await
    }

    pub async fn cancel(&self, run_id: &RunId) -> Result<CancelOutcome, ClientError> {
        let request = Request::CancelRun {
            run_id: run_id.clone(),
        };
        match self.send(&request).await? {
            Response::Canceled { outcome } => Ok(outcome),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn force_cancel(&self, run_id: &RunId) -> Result<Run, ClientError> {
        self.run(Request::ForceCancelRun {
            run_id: run_id.clone(),
        })
        .await
    }

    pub async fn discard(&self, run_id: &RunId) -> Result<Run, ClientError> {
        self.run(Request::DiscardRun {
            run_id: run_id.clone(),
        })
        .await
    }

    pub async fn delete_run(&self, run_id: &RunId) -> Result<(), ClientError> {
        self.ok(Request::DeleteRun {
            run_id: run_id.clone(),
        })
        .await
    }

    pub async fn upsert_workspace(&self, workspace: Workspace) -> Result<Workspace, ClientError> {
        self.workspace(Request::UpsertWorkspace { workspace }).await
    }

    pub async fn upload_config(
        &self,
        workspace_id: &WorkspaceId,
        speculative: bool,
        tarball: Vec<u8>,
    ) -> Result<ConfigVersion, ClientError> {
        let request = Request::UploadConfigVersion {
            workspace_id: workspace_id.clone(),
            speculative,
            tarball,
        };
        match self.send(&request).await? {
            Response::ConfigVersion { config_version } => Ok(config_version),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn lock(
        &self,
        workspace_id: &WorkspaceId,
        user: &UserId,
    ) -> Result<Workspace, ClientError> {
        self.workspace(Request::LockWorkspace {
            workspace_id: workspace_id.clone(),
            user: user.clone(),
        })
        .await
    }

    pub async fn unlock(
        &self,
        workspace_id: &WorkspaceId,
        subject: LockHolder,
        force: bool,
    ) -> Result<Workspace, ClientError> {
        self.workspace(Request::UnlockWorkspace {
            workspace_id: workspace_id.clone(),
            subject,
            force,
        })
        .await
    }

    pub async fn get_chunk(
        &self,
        run_id: &RunId,
        phase: Phase,
        offset: u64,
        limit: u64,
    ) -> Result<Chunk, ClientError> {
        let request = Request::GetChunk {
            run_id: run_id.clone(),
            phase,
            offset,
            limit,
        };
        match self.send(&request).await? {
            Response::Chunk { chunk } => Ok(chunk),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Follow a phase log from `offset` until it is complete
    pub async fn tail(
        &self,
        run_id: &RunId,
        phase: Phase,
        offset: u64,
    ) -> Result<ResponseStream, ClientError> {
        self.stream(&Request::Tail {
            run_id: run_id.clone(),
            phase,
            offset,
        })
        .await
    }

    /// Follow cluster events matching `filter`
    pub async fn watch(&self, filter: WatchFilter) -> Result<ResponseStream, ClientError> {
        self.stream(&Request::Watch { filter }).await
    }

    async fn run(&self, request: Request) -> Result<Run, ClientError> {
        match self.send(&request).await? {
            Response::Run { run } => Ok(*run),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn workspace(&self, request: Request) -> Result<Workspace, ClientError> {
        match self.send(&request).await? {
            Response::Workspace { workspace } => Ok(workspace),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn ok(&self, request: Request) -> Result<(), ClientError> {
        match self.send(&request).await? {
            Response::Ok => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

/// Frames of a `Watch` or `Tail` answer. Dropping it hangs up.
pub struct ResponseStream {
    reader: Reader,
    _writer: Writer,
}

impl ResponseStream {
    /// Next frame; `None` after `End`. Waits as long as the daemon is quiet.
    pub async fn next(&mut self) -> Result<Option<Response>, ClientError> {
        let bytes = protocol::read_message(&mut self.reader).await?;
        match protocol::decode::<Response>(&bytes)? {
            Response::End => Ok(None),
            Response::Error { kind, message } => Err(ClientError::Rejected { kind, message }),
            frame => Ok(Some(frame)),
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, ClientError> {
        match self.next().await? {
            Some(Response::Chunk { chunk }) => Ok(Some(chunk)),
            Some(_) => Err(ClientError::UnexpectedResponse),
            None => Ok(None),
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<ClusterEvent>, ClientError> {
        match self.next().await? {
            Some(Response::Event { event }) => Ok(Some(*event)),
            Some(_) => Err(ClientError::UnexpectedResponse),
            None => Ok(None),
        }
    }
}

async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let data = protocol::encode(request)?;
    tokio::time::timeout(timeout, protocol::write_message(writer, &data))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Response, ProtocolError> {
    let bytes = tokio::time::timeout(timeout, protocol::read_message(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    protocol::decode(&bytes)
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

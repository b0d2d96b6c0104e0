// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener task for handling socket I/O.
//!
//! Accepts connections on the Unix socket and, when configured, on TCP.
//! Each connection is served on its own task by one of the process's
//! replicas, picked round-robin. Local Unix clients are trusted; TCP
//! clients must open with a `Hello` carrying the auth token.

mod requests;
mod streams;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ot_core::Clock;
use ot_engine::ReplicaHandle;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    self, ErrorKind, ProtocolError, Request, Response, DEFAULT_TIMEOUT, PROTOCOL_VERSION,
};

/// Shared context for every connection handler.
pub struct ListenCtx<C: Clock> {
    replicas: Vec<ReplicaHandle<C>>,
    next: AtomicUsize,
    /// When set, TCP clients must present this token in `Hello`
    pub auth_token: Option<String>,
    /// Per-frame read and write timeout
    pub timeout: Duration,
    /// Ends open streams and the accept loop
    pub shutdown: CancellationToken,
}

impl<C: Clock> ListenCtx<C> {
    pub fn new(replicas: Vec<ReplicaHandle<C>>, shutdown: CancellationToken) -> Self {
        Self {
            replicas,
            next: AtomicUsize::new(0),
            auth_token: None,
            timeout: DEFAULT_TIMEOUT,
            shutdown,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Replica to serve the next connection
    fn pick(&self) -> Option<&ReplicaHandle<C>> {
        if self.replicas.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.replicas.get(i % self.replicas.len())
    }

    fn authorized(&self, token: Option<&str>) -> bool {
        match &self.auth_token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }
}

/// Listener task for accepting socket connections.
pub struct Listener<C: Clock> {
    unix: UnixListener,
    tcp: Option<TcpListener>,
    ctx: Arc<ListenCtx<C>>,
}

/// Errors from connection handling.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Source of a connection (for auth decisions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionSource {
    Unix,
    Tcp,
}

/// Bind the daemon socket, replacing a stale one left by a crashed daemon.
/// Callers hold the daemon lock, so no live daemon owns the old file.
pub fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

impl<C: Clock> Listener<C> {
    /// Create a new listener with Unix socket only.
    pub fn new(unix: UnixListener, ctx: Arc<ListenCtx<C>>) -> Self {
        Self {
            unix,
            tcp: None,
            ctx,
        }
    }

    /// Create a new listener with both Unix socket and TCP.
    pub fn with_tcp(unix: UnixListener, tcp: TcpListener, ctx: Arc<ListenCtx<C>>) -> Self {
        Self {
            unix,
            tcp: Some(tcp),
            ctx,
        }
    }

    /// Accept until shutdown, spawning a task per connection.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                result = self.unix.accept() => match result {
                    Ok((stream, _)) => {
                        let (reader, writer) = stream.into_split();
                        self.spawn(reader, writer, ConnectionSource::Unix);
                    }
                    Err(e) => error!("Unix accept error: {}", e),
                },
                result = accept_tcp(self.tcp.as_ref()) => match result {
                    Ok((stream, addr)) => {
                        debug!("TCP connection from {}", addr);
                        let (reader, writer) = stream.into_split();
                        self.spawn(reader, writer, ConnectionSource::Tcp);
                    }
                    Err(e) => error!("TCP accept error: {}", e),
                },
            }
        }
        info!("listener stopped");
    }

    fn spawn<R, W>(&self, reader: R, writer: W, source: ConnectionSource)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(reader, writer, source, &ctx).await {
                log_connection_error(e);
            }
        });
    }
}

/// Pends forever when there is no TCP listener
async fn accept_tcp(
    tcp: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
    match tcp {
        Some(tcp) => tcp.accept().await,
        None => std::future::pending().await,
    }
}

fn log_connection_error(e: ConnectionError) {
    match e {
        ConnectionError::Protocol(ProtocolError::ConnectionClosed) => {
            debug!("Client disconnected")
        }
        ConnectionError::Protocol(ProtocolError::Timeout) => warn!("Connection timeout"),
        _ => error!("Connection error: {}", e),
    }
}

/// Serve one connection: an optional `Hello`, then one request.
async fn handle_connection<C, R, W>(
    mut reader: R,
    mut writer: W,
    source: ConnectionSource,
    ctx: &ListenCtx<C>,
) -> Result<(), ConnectionError>
where
    C: Clock,
    R: AsyncRead + AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWrite + AsyncWriteExt + Unpin + Send + 'static,
{
    let mut request = protocol::read_request(&mut reader, ctx.timeout).await?;

    if let Request::Hello { version, token } = &request {
        if source == ConnectionSource::Tcp && !ctx.authorized(token.as_deref()) {
            warn!("rejected TCP connection with a bad auth token");
            let response = Response::error(ErrorKind::Forbidden, "unauthorized");
            let _ = protocol::write_response(&mut writer, &response, ctx.timeout).await;
            return Ok(());
        }
        if version != PROTOCOL_VERSION {
            debug!(client = %version, daemon = PROTOCOL_VERSION, "protocol version differs");
        }
        let hello = Response::Hello {
            version: PROTOCOL_VERSION.to_string(),
        };
        protocol::write_response(&mut writer, &hello, ctx.timeout).await?;
        request = match protocol::read_request(&mut reader, ctx.timeout).await {
            Ok(request) => request,
            // Handshake only, e.g. a version check
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
    } else if source == ConnectionSource::Tcp {
        let response = Response::error(
            ErrorKind::Forbidden,
            "TCP connections must start with Hello",
        );
        let _ = protocol::write_response(&mut writer, &response, ctx.timeout).await;
        return Ok(());
    }

    if request.is_chatty() {
        debug!(request = request.name(), "received request");
    } else {
        info!(request = request.name(), "received request");
    }

    let Some(replica) = ctx.pick() else {
        let response = Response::error(ErrorKind::Transient, "no replica is serving");
        protocol::write_response(&mut writer, &response, ctx.timeout).await?;
        return Ok(());
    };

    if request.is_stream() {
        return streams::serve(request, replica, reader, writer, ctx).await;
    }

    // Race the handler against the client hanging up
    let response = tokio::select! {
        response = requests::handle(request, replica) => response,
        _ = detect_client_disconnect(&mut reader) => {
            debug!("Client disconnected, dropping request");
            return Ok(());
        }
        _ = ctx.shutdown.cancelled() => {
            Response::error(ErrorKind::Transient, "daemon shutting down")
        }
    };

    protocol::write_response(&mut writer, &response, ctx.timeout).await?;
    Ok(())
}

/// Resolves once the client closes its end. Clients send nothing after
/// their request, so any read completing means they are gone.
async fn detect_client_disconnect<R: AsyncReadExt + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 1];
    let _ = reader.read(&mut buf).await;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A listener over in-memory replicas, for tests that talk the protocol

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ot_adapters::FakeEngine;
use ot_core::{FakeClock, IdGen, ReplicaId, SequentialIdGen};
use ot_engine::{
    AllowAll, ArtifactStore, Ctx, EngineConfig, MemoryArtifacts, Replica, ReplicaHandle,
};
use ot_storage::Store;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{DaemonClient, Endpoint};
use crate::listener::{bind_unix, ListenCtx, Listener};

pub(crate) const TOKEN: &str = "s3cret";

pub(crate) fn test_config(builtin_runner: bool) -> EngineConfig {
    EngineConfig {
        builtin_runner,
        claim_poll_timeout: Duration::from_millis(50),
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(50),
        progress_interval: Duration::from_millis(10),
        ping_interval: Duration::from_millis(50),
        watchdog_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

pub(crate) struct TestDaemon {
    _dir: TempDir,
    pub socket: PathBuf,
    pub tcp: Option<SocketAddr>,
    /// Engine of the built-in runners
    pub engine: FakeEngine,
    pub store: Store,
    replicas: Vec<Replica<FakeClock>>,
    shutdown: CancellationToken,
    listener: JoinHandle<()>,
}

impl TestDaemon {
    /// `replicas` replicas over one store, serving a Unix socket
    pub async fn start(replicas: usize, builtin_runner: bool) -> Self {
        Self::build(replicas, builtin_runner, false).await
    }

    /// One replica without a built-in runner, also listening on TCP with
    /// [`TOKEN`]
    pub async fn start_tcp() -> Self {
        Self::build(1, false, true).await
    }

    async fn build(count: usize, builtin_runner: bool, tcp: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("otd.sock");
        let store = Store::in_memory();
        let clock = FakeClock::new();
        let ids: Arc<dyn IdGen> = Arc::new(SequentialIdGen::new());
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifacts::new(Arc::clone(&ids)));
        let engine = FakeEngine::new();

        let replicas: Vec<Replica<FakeClock>> = (1..=count)
            .map(|n| {
                let ctx = Ctx::new(
                    store.clone(),
                    ReplicaId::new(format!("otd-{n}")),
                    clock.clone(),
                    Arc::clone(&ids),
                    test_config(builtin_runner),
                )
                .with_artifacts(Arc::clone(&artifacts));
                Replica::start(ctx, engine.clone(), Arc::new(AllowAll))
            })
            .collect();

        let shutdown = CancellationToken::new();
        let ctx = ListenCtx::new(
            replicas.iter().map(Replica::handle).collect(),
            shutdown.clone(),
        )
        .with_auth_token(tcp.then(|| TOKEN.to_string()));
        let unix = bind_unix(&socket).unwrap();
        let (listener, tcp) = if tcp {
            let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = tcp.local_addr().unwrap();
            (Listener::with_tcp(unix, tcp, Arc::new(ctx)), Some(addr))
        } else {
            (Listener::new(unix, Arc::new(ctx)), None)
        };
        let listener = tokio::spawn(listener.run());

        Self {
            _dir: dir,
            socket,
            tcp,
            engine,
            store,
            replicas,
            shutdown,
            listener,
        }
    }

    pub fn client(&self) -> DaemonClient {
        DaemonClient::new(Endpoint::Unix(self.socket.clone()))
    }

    /// TCP client presenting `token`
    pub fn tcp_client(&self, token: Option<&str>) -> DaemonClient {
        let addr = self.tcp.unwrap();
        DaemonClient::new(Endpoint::Tcp(addr.to_string())).with_token(token.map(String::from))
    }

    pub fn replica(&self, index: usize) -> ReplicaHandle<FakeClock> {
        self.replicas[index].handle()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.listener.await.unwrap();
        for replica in self.replicas {
            replica.shutdown().await;
        }
    }
}

/// Poll `check` until it holds, failing after five seconds.
pub(crate) async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

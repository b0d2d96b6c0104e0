// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ot Daemon (otd)
//!
//! Runs one or more server replicas over a durable store in the state
//! directory.
//!
//! Architecture:
//! - Replicas: scheduler, relay, interrupt router, sweepers and the built-in
//!   runner of each, all as tasks on this runtime
//! - Listener: Unix socket (and TCP when configured) serving clients and
//!   remote agents, each connection handed to one replica
//! - Persistence: group-commit flush and periodic checkpoint tasks
//! - Main task: waits for a termination signal, then stops the rest in order

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::sync::Arc;

use ot_adapters::{ProcessEngine, TracedEngine};
use ot_core::{IdGen, SystemClock, UuidIdGen};
use ot_daemon::lifecycle::{self, spawn_checkpoint, spawn_flush_task};
use ot_daemon::listener::bind_unix;
use ot_daemon::{DaemonConfig, LifecycleError, ListenCtx, Listener, Paths, VERSION};
use ot_engine::{AllowAll, ArtifactStore, Ctx, DirArtifacts, Replica};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle info flags before any config/lock acquisition
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("otd {VERSION}");
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: otd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let paths = Paths::load()?;
    std::fs::create_dir_all(&paths.state_dir)?;
    let config = match DaemonConfig::load(&paths.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    // Before tracing setup, so the start of this attempt is easy to find
    write_startup_marker(&paths)?;
    let log_guard = setup_logging(&paths)?;
    info!(replica = %config.replica, replicas = config.replicas, "starting otd {}", VERSION);

    let daemon = match lifecycle::startup(&paths) {
        Ok(daemon) => daemon,
        Err(LifecycleError::LockFailed(_)) => {
            let pid = std::fs::read_to_string(&paths.lock_path).unwrap_or_default();
            eprintln!("otd is already running");
            if !pid.trim().is_empty() {
                eprintln!("  pid: {}", pid.trim());
            }
            std::process::exit(1);
        }
        Err(e) => {
            // Synchronously, since the non-blocking writer may not flush in time
            write_startup_error(&paths, &e);
            error!("failed to start daemon: {}", e);
            drop(log_guard);
            return Err(e.into());
        }
    };

    let persistence = CancellationToken::new();
    let flush = spawn_flush_task(daemon.store.clone(), persistence.child_token());
    let checkpoint = spawn_checkpoint(
        daemon.store.clone(),
        paths.snapshot_path.clone(),
        persistence.child_token(),
    );

    // Replicas share the store, the id source and the artifact directory
    let ids: Arc<dyn IdGen> = Arc::new(UuidIdGen);
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(DirArtifacts::new(&paths.artifacts_path, Arc::clone(&ids)));
    let engine = TracedEngine::new(ProcessEngine::from_env(&paths.workdir_path));
    let replicas: Vec<Replica<SystemClock>> = config
        .replica_ids()
        .into_iter()
        .map(|id| {
            let ctx = Ctx::new(
                daemon.store.clone(),
                id,
                SystemClock,
                Arc::clone(&ids),
                config.engine.clone(),
            )
            .with_artifacts(Arc::clone(&artifacts));
            Replica::start(ctx, engine.clone(), Arc::new(AllowAll))
        })
        .collect();

    let listening = CancellationToken::new();
    let listen_ctx = Arc::new(
        ListenCtx::new(
            replicas.iter().map(Replica::handle).collect(),
            listening.clone(),
        )
        .with_auth_token(config.auth_token.clone()),
    );
    let unix = bind_unix(&paths.socket_path)?;
    let listener = match &config.listen_tcp {
        Some(addr) => {
            let tcp = TcpListener::bind(addr).await?;
            info!(addr = %addr, "listening on TCP");
            Listener::with_tcp(unix, tcp, listen_ctx)
        }
        None => Listener::new(unix, listen_ctx),
    };
    let listener = tokio::spawn(listener.run());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!(
        state_dir = %paths.state_dir.display(),
        socket = %paths.socket_path.display(),
        "daemon ready"
    );
    // Signal ready for a supervising parent process
    println!("READY");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        _ = sigint.recv() => info!("received SIGINT, shutting down..."),
    }

    // Listener first so no new work arrives, then runners so in-flight
    // phases report, then persistence
    listening.cancel();
    if let Err(e) = listener.await {
        warn!(error = %e, "listener task failed");
    }
    for replica in replicas {
        replica.shutdown().await;
    }
    persistence.cancel();
    for (name, handle) in [("flush", flush), ("checkpoint", checkpoint)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "task failed");
        }
    }
    daemon.shutdown()?;
    info!("daemon stopped");
    drop(log_guard);
    Ok(())
}

fn print_help() {
    println!("otd {VERSION}");
    println!("ot daemon - schedules runs, executes phases and serves their logs");
    println!();
    println!("USAGE:");
    println!("    otd");
    println!();
    println!("State lives in $OT_STATE_DIR (default $XDG_STATE_HOME/ot or");
    println!("~/.local/state/ot). Settings are read from otd.toml there and may");
    println!("be overridden by OT_* environment variables. Clients and local");
    println!("agents connect to otd.sock in the state directory.");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help information");
    println!("    -v, --version    Print version information");
}

/// Startup marker prefix written to log before anything else.
/// Full format: "--- otd: starting (pid: 12345) ---"
const STARTUP_MARKER_PREFIX: &str = "--- otd: starting (pid: ";

/// Append the startup marker to the log file
fn write_startup_marker(paths: &Paths) -> Result<(), LifecycleError> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_path)?;
    writeln!(file, "{}{}) ---", STARTUP_MARKER_PREFIX, std::process::id())?;
    Ok(())
}

fn write_startup_error(paths: &Paths, error: &LifecycleError) {
    use std::io::Write;

    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_path)
    else {
        return;
    };
    let _ = writeln!(file, "ERROR failed to start daemon: {}", error);
}

fn setup_logging(
    paths: &Paths,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let file_appender = tracing_appender::rolling::never(
        &paths.state_dir,
        paths
            .log_path
            .file_name()
            .ok_or(LifecycleError::NoStateDir)?,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}

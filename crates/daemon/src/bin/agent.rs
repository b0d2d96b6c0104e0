// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ot agent (ot-agent)
//!
//! Claims jobs for one agent pool from `otd` and executes them locally.
//! Talks to the daemon over its socket, or over TCP with `OT_AUTH_TOKEN`.

use std::sync::Arc;

use ot_adapters::{ProcessEngine, TracedEngine};
use ot_core::AgentPoolId;
use ot_daemon::{env, DaemonClient, Endpoint, Paths, RemoteChannel, VERSION};
use ot_engine::{EngineConfig, RunnerLoop};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEFAULT_MAX_JOBS: u32 = 1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("ot-agent {VERSION}");
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: ot-agent [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let Some(pool) = env::agent_pool() else {
        eprintln!("error: OT_AGENT_POOL is not set");
        std::process::exit(2);
    };
    let paths = Paths::load()?;
    let endpoint = env::server()
        .map(|s| Endpoint::parse(&s))
        .unwrap_or_else(|| Endpoint::Unix(paths.socket_path.clone()));
    let workdir = env::agent_workdir().unwrap_or_else(|| paths.state_dir.join("agent-workdirs"));
    let name = env::agent_name().unwrap_or_else(|| format!("agent-{}", std::process::id()));
    let max_jobs = env::agent_max_jobs().unwrap_or(DEFAULT_MAX_JOBS);

    setup_logging();
    info!(pool = %pool, server = %endpoint, name = %name, "starting ot-agent {}", VERSION);

    let client = DaemonClient::new(endpoint).with_token(env::auth_token());
    let version = client.hello().await?;
    if version != VERSION {
        info!(daemon = %version, "daemon runs a different version");
    }

    let channel = RemoteChannel::new(client, AgentPoolId::new(pool));
    let engine = TracedEngine::new(ProcessEngine::from_env(workdir));
    let shutdown = CancellationToken::new();
    let runner = RunnerLoop::new(
        channel,
        engine,
        name,
        max_jobs,
        Arc::new(EngineConfig::default()),
        shutdown.clone(),
    );
    let handle = tokio::spawn(runner.run());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, draining..."),
        _ = sigint.recv() => info!("received SIGINT, draining..."),
    }
    shutdown.cancel();
    handle.await?;
    info!("agent stopped");
    Ok(())
}

fn print_help() {
    println!("ot-agent {VERSION}");
    println!("ot agent - claims jobs of one agent pool and executes them");
    println!();
    println!("USAGE:");
    println!("    OT_AGENT_POOL=<pool> ot-agent");
    println!();
    println!("ENVIRONMENT:");
    println!("    OT_AGENT_POOL       Agent pool to serve (required)");
    println!("    OT_SERVER           Daemon socket path or tcp://host:port");
    println!("                        (default: otd.sock in the state directory)");
    println!("    OT_AUTH_TOKEN       Token for TCP connections");
    println!("    OT_AGENT_NAME       Runner name (default: agent-<pid>)");
    println!("    OT_AGENT_MAX_JOBS   Concurrent jobs (default: 1)");
    println!("    OT_AGENT_WORKDIR    Root of per-run working directories");
}

fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

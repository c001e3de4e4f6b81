mod cli;
mod config;
mod runtime;
mod tunnel;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{Cli, Command, RunMode};
use meshline_core::auth::ConnectionType;
use meshline_core::{Error, SessionManager};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    // aws_lc_rs matches the feature this workspace builds jsonwebtoken with;
    // rustls needs an explicit provider selected before any TLS use.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "meshline exited with an error");
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing(cli: &Cli) {
    let filter = cli
        .log
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::from_default_env().add_directive("meshline_core=info".parse().unwrap()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Maps the root cause to `Error::exit_code`, falling back to `4` (generic
/// runtime failure) for anything not fatal at startup.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>().and_then(Error::exit_code).unwrap_or(4)
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Run { mode } => run_session(&cli, mode).await,
        Command::Status => print_status(),
        Command::Stop => stop_session(),
    }
}

async fn run_session(cli: &Cli, mode: &RunMode) -> Result<()> {
    let (token, expected) = match mode {
        RunMode::P2p { token } => (token.clone(), ConnectionType::P2PMesh),
        RunMode::Tunnel { token, .. } => (token.clone(), ConnectionType::ClientServer),
    };

    let config = config::load(cli.config.as_deref()).context("loading configuration")?;
    let handle = SessionManager::start(config, token).await.map_err(anyhow::Error::from).context("starting session")?;

    let snapshot = handle.status();
    if let Some(actual) = snapshot.connection_type {
        if actual != expected {
            handle.stop().await;
            return Err(anyhow!("token's connection_type ({actual:?}) does not match `run {expected:?}`"));
        }
    }

    tracing::info!(peer_id = ?snapshot.peer_id, "session started");
    runtime::write(&runtime::RuntimeRecord::from(handle.status()));

    let refresh_handle = handle.clone();
    tokio::spawn(runtime::run_refresh_loop(refresh_handle));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    match mode {
        RunMode::P2p { .. } => cancel.cancelled().await,
        RunMode::Tunnel { tunnel_id, local_port, remote_host, remote_port, .. } => {
            tunnel::run(&handle, tunnel_id, *local_port, remote_host, *remote_port, cancel.clone())
                .await
                .context("running client-server tunnel")?;
        }
    }

    tracing::info!("shutdown requested");
    handle.stop().await;
    runtime::clear();
    Ok(())
}

/// Waits for Ctrl-C or the `SIGTERM` the `stop` subcommand sends to a
/// running session's pid.
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for ctrl-c"),
        _ = terminate.recv() => Ok(()),
    }
}

fn print_status() -> Result<()> {
    match runtime::read() {
        Some(record) => {
            println!("pid: {}", record.pid);
            println!("state: {}", record.state);
            println!("connected: {}", record.is_connected);
            println!("peer_id: {}", record.peer_id.as_deref().unwrap_or("-"));
            println!("connected_peers: {}", record.connected_peers);
            println!("discovered_peers: {}", record.discovered_peers);
            if let Some(err) = &record.last_error {
                println!("last_error: {err}");
            }
            Ok(())
        }
        None => {
            println!("no session is running");
            Ok(())
        }
    }
}

fn stop_session() -> Result<()> {
    let Some(record) = runtime::read() else {
        println!("no session is running");
        return Ok(());
    };
    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(record.pid.to_string())
        .status()
        .context("invoking kill")?;
    if !status.success() {
        return Err(anyhow!("failed to signal pid {}", record.pid));
    }
    println!("sent shutdown signal to pid {}", record.pid);
    Ok(())
}

//! Argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "meshline", version, about = "Control surface for the overlay mesh client")]
pub struct Cli {
    /// Path to the TOML configuration file. Defaults to
    /// `~/.config/meshline/config.toml`.
    #[arg(long, global = true, env = "MESHLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the tracing filter (e.g. `meshline_core=debug`).
    #[arg(long, global = true, env = "MESHLINE_LOG")]
    pub log: Option<String>,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, global = true, env = "MESHLINE_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a session and run it in the foreground until interrupted.
    Run {
        #[command(subcommand)]
        mode: RunMode,
    },
    /// Print the status of the locally running session, if any.
    Status,
    /// Stop the locally running session.
    Stop,
}

#[derive(Debug, Subcommand)]
pub enum RunMode {
    /// Join the mesh as a peer (`p2p-mesh` connection type).
    P2p {
        /// Bearer token. Falls back to `MESHLINE_TOKEN` if unset.
        #[arg(long, env = "MESHLINE_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Run a client-server tunnel (`client-server` connection type).
    Tunnel {
        #[arg(long, env = "MESHLINE_TOKEN", hide_env_values = true)]
        token: String,
        /// Identifies this tunnel's QUIC stream to the relay/server side.
        #[arg(long)]
        tunnel_id: String,
        /// Local TCP port this process listens on.
        #[arg(long)]
        local_port: u16,
        /// Host the relay-side server should forward the tunnel to.
        #[arg(long)]
        remote_host: String,
        /// Port on `remote_host` the relay-side server should forward to.
        #[arg(long)]
        remote_port: u16,
    },
}

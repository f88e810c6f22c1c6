// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! # Lattice CLI
//!
//! The `lattice` binary runs a mesh node (`lattice serve`) and talks
//! to running nodes over their RPC port: directory operations,
//! arbitrary RPC calls, task dispatch, and state reads and writes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use lattice_mesh::MeshError;

mod commands;

use commands::{ConnectOpts, LbCommand, NetCommand, RpcCommand, StateCommand, TaskCommand};

/// Lattice - coordinate a mesh of agent processes
#[derive(Parser)]
#[command(name = "lattice")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Node RPC address to talk to
    #[arg(
        long,
        global = true,
        env = "LATTICE_ADDR",
        default_value = "127.0.0.1:7600"
    )]
    addr: String,

    /// PEM file of root certificates to trust for outbound TLS
    #[arg(long, global = true, env = "LATTICE_TLS_CA", value_name = "FILE")]
    tls_ca: Option<PathBuf>,

    /// Server name expected on the node's certificate
    #[arg(long, global = true, env = "LATTICE_TLS_DOMAIN")]
    tls_domain: Option<String>,

    /// Per-call timeout in milliseconds
    #[arg(long, global = true, default_value = "10000")]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LATTICE_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh node in the foreground
    Serve(commands::serve::ServeArgs),

    /// Agent directory operations
    Net {
        #[command(subcommand)]
        command: NetCommand,
    },

    /// Raw RPC calls against a node
    Rpc {
        #[command(subcommand)]
        command: RpcCommand,
    },

    /// Load balancer operations
    Lb {
        #[command(subcommand)]
        command: LbCommand,
    },

    /// Replicated state operations
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Task dispatch
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let rendered = match err.downcast_ref::<MeshError>() {
            Some(mesh) => format!("{}: {}", mesh.kind(), mesh),
            None => format!("{err:#}"),
        };
        eprintln!("{} {}", "error:".red().bold(), rendered);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_logging(&cli.log_level)?;

    let opts = ConnectOpts {
        addr: cli.addr,
        tls_ca: cli.tls_ca,
        tls_domain: cli.tls_domain,
        timeout: Duration::from_millis(cli.timeout_ms),
    };

    match cli.command {
        Commands::Serve(args) => commands::serve::handle_command(args).await,
        Commands::Net { command } => commands::net::handle_command(command, &opts).await,
        Commands::Rpc { command } => commands::rpc::handle_command(command, &opts).await,
        Commands::Lb { command } => commands::lb::handle_command(command, &opts).await,
        Commands::State { command } => commands::state::handle_command(command, &opts).await,
        Commands::Task { command } => commands::task::handle_command(command, &opts).await,
    }
}

/// Initialize tracing subscriber for logging. Diagnostics go to
/// stderr so command output stays pipeable.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use lattice_mesh::{MeshConfig, MeshNode};
use tracing::info;

#[derive(Args)]
pub struct ServeArgs {
    /// JSON config file; flags below override its values
    #[arg(short, long, env = "LATTICE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Identifier this node registers itself under
    #[arg(long, default_value = "node-1")]
    agent_id: String,

    /// Address to bind the RPC server
    #[arg(long, default_value = "127.0.0.1:7600")]
    bind: String,

    /// Capability this node advertises (repeatable)
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// PEM certificate chain for inbound TLS
    #[arg(long, value_name = "FILE")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for inbound TLS
    #[arg(long, value_name = "FILE")]
    tls_key: Option<PathBuf>,

    /// Root certificates trusted when calling peers
    #[arg(long, value_name = "FILE")]
    tls_ca: Option<PathBuf>,

    /// Server name expected on peer certificates
    #[arg(long)]
    tls_domain: Option<String>,
}

impl ServeArgs {
    fn into_config(self) -> Result<MeshConfig> {
        let mut config = match &self.config {
            Some(path) => MeshConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => MeshConfig::new(self.agent_id.clone(), self.bind.clone()),
        };
        if self.config.is_some() {
            // Flags still win over the file when given explicitly.
            if !self.capabilities.is_empty() {
                config.capabilities = self.capabilities;
            }
        } else {
            config.capabilities = self.capabilities;
        }
        if self.tls_cert.is_some() {
            config.tls_cert = self.tls_cert;
        }
        if self.tls_key.is_some() {
            config.tls_key = self.tls_key;
        }
        if self.tls_ca.is_some() {
            config.tls_ca = self.tls_ca;
        }
        if self.tls_domain.is_some() {
            config.tls_domain = self.tls_domain;
        }
        Ok(config)
    }
}

pub async fn handle_command(args: ServeArgs) -> Result<()> {
    let config = args.into_config()?;
    let agent_id = config.agent_id.clone();

    let node = MeshNode::new(config)?;
    let handle = node.serve().await?;
    println!(
        "{} {} {} {}",
        "node".green(),
        agent_id.bold(),
        "listening on".green(),
        handle.local_addr().to_string().bold()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    handle.shutdown();
    handle.stopped().await;
    Ok(())
}

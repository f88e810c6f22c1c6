// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde_json::json;

use super::{print_json, ConnectOpts};

#[derive(Subcommand)]
pub enum NetCommand {
    /// Check a node is alive
    Ping,

    /// Register an agent in the node's directory
    Register {
        /// Agent identifier
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,

        /// Host the agent's RPC server listens on
        #[arg(long)]
        host: String,

        /// Port the agent's RPC server listens on
        #[arg(long)]
        port: u16,

        /// Capability the agent advertises (repeatable)
        #[arg(short, long = "capability")]
        capabilities: Vec<String>,
    },

    /// Remove an agent from the directory
    Deregister {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },

    /// List registered agents
    List {
        /// Only active agents with this capability
        #[arg(short, long)]
        capability: Option<String>,
    },

    /// Send a heartbeat on behalf of an agent
    Heartbeat {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },

    /// Node-wide counters
    Stats,
}

pub async fn handle_command(command: NetCommand, opts: &ConnectOpts) -> Result<()> {
    match command {
        NetCommand::Ping => {
            let reply = opts.call("mesh.ping", json!({})).await?;
            let from = reply
                .get("agent_id")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            println!("{} {}", "pong from".green(), from.bold());
            Ok(())
        }
        NetCommand::Register {
            agent_id,
            host,
            port,
            capabilities,
        } => {
            opts.call(
                "mesh.register",
                json!({
                    "agent_id": agent_id,
                    "host": host,
                    "port": port,
                    "capabilities": capabilities,
                }),
            )
            .await?;
            println!("{} {}", "registered".green(), agent_id.bold());
            Ok(())
        }
        NetCommand::Deregister { agent_id } => {
            let reply = opts
                .call("mesh.deregister", json!({ "agent_id": agent_id }))
                .await?;
            if reply.get("removed").and_then(|v| v.as_bool()) == Some(true) {
                println!("{} {}", "deregistered".green(), agent_id.bold());
            } else {
                println!("{} {}", "not registered:".yellow(), agent_id);
            }
            Ok(())
        }
        NetCommand::List { capability } => {
            let reply = opts
                .call("mesh.list", json!({ "capability": capability }))
                .await?;
            print_json(reply.get("agents").unwrap_or(&reply))
        }
        NetCommand::Heartbeat { agent_id } => {
            let reply = opts
                .call("mesh.heartbeat", json!({ "agent_id": agent_id }))
                .await?;
            if reply.get("recovered").and_then(|v| v.as_bool()) == Some(true) {
                println!("{} {}", "recovered".green(), agent_id.bold());
            } else {
                println!("{} {}", "ok".green(), agent_id.bold());
            }
            Ok(())
        }
        NetCommand::Stats => {
            let reply = opts.call("mesh.stats", json!({})).await?;
            print_json(&reply)
        }
    }
}

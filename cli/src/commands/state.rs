// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};

use super::{print_json, ConnectOpts};

#[derive(Subcommand)]
pub enum StateCommand {
    /// Write a key on the node (replicates to the mesh)
    Set {
        #[arg(value_name = "KEY")]
        key: String,

        /// JSON value
        #[arg(value_name = "VALUE")]
        value: String,
    },

    /// Read a key
    Get {
        #[arg(value_name = "KEY")]
        key: String,
    },

    /// Delete a key (tombstones it mesh-wide)
    Delete {
        #[arg(value_name = "KEY")]
        key: String,
    },
}

pub async fn handle_command(command: StateCommand, opts: &ConnectOpts) -> Result<()> {
    match command {
        StateCommand::Set { key, value } => {
            let value: Value =
                serde_json::from_str(&value).context("value is not valid JSON")?;
            let reply = opts
                .call("state.set", json!({ "key": key, "value": value }))
                .await?;
            let version = reply.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
            println!("{} {} v{}", "set".green(), key.bold(), version);
            Ok(())
        }
        StateCommand::Get { key } => {
            let reply = opts.call("state.get", json!({ "key": key })).await?;
            match reply.get("value") {
                Some(Value::Null) | None => {
                    println!("{} {}", "not found:".yellow(), key);
                    Ok(())
                }
                Some(value) => print_json(value),
            }
        }
        StateCommand::Delete { key } => {
            opts.call("state.delete", json!({ "key": key })).await?;
            println!("{} {}", "deleted".green(), key.bold());
            Ok(())
        }
    }
}

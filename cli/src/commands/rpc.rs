// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::{json, Value};

use super::{print_json, ConnectOpts};

#[derive(Subcommand)]
pub enum RpcCommand {
    /// Call an arbitrary method on a node
    Call {
        /// Method name, e.g. `mesh.ping`
        #[arg(value_name = "METHOD")]
        method: String,

        /// JSON params (defaults to `{}`)
        #[arg(value_name = "PARAMS")]
        params: Option<String>,
    },
}

pub async fn handle_command(command: RpcCommand, opts: &ConnectOpts) -> Result<()> {
    match command {
        RpcCommand::Call { method, params } => {
            let params: Value = match params {
                Some(raw) => serde_json::from_str(&raw).context("params is not valid JSON")?,
                None => json!({}),
            };
            let reply = opts.call(&method, params).await?;
            print_json(&reply)
        }
    }
}

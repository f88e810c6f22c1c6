// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::{json, Value};

use super::{print_json, ConnectOpts};

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Dispatch a task through the node and wait for the result
    Dispatch {
        /// Capability the task requires
        #[arg(value_name = "CAPABILITY")]
        capability: String,

        /// JSON payload (defaults to `{}`)
        #[arg(long)]
        payload: Option<String>,

        /// round_robin, random, least_loaded, weighted, or performance_based
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Show a task's current status
    Status {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },
}

pub async fn handle_command(command: TaskCommand, opts: &ConnectOpts) -> Result<()> {
    match command {
        TaskCommand::Dispatch {
            capability,
            payload,
            strategy,
        } => {
            let payload: Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON")?,
                None => json!({}),
            };
            let reply = opts
                .call(
                    "task.dispatch",
                    json!({
                        "capability": capability,
                        "payload": payload,
                        "strategy": strategy,
                    }),
                )
                .await?;
            print_json(&reply)
        }
        TaskCommand::Status { task_id } => {
            let reply = opts
                .call("task.status", json!({ "task_id": task_id }))
                .await?;
            print_json(&reply)
        }
    }
}

// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};

use super::{print_json, ConnectOpts};

#[derive(Subcommand)]
pub enum LbCommand {
    /// Submit a task and assign it to an agent
    Assign {
        /// Capability the task requires
        #[arg(value_name = "CAPABILITY")]
        capability: String,

        /// JSON payload (defaults to `{}`)
        #[arg(long)]
        payload: Option<String>,

        /// round_robin, random, least_loaded, weighted, or performance_based
        #[arg(short, long)]
        strategy: Option<String>,

        /// Reuse an existing task id instead of generating one
        #[arg(long)]
        task_id: Option<String>,

        /// Restrict candidates to these agents (repeatable)
        #[arg(long = "agent")]
        agent_ids: Vec<String>,

        /// Agent weight as AGENT_ID=WEIGHT, for the weighted strategy (repeatable)
        #[arg(long = "weight", value_parser = parse_weight)]
        weights: Vec<(String, f64)>,
    },

    /// Report a task finished
    Complete {
        #[arg(value_name = "TASK_ID")]
        task_id: String,

        /// Mark the task failed instead of completed
        #[arg(long)]
        failed: bool,
    },

    /// Balancer counters per agent and strategy
    Stats,
}

fn parse_weight(raw: &str) -> Result<(String, f64), String> {
    let (agent, weight) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected AGENT_ID=WEIGHT, got `{raw}`"))?;
    let weight: f64 = weight
        .parse()
        .map_err(|_| format!("`{weight}` is not a number"))?;
    if weight < 0.0 {
        return Err("weight must be non-negative".into());
    }
    Ok((agent.to_string(), weight))
}

pub async fn handle_command(command: LbCommand, opts: &ConnectOpts) -> Result<()> {
    match command {
        LbCommand::Assign {
            capability,
            payload,
            strategy,
            task_id,
            agent_ids,
            weights,
        } => {
            let payload: Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON")?,
                None => json!({}),
            };
            let weights: HashMap<String, f64> = weights.into_iter().collect();
            let reply = opts
                .call(
                    "lb.assign",
                    json!({
                        "capability": capability,
                        "payload": payload,
                        "strategy": strategy,
                        "task_id": task_id,
                        "agent_ids": agent_ids,
                        "weights": weights,
                    }),
                )
                .await?;
            let agent = reply
                .get("agent_id")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let task = reply.get("task_id").and_then(|v| v.as_str()).unwrap_or("?");
            println!("{} {} {} {}", "task".green(), task.bold(), "->".dimmed(), agent.bold());
            Ok(())
        }
        LbCommand::Complete { task_id, failed } => {
            let reply = opts
                .call(
                    "lb.complete",
                    json!({ "task_id": task_id, "success": !failed }),
                )
                .await?;
            print_json(&reply)
        }
        LbCommand::Stats => {
            let reply = opts.call("lb.stats", json!({})).await?;
            print_json(&reply)
        }
    }
}

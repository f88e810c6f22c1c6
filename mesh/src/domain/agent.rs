// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator-assigned agent identifier, unique across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Health state of a registered agent.
///
/// Transitions are driven by heartbeats and the fault monitor sweep:
/// `Active -> Suspect -> Dead`, with `Suspect -> Active` on recovery.
/// An agent never goes directly from `Active` to `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Suspect,
    Dead,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => f.write_str("active"),
            AgentStatus::Suspect => f.write_str("suspect"),
            AgentStatus::Dead => f.write_str("dead"),
        }
    }
}

/// Directory entry for one agent: where to reach it, what it can do,
/// and how recently it proved it was alive.
///
/// Owned exclusively by the [`AgentRegistry`](crate::AgentRegistry);
/// mutated only through registry operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub host: String,
    pub port: u16,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(
        id: impl Into<AgentId>,
        host: impl Into<String>,
        port: u16,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            host: host.into(),
            port,
            capabilities: capabilities.into_iter().collect(),
            status: AgentStatus::Active,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// `host:port` dial string for the RPC client.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

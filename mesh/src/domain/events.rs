// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use super::agent::AgentId;
use super::task::TaskId;

/// Health and scheduling events emitted by the fault monitor.
///
/// Delivered over a tokio broadcast channel; subscribers that fall
/// behind lose the oldest events, never block the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// Heartbeat overdue past the suspect threshold.
    AgentSuspected { agent_id: AgentId },
    /// Heartbeat overdue past the dead threshold; excluded from
    /// candidate sets from now on.
    AgentDied { agent_id: AgentId },
    /// A suspect agent heartbeated again.
    AgentRecovered { agent_id: AgentId },
    /// A dead agent's record aged out of the retention window.
    AgentEvicted { agent_id: AgentId },
    /// Task pulled back from a dead agent, waiting for reassignment.
    TaskRequeued {
        task_id: TaskId,
        from_agent: AgentId,
        attempt_count: u32,
    },
    /// Task exhausted `max_attempts`; terminal, reported upward.
    TaskFailed { task_id: TaskId, attempt_count: u32 },
}

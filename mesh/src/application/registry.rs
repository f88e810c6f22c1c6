// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide directory of known agents.
//!
//! Read-mostly: listings take a shared lock and never block each
//! other; only registration, heartbeats, and the sweep take the
//! write lock. Insertion order is preserved so positional strategies
//! (round robin) behave deterministically across calls.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::agent::{AgentId, AgentRecord, AgentStatus};
use crate::domain::error::MeshError;

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<AgentId, AgentRecord>,
    /// Insertion order; an update keeps the agent's original slot.
    order: Vec<AgentId>,
}

/// What a sweep changed, so the fault monitor can react.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub suspected: Vec<AgentId>,
    pub died: Vec<AgentId>,
    pub evicted: Vec<AgentId>,
}

/// Counts for the `net stats` surface.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub suspect: usize,
    pub dead: usize,
    pub capabilities: HashMap<String, usize>,
}

#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an agent. Re-registration always resets the
    /// record to `Active` with a fresh heartbeat, but keeps the
    /// agent's original insertion slot.
    pub fn register(&self, mut record: AgentRecord) {
        record.status = AgentStatus::Active;
        record.last_heartbeat = Utc::now();

        let mut inner = self.inner.write();
        if !inner.agents.contains_key(&record.id) {
            inner.order.push(record.id.clone());
        }
        info!(agent_id = %record.id, addr = %record.addr(), "agent registered");
        inner.agents.insert(record.id.clone(), record);
    }

    pub fn deregister(&self, id: &AgentId) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.agents.remove(id).is_some();
        if removed {
            inner.order.retain(|a| a != id);
            info!(agent_id = %id, "agent deregistered");
        }
        removed
    }

    /// Refresh an agent's heartbeat. Returns `true` when this
    /// heartbeat recovered a `Suspect` agent back to `Active`. A
    /// `Dead` agent is not revived; it must re-register.
    pub fn heartbeat(&self, id: &AgentId) -> Result<bool, MeshError> {
        let mut inner = self.inner.write();
        let record = inner
            .agents
            .get_mut(id)
            .ok_or_else(|| MeshError::AgentNotFound(id.to_string()))?;

        if record.status == AgentStatus::Dead {
            return Ok(false);
        }

        record.last_heartbeat = Utc::now();
        if record.status == AgentStatus::Suspect {
            record.status = AgentStatus::Active;
            info!(agent_id = %id, "agent recovered");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentRecord> {
        self.inner.read().agents.get(id).cloned()
    }

    /// List agents in insertion order. With a capability filter, only
    /// `Active` agents advertising that capability are returned; the
    /// unfiltered form is the full directory, any status.
    pub fn list(&self, capability: Option<&str>) -> Vec<AgentRecord> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id))
            .filter(|record| match capability {
                Some(cap) => {
                    record.status == AgentStatus::Active && record.has_capability(cap)
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    /// One audit pass at `now`.
    ///
    /// `Active` past the suspect threshold becomes `Suspect`;
    /// `Suspect` past the dead threshold becomes `Dead`; `Dead` past
    /// the retention window is evicted. A badly overdue agent still
    /// walks `Active -> Suspect -> Dead` across successive sweeps;
    /// never straight to `Dead`.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        suspect_after: Duration,
        dead_after: Duration,
        retention: Duration,
    ) -> SweepOutcome {
        let suspect_after = chrono_duration(suspect_after);
        let dead_after = chrono_duration(dead_after);
        let retention = chrono_duration(retention);

        let mut outcome = SweepOutcome::default();
        let mut inner = self.inner.write();

        for record in inner.agents.values_mut() {
            let overdue = now - record.last_heartbeat;
            match record.status {
                AgentStatus::Active if overdue > suspect_after => {
                    record.status = AgentStatus::Suspect;
                    debug!(agent_id = %record.id, "agent suspected");
                    outcome.suspected.push(record.id.clone());
                }
                AgentStatus::Suspect if overdue > dead_after => {
                    record.status = AgentStatus::Dead;
                    info!(agent_id = %record.id, "agent declared dead");
                    outcome.died.push(record.id.clone());
                }
                AgentStatus::Dead if overdue > dead_after + retention => {
                    outcome.evicted.push(record.id.clone());
                }
                _ => {}
            }
        }

        for id in &outcome.evicted {
            inner.agents.remove(id);
            inner.order.retain(|a| a != id);
            debug!(agent_id = %id, "dead agent evicted");
        }

        outcome
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let mut stats = RegistryStats {
            total: inner.agents.len(),
            active: 0,
            suspect: 0,
            dead: 0,
            capabilities: HashMap::new(),
        };
        for record in inner.agents.values() {
            match record.status {
                AgentStatus::Active => stats.active += 1,
                AgentStatus::Suspect => stats.suspect += 1,
                AgentStatus::Dead => stats.dead += 1,
            }
            for cap in &record.capabilities {
                *stats.capabilities.entry(cap.clone()).or_default() += 1;
            }
        }
        stats
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::TimeDelta::MAX)
}

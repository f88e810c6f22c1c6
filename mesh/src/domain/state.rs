// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::agent::AgentId;

/// Versioned entry in the replicated key/value store.
///
/// Conflict resolution is last-writer-wins on `version`, with the
/// lexically greater `origin_agent_id` breaking ties so every node
/// converges on the same value regardless of delivery order.
/// Deletion is expressed as a tombstone: a `Null` value at a higher
/// version. Entries are never mutated in place, only superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub origin_agent_id: AgentId,
}

impl StateEntry {
    pub fn new(
        key: impl Into<String>,
        value: Value,
        version: u64,
        origin_agent_id: impl Into<AgentId>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            version,
            origin_agent_id: origin_agent_id.into(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }

    /// Whether `incoming` should replace this entry under the
    /// last-writer-wins policy.
    pub fn superseded_by(&self, incoming: &StateEntry) -> bool {
        incoming.version > self.version
            || (incoming.version == self.version
                && incoming.origin_agent_id > self.origin_agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn higher_version_wins() {
        let a = StateEntry::new("k", json!("a"), 2, "node-a");
        let b = StateEntry::new("k", json!("b"), 3, "node-b");
        assert!(a.superseded_by(&b));
        assert!(!b.superseded_by(&a));
    }

    #[test]
    fn version_tie_breaks_on_origin_id() {
        let a = StateEntry::new("k", json!("a"), 2, "node-a");
        let b = StateEntry::new("k", json!("b"), 2, "node-b");
        assert!(a.superseded_by(&b));
        assert!(!b.superseded_by(&a));
    }

    #[test]
    fn equal_entries_do_not_supersede() {
        let a = StateEntry::new("k", json!("a"), 2, "node-a");
        assert!(!a.superseded_by(&a.clone()));
    }

    #[test]
    fn null_value_is_tombstone() {
        let t = StateEntry::new("k", Value::Null, 4, "node-a");
        assert!(t.is_tombstone());
        assert!(!StateEntry::new("k", json!(0), 4, "node-a").is_tombstone());
    }
}

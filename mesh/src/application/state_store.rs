// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Replicated key/value state with last-writer-wins resolution.
//!
//! Each node owns a [`StateStore`]. Local writes bump the key version
//! and are fanned out to every active peer; remote entries arrive via
//! `state.sync` and merge through [`StateEntry::superseded_by`], so
//! concurrent writers converge on the same value in any delivery
//! order. Deletes are tombstones (JSON `null`) kept long enough for
//! the delete to out-replicate a stale write, then purged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::application::registry::AgentRegistry;
use crate::domain::agent::AgentId;
use crate::domain::state::StateEntry;
use crate::infrastructure::rpc_client::RpcClient;

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: StateEntry,
    applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StateStats {
    pub keys: usize,
    pub tombstones: usize,
}

pub struct StateStore {
    origin: AgentId,
    entries: RwLock<HashMap<String, StoredEntry>>,
    /// Hooked up once by [`StateStore::attach_replicator`]. Local
    /// writes before attachment are kept but not fanned out.
    replicate_tx: Mutex<Option<UnboundedSender<StateEntry>>>,
}

impl StateStore {
    pub fn new(origin: impl Into<AgentId>) -> Self {
        Self {
            origin: origin.into(),
            entries: RwLock::new(HashMap::new()),
            replicate_tx: Mutex::new(None),
        }
    }

    pub fn origin(&self) -> &AgentId {
        &self.origin
    }

    /// Wire up the replication channel and hand back the receiving
    /// end for [`spawn_replicator`].
    pub fn attach_replicator(&self) -> UnboundedReceiver<StateEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.replicate_tx.lock() = Some(tx);
        rx
    }

    /// Write a key locally. The new version is one past whatever this
    /// node last saw for the key, local or remote.
    pub fn set(&self, key: impl Into<String>, value: Value) -> StateEntry {
        self.write(key.into(), value)
    }

    /// Delete a key by writing a tombstone. The tombstone replicates
    /// like any other entry so peers converge on the delete.
    pub fn delete(&self, key: impl Into<String>) -> StateEntry {
        self.write(key.into(), Value::Null)
    }

    fn write(&self, key: String, value: Value) -> StateEntry {
        let entry = {
            let mut entries = self.entries.write();
            let version = entries.get(&key).map_or(0, |s| s.entry.version) + 1;
            let entry = StateEntry::new(key.clone(), value, version, self.origin.clone());
            entries.insert(
                key,
                StoredEntry {
                    entry: entry.clone(),
                    applied_at: Utc::now(),
                },
            );
            entry
        };
        if let Some(tx) = self.replicate_tx.lock().as_ref() {
            // Receiver dropped only on shutdown.
            let _ = tx.send(entry.clone());
        }
        entry
    }

    /// Resolve a key. Tombstoned and unknown keys both read as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read();
        let stored = entries.get(key)?;
        if stored.entry.is_tombstone() {
            None
        } else {
            Some(stored.entry.value.clone())
        }
    }

    /// The full entry including version and origin, tombstones too.
    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        self.entries.read().get(key).map(|s| s.entry.clone())
    }

    pub fn version(&self, key: &str) -> u64 {
        self.entries.read().get(key).map_or(0, |s| s.entry.version)
    }

    /// Merge an entry received from a peer. Returns whether it was
    /// applied. A losing entry is dropped, never counter-replicated;
    /// the winner's origin keeps fanning out its own write.
    pub fn apply_remote(&self, incoming: StateEntry) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&incoming.key) {
            Some(stored) if !stored.entry.superseded_by(&incoming) => {
                debug!(
                    key = %incoming.key,
                    held = stored.entry.version,
                    offered = incoming.version,
                    "stale sync entry dropped"
                );
                false
            }
            _ => {
                entries.insert(
                    incoming.key.clone(),
                    StoredEntry {
                        entry: incoming,
                        applied_at: Utc::now(),
                    },
                );
                true
            }
        }
    }

    /// Drop tombstones older than `retention`, keyed off when the
    /// tombstone was applied on this node.
    pub fn purge_tombstones(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(retention) {
            Ok(d) => now - d,
            Err(_) => return 0,
        };
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, stored| !(stored.entry.is_tombstone() && stored.applied_at < cutoff));
        before - entries.len()
    }

    pub fn stats(&self) -> StateStats {
        let entries = self.entries.read();
        let tombstones = entries.values().filter(|s| s.entry.is_tombstone()).count();
        StateStats {
            keys: entries.len() - tombstones,
            tombstones,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, s)| !s.entry.is_tombstone())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

const SYNC_ATTEMPTS: u32 = 3;
const SYNC_BACKOFF: Duration = Duration::from_millis(200);

/// Fan local writes out to every active peer. Each entry goes to each
/// peer on its own spawned task so one slow peer cannot stall the
/// others or the writer. Failed sends are retried a few times and
/// then abandoned; the periodic anti-entropy of later writes and
/// re-registration covers the gap.
pub fn spawn_replicator(
    store: Arc<StateStore>,
    registry: Arc<AgentRegistry>,
    client: Arc<RpcClient>,
    mut rx: UnboundedReceiver<StateEntry>,
) -> tokio::task::JoinHandle<()> {
    let origin = store.origin().clone();
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let peers: Vec<(AgentId, String)> = registry
                .list(None)
                .into_iter()
                .filter(|a| a.id != origin && a.status == crate::domain::agent::AgentStatus::Active)
                .map(|a| (a.id.clone(), a.addr()))
                .collect();
            for (peer_id, addr) in peers {
                let client = Arc::clone(&client);
                let entry = entry.clone();
                tokio::spawn(async move {
                    let params = match serde_json::to_value(&entry) {
                        Ok(v) => v,
                        Err(err) => {
                            warn!(%err, "state entry not serializable");
                            return;
                        }
                    };
                    let mut backoff = SYNC_BACKOFF;
                    for attempt in 1..=SYNC_ATTEMPTS {
                        match client.call(&addr, "state.sync", params.clone()).await {
                            Ok(_) => return,
                            Err(err) if attempt < SYNC_ATTEMPTS && err.is_retryable() => {
                                debug!(peer = %peer_id, %err, attempt, "state sync retry");
                                tokio::time::sleep(backoff).await;
                                backoff *= 2;
                            }
                            Err(err) => {
                                warn!(peer = %peer_id, key = %entry.key, %err, "state sync abandoned");
                                return;
                            }
                        }
                    }
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_bumps_version_and_get_resolves() {
        let store = StateStore::new("node-a");
        let first = store.set("color", json!("red"));
        let second = store.set("color", json!("blue"));
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.get("color"), Some(json!("blue")));
    }

    #[test]
    fn delete_reads_as_absent_but_keeps_tombstone() {
        let store = StateStore::new("node-a");
        store.set("color", json!("red"));
        let tomb = store.delete("color");
        assert_eq!(tomb.version, 2);
        assert!(tomb.is_tombstone());
        assert_eq!(store.get("color"), None);
        assert_eq!(store.version("color"), 2);
    }

    #[test]
    fn remote_entries_converge_in_either_delivery_order() {
        // Same concurrent writes applied to two stores in opposite
        // order must land on the same winner.
        let a = StateEntry::new("k", json!(1), 3, "node-a");
        let b = StateEntry::new("k", json!(2), 3, "node-b");

        let s1 = StateStore::new("node-x");
        assert!(s1.apply_remote(a.clone()));
        assert!(s1.apply_remote(b.clone()));

        let s2 = StateStore::new("node-y");
        assert!(s2.apply_remote(b));
        assert!(!s2.apply_remote(a));

        // node-b wins the version tie on origin id.
        assert_eq!(s1.get("k"), Some(json!(2)));
        assert_eq!(s2.get("k"), Some(json!(2)));
    }

    #[test]
    fn stale_remote_entry_is_dropped() {
        let store = StateStore::new("node-a");
        store.set("k", json!("local"));
        store.set("k", json!("local2"));
        assert!(!store.apply_remote(StateEntry::new("k", json!("old"), 1, "node-b")));
        assert_eq!(store.get("k"), Some(json!("local2")));
    }

    #[test]
    fn next_local_write_builds_on_remote_version() {
        let store = StateStore::new("node-a");
        store.apply_remote(StateEntry::new("k", json!("remote"), 7, "node-b"));
        let entry = store.set("k", json!("local"));
        assert_eq!(entry.version, 8);
    }

    #[test]
    fn tombstones_purge_after_retention() {
        let store = StateStore::new("node-a");
        store.set("kept", json!(1));
        store.delete("gone");
        assert_eq!(store.stats().tombstones, 1);

        let later = Utc::now() + chrono::Duration::seconds(3601);
        let purged = store.purge_tombstones(later, Duration::from_secs(3600));
        assert_eq!(purged, 1);
        assert_eq!(store.version("gone"), 0);
        assert_eq!(store.get("kept"), Some(json!(1)));
    }
}

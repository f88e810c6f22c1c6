// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}

fn default_suspect_secs() -> u64 {
    30
}

fn default_dead_secs() -> u64 {
    90
}

fn default_dead_retention_secs() -> u64 {
    600
}

fn default_audit_interval_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    100
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_reset_secs() -> u64 {
    60
}

fn default_tombstone_retention_secs() -> u64 {
    3600
}

/// Node-level configuration, serde-loadable from a JSON file.
///
/// Defaults match the source system's constants: 30 s heartbeat
/// timeout, 3 task attempts, 5-failure circuit breaker with a 60 s
/// reset window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Identifier this node registers itself under.
    pub agent_id: String,
    /// Address the RPC server binds, e.g. `127.0.0.1:7600`.
    pub bind_addr: String,
    /// Capabilities advertised in this node's own registration.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Hard cap on a single frame's declared payload length.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Seconds without a heartbeat before Active becomes Suspect.
    #[serde(default = "default_suspect_secs")]
    pub suspect_threshold_secs: u64,
    /// Seconds without a heartbeat before Suspect becomes Dead.
    #[serde(default = "default_dead_secs")]
    pub dead_threshold_secs: u64,
    /// Seconds a Dead record is kept before eviction.
    #[serde(default = "default_dead_retention_secs")]
    pub dead_retention_secs: u64,
    /// Fault monitor sweep interval.
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,

    /// Attempts before a task is permanently Failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Connection attempts before surfacing `ConnectionError`.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Base backoff between connection attempts; doubles per attempt.
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    /// Default per-call timeout.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Consecutive failures before an agent's circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds before an open circuit half-opens for probing.
    #[serde(default = "default_breaker_reset_secs")]
    pub breaker_reset_secs: u64,

    /// Seconds a tombstone entry is retained before the sweep purges it.
    #[serde(default = "default_tombstone_retention_secs")]
    pub tombstone_retention_secs: u64,

    /// PEM certificate chain presented at bind time. TLS is enabled
    /// when both `tls_cert` and `tls_key` are set.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    /// PEM PKCS#8 private key.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    /// Root certificates trusted for outbound calls. Outbound TLS is
    /// enabled when both `tls_ca` and `tls_domain` are set.
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
    /// Server name expected on peer certificates.
    #[serde(default)]
    pub tls_domain: Option<String>,
}

impl MeshConfig {
    pub fn new(agent_id: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            bind_addr: bind_addr.into(),
            capabilities: Vec::new(),
            max_frame_len: default_max_frame_len(),
            suspect_threshold_secs: default_suspect_secs(),
            dead_threshold_secs: default_dead_secs(),
            dead_retention_secs: default_dead_retention_secs(),
            audit_interval_secs: default_audit_interval_secs(),
            max_attempts: default_max_attempts(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            breaker_reset_secs: default_breaker_reset_secs(),
            tombstone_retention_secs: default_tombstone_retention_secs(),
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
            tls_domain: None,
        }
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::domain::error::MeshError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn suspect_threshold(&self) -> Duration {
        Duration::from_secs(self.suspect_threshold_secs)
    }

    pub fn dead_threshold(&self) -> Duration {
        Duration::from_secs(self.dead_threshold_secs)
    }

    pub fn dead_retention(&self) -> Duration {
        Duration::from_secs(self.dead_retention_secs)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn breaker_reset(&self) -> Duration {
        Duration::from_secs(self.breaker_reset_secs)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn outbound_tls_enabled(&self) -> bool {
        self.tls_ca.is_some() && self.tls_domain.is_some()
    }
}

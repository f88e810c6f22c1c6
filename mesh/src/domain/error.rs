// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::infrastructure::codec::RpcError;

/// Errors surfaced by the mesh core.
///
/// Only `Protocol` is fatal to a connection: a corrupted frame stream
/// cannot be resynchronized. Everything else is either recoverable in
/// place (retry, reassignment) or reported back to the caller.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Malformed frame or envelope. Closes the connection it arrived on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Declared frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// No handler registered under the requested method name.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A client call did not receive its response in time. The pending
    /// correlation is discarded; the remote handler may still complete.
    #[error("rpc call `{method}` timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// Connecting to a peer failed after all retry attempts.
    #[error("connection to {addr} failed: {reason}")]
    Connection { addr: String, reason: String },

    /// No registered agent satisfies the capability and health criteria.
    #[error("no available agent with capability `{capability}`")]
    NoAvailableAgent { capability: String },

    /// The remote handler returned an error response.
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(RpcError),

    #[error("agent not registered: {0}")]
    AgentNotFound(String),

    #[error("task not known to this balancer: {0}")]
    TaskNotFound(String),

    /// Completed and Failed tasks are immutable.
    #[error("task {0} is in a terminal state")]
    TaskTerminal(String),

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeshError {
    /// Short machine-readable kind, printed by the CLI next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::Protocol(_) | MeshError::FrameTooLarge { .. } => "protocol",
            MeshError::MethodNotFound(_) => "method-not-found",
            MeshError::Timeout { .. } => "timeout",
            MeshError::Connection { .. } => "connection",
            MeshError::NoAvailableAgent { .. } => "no-available-agent",
            MeshError::Remote(_) => "remote",
            MeshError::AgentNotFound(_) => "agent-not-found",
            MeshError::TaskNotFound(_) => "task-not-found",
            MeshError::TaskTerminal(_) => "task-terminal",
            MeshError::Tls(_) => "tls",
            MeshError::Io(_) => "io",
            MeshError::Json(_) => "json",
        }
    }

    /// Whether a client may safely retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Timeout { .. }
                | MeshError::Connection { .. }
                | MeshError::NoAvailableAgent { .. }
        )
    }
}

// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! # Lattice Mesh
//!
//! Coordination core for a network of independently running agent
//! processes: a framed RPC wire protocol (optionally TLS-wrapped), an
//! agent registry with heartbeat-based failure detection, pluggable
//! load-balancing strategies, a small replicated key/value store, and
//! a fault monitor that re-queues work stranded on dead agents.
//!
//! Task semantics live outside this crate: callers hand the mesh a
//! capability string and an opaque payload, and get back a result or
//! a typed error.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::agent::{AgentId, AgentRecord, AgentStatus};
pub use domain::config::MeshConfig;
pub use domain::error::MeshError;
pub use domain::events::MeshEvent;
pub use domain::state::StateEntry;
pub use domain::task::{Task, TaskId, TaskStatus};

pub use application::balancer::{LoadBalancer, Strategy};
pub use application::node::{MeshNode, NodeHandle};
pub use application::recovery::{CircuitBreakerSet, CircuitState, FaultMonitor};
pub use application::registry::AgentRegistry;
pub use application::state_store::StateStore;

pub use infrastructure::codec::{RpcError, RpcRequest, RpcResponse};
pub use infrastructure::rpc_client::RpcClient;
pub use infrastructure::rpc_server::{MethodRegistry, RpcHandler, RpcServer, ServerHandle};

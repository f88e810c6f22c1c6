// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Coordination services built on the RPC plumbing: the agent
//! registry, load balancer, replicated state store, fault monitor,
//! and the node wiring that composes them behind one RPC server.

pub mod balancer;
pub mod node;
pub mod recovery;
pub mod registry;
pub mod state_store;

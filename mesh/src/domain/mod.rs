// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Domain types shared across the mesh: agent records, tasks,
//! replicated state entries, configuration, and the error taxonomy.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod task;

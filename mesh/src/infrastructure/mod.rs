// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire-level plumbing: length-prefixed framing, the JSON-RPC style
//! envelope codec, TLS configuration, and the RPC server and client
//! built on top of them.

pub mod codec;
pub mod framing;
pub mod rpc_client;
pub mod rpc_server;
pub mod tls;

// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use lattice_mesh::infrastructure::tls;
use lattice_mesh::RpcClient;
use serde_json::Value;

pub mod lb;
pub mod net;
pub mod rpc;
pub mod serve;
pub mod state;
pub mod task;

pub use lb::LbCommand;
pub use net::NetCommand;
pub use rpc::RpcCommand;
pub use state::StateCommand;
pub use task::TaskCommand;

/// Connection settings shared by every command that talks to a node.
pub struct ConnectOpts {
    pub addr: String,
    pub tls_ca: Option<PathBuf>,
    pub tls_domain: Option<String>,
    pub timeout: Duration,
}

impl ConnectOpts {
    fn client(&self) -> Result<RpcClient> {
        let mut client = RpcClient::new().with_default_timeout(self.timeout);
        if let (Some(ca), Some(domain)) = (&self.tls_ca, &self.tls_domain) {
            client = client.with_tls(tls::connector(ca)?, tls::server_name(domain)?);
        }
        Ok(client)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        Ok(self.client()?.call(&self.addr, method, params).await?)
    }
}

pub fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

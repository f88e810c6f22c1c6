// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! TLS-wrapped RPC: the framed protocol is unchanged, only the
//! transport differs, and misconfigured peers are refused.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use lattice_mesh::infrastructure::rpc_client::RetryPolicy;
use lattice_mesh::infrastructure::rpc_server::MethodRegistry;
use lattice_mesh::infrastructure::tls;
use lattice_mesh::{RpcClient, RpcServer, ServerHandle};

fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

async fn tls_echo_server(cert: &Path, key: &Path) -> ServerHandle {
    let mut methods = MethodRegistry::new();
    methods.register_fn("echo", |params| async move { Ok(params) });
    RpcServer::new(methods)
        .with_tls(tls::acceptor(cert, key).unwrap())
        .bind("127.0.0.1:0")
        .await
        .unwrap()
}

#[tokio::test]
async fn tls_roundtrip_with_trusted_ca() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());
    let server = tls_echo_server(&cert, &key).await;
    let addr = server.local_addr().to_string();

    let client = RpcClient::new().with_tls(
        tls::connector(&cert).unwrap(),
        tls::server_name("localhost").unwrap(),
    );
    let reply = client.call(&addr, "echo", json!({ "secure": true })).await.unwrap();
    assert_eq!(reply, json!({ "secure": true }));
    server.shutdown();
}

#[tokio::test]
async fn plaintext_client_cannot_talk_to_tls_server() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());
    let server = tls_echo_server(&cert, &key).await;
    let addr = server.local_addr().to_string();

    // The server reads a TLS ClientHello where the client sent a
    // frame header; the handshake fails and the connection dies.
    let client = RpcClient::new()
        .with_retry(RetryPolicy {
            attempts: 1,
            base_backoff: Duration::from_millis(10),
        })
        .with_default_timeout(Duration::from_millis(800));
    assert!(client.call(&addr, "echo", json!({})).await.is_err());
    server.shutdown();
}

#[tokio::test]
async fn client_refuses_untrusted_server_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());
    let server = tls_echo_server(&cert, &key).await;
    let addr = server.local_addr().to_string();

    // A CA that never signed the server's certificate.
    let other_dir = tempfile::tempdir().unwrap();
    let (other_cert, _) = write_self_signed(other_dir.path());

    let client = RpcClient::new()
        .with_retry(RetryPolicy {
            attempts: 1,
            base_backoff: Duration::from_millis(10),
        })
        .with_tls(
            tls::connector(&other_cert).unwrap(),
            tls::server_name("localhost").unwrap(),
        );
    assert!(client.call(&addr, "echo", json!({})).await.is_err());
    server.shutdown();
}

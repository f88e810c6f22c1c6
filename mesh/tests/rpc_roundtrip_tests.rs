// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end exercises of the RPC server and client over real TCP
//! sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use lattice_mesh::infrastructure::codec::{self, RpcError};
use lattice_mesh::infrastructure::rpc_server::MethodRegistry;
use lattice_mesh::{MeshError, RpcClient, RpcServer};

async fn echo_server() -> lattice_mesh::ServerHandle {
    let mut methods = MethodRegistry::new();
    methods.register_fn("echo", |params| async move { Ok(params) });
    methods.register_fn("boom", |_params| async move {
        Err::<serde_json::Value, _>(RpcError::internal("handler exploded"))
    });
    RpcServer::new(methods)
        .bind("127.0.0.1:0")
        .await
        .unwrap()
}

#[tokio::test]
async fn concurrent_calls_on_one_client_each_get_their_own_response() {
    let server = echo_server().await;
    let addr = server.local_addr().to_string();

    // One shared client, so concurrent callers check connections out
    // of and back into the same pool.
    let client = Arc::new(RpcClient::new());
    let mut handles = Vec::new();
    for i in 0..64 {
        let addr = addr.clone();
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let reply = client
                .call(&addr, "echo", json!({ "n": i }))
                .await
                .unwrap();
            assert_eq!(reply, json!({ "n": i }));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    server.shutdown();
}

#[tokio::test]
async fn sequential_calls_reuse_the_connection() {
    let server = echo_server().await;
    let addr = server.local_addr().to_string();
    let client = RpcClient::new();

    for i in 0..10 {
        let reply = client.call(&addr, "echo", json!(i)).await.unwrap();
        assert_eq!(reply, json!(i));
    }
    server.shutdown();
}

#[tokio::test]
async fn unknown_method_is_reported_and_connection_survives() {
    let server = echo_server().await;
    let addr = server.local_addr().to_string();
    let client = RpcClient::new();

    let err = client.call(&addr, "no.such.method", json!({})).await.unwrap_err();
    match err {
        MeshError::Remote(rpc) => assert_eq!(rpc.code, codec::METHOD_NOT_FOUND),
        other => panic!("expected remote error, got {other}"),
    }

    // Same client keeps working.
    let reply = client.call(&addr, "echo", json!("still here")).await.unwrap();
    assert_eq!(reply, json!("still here"));
    server.shutdown();
}

#[tokio::test]
async fn handler_error_keeps_connection_open() {
    let server = echo_server().await;
    let addr = server.local_addr().to_string();
    let client = RpcClient::new();

    let err = client.call(&addr, "boom", json!({})).await.unwrap_err();
    match err {
        MeshError::Remote(rpc) => {
            assert_eq!(rpc.code, codec::INTERNAL_ERROR);
            assert!(rpc.message.contains("handler exploded"));
        }
        other => panic!("expected remote error, got {other}"),
    }

    let reply = client.call(&addr, "echo", json!(1)).await.unwrap();
    assert_eq!(reply, json!(1));
    server.shutdown();
}

#[tokio::test]
async fn graceful_shutdown_stops_accepting() {
    let server = echo_server().await;
    let addr = server.local_addr().to_string();

    let client = RpcClient::new();
    client.call(&addr, "echo", json!({})).await.unwrap();

    server.shutdown();
    server.stopped().await;

    let client = RpcClient::new()
        .with_retry(lattice_mesh::infrastructure::rpc_client::RetryPolicy {
            attempts: 1,
            base_backoff: Duration::from_millis(10),
        })
        .with_default_timeout(Duration::from_millis(500));
    assert!(client.call(&addr, "echo", json!({})).await.is_err());
}

#[tokio::test]
async fn oversized_request_is_rejected() {
    let mut methods = MethodRegistry::new();
    methods.register_fn("echo", |params| async move { Ok(params) });
    let server = RpcServer::new(methods)
        .with_max_frame_len(1024)
        .bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().to_string();

    let client = RpcClient::new().with_default_timeout(Duration::from_secs(2));
    let big = "x".repeat(8 * 1024);
    assert!(client.call(&addr, "echo", json!(big)).await.is_err());
    server.shutdown();
}

#[tokio::test]
async fn fully_written_request_is_not_resent_on_a_stale_connection() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lattice_mesh::infrastructure::codec::DecodedRequest;
    use lattice_mesh::infrastructure::framing;
    use lattice_mesh::RpcResponse;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let requests_seen = Arc::new(AtomicUsize::new(0));

    // First connection: answer one request, swallow the next and close.
    // Every later connection answers normally, so a client that wrongly
    // re-sends a swallowed request would still get a success back.
    let seen = Arc::clone(&requests_seen);
    tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        let frame = framing::read_frame(&mut first, 1 << 20).await.unwrap().unwrap();
        seen.fetch_add(1, Ordering::SeqCst);
        if let DecodedRequest::Ok(req) = codec::decode_request(&frame).unwrap() {
            let reply = serde_json::to_vec(&RpcResponse::success(req.id, json!(1))).unwrap();
            framing::write_frame(&mut first, &reply).await.unwrap();
        }
        let _ = framing::read_frame(&mut first, 1 << 20).await.unwrap();
        seen.fetch_add(1, Ordering::SeqCst);
        drop(first);

        loop {
            let (mut conn, _) = listener.accept().await.unwrap();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                while let Ok(Some(frame)) = framing::read_frame(&mut conn, 1 << 20).await {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if let Ok(DecodedRequest::Ok(req)) = codec::decode_request(&frame) {
                        let reply =
                            serde_json::to_vec(&RpcResponse::success(req.id, json!(1))).unwrap();
                        let _ = framing::write_frame(&mut conn, &reply).await;
                    }
                }
            });
        }
    });

    let client = RpcClient::new().with_default_timeout(Duration::from_secs(2));
    client.call(&addr, "count", json!({})).await.unwrap();

    // The pooled connection delivers the request but dies before the
    // response; the client must surface the error, not retry blind.
    let err = client.call(&addr, "count", json!({})).await.unwrap_err();
    assert!(matches!(err, MeshError::Connection { .. }), "got {err}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(requests_seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn method_stats_count_calls_and_failures() {
    let server = echo_server().await;
    let addr = server.local_addr().to_string();
    let client = RpcClient::new();

    client.call(&addr, "echo", json!(1)).await.unwrap();
    client.call(&addr, "echo", json!(2)).await.unwrap();
    let _ = client.call(&addr, "boom", json!({})).await;

    let stats = server.method_stats();
    assert_eq!(stats["echo"].calls, 2);
    assert_eq!(stats["echo"].failures, 0);
    assert_eq!(stats["boom"].calls, 1);
    assert_eq!(stats["boom"].failures, 1);
    server.shutdown();
}

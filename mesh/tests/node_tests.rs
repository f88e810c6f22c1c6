// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-node behavior: two real nodes on loopback discovering each
//! other, dispatching work, replicating state, and recovering from a
//! silent agent.

use std::time::Duration;

use serde_json::{json, Value};
use lattice_mesh::{MeshConfig, MeshNode, NodeHandle, RpcClient};

async fn start_node(agent_id: &str, capabilities: &[&str]) -> NodeHandle {
    let mut config = MeshConfig::new(agent_id, "127.0.0.1:0");
    config.capabilities = capabilities.iter().map(|s| s.to_string()).collect();
    MeshNode::new(config).unwrap().serve().await.unwrap()
}

async fn register_peer(client: &RpcClient, via: &str, peer: &NodeHandle, id: &str, cap: &str) {
    let addr = peer.local_addr();
    client
        .call(
            via,
            "mesh.register",
            json!({
                "agent_id": id,
                "host": addr.ip().to_string(),
                "port": addr.port(),
                "capabilities": [cap],
            }),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn node_answers_ping_and_lists_itself() {
    let node = start_node("node-a", &["search"]).await;
    let addr = node.local_addr().to_string();
    let client = RpcClient::new();

    let pong = client.call(&addr, "mesh.ping", json!({})).await.unwrap();
    assert_eq!(pong["pong"], json!(true));
    assert_eq!(pong["agent_id"], json!("node-a"));

    let listed = client.call(&addr, "mesh.list", json!({})).await.unwrap();
    let agents = listed["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["id"], json!("node-a"));

    node.shutdown();
    node.stopped().await;
}

#[tokio::test]
async fn heartbeat_for_unknown_agent_is_an_error() {
    let node = start_node("node-a", &[]).await;
    let addr = node.local_addr().to_string();
    let client = RpcClient::new();

    let err = client
        .call(&addr, "mesh.heartbeat", json!({ "agent_id": "ghost" }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("register"));

    node.shutdown();
}

#[tokio::test]
async fn dispatch_runs_task_on_capable_peer() {
    let a = start_node("node-a", &[]).await;
    let b = start_node("node-b", &["echo"]).await;
    let a_addr = a.local_addr().to_string();
    let client = RpcClient::new();

    register_peer(&client, &a_addr, &b, "node-b", "echo").await;

    let reply = client
        .call(
            &a_addr,
            "task.dispatch",
            json!({ "capability": "echo", "payload": { "word": "hi" } }),
        )
        .await
        .unwrap();
    assert_eq!(reply["agent_id"], json!("node-b"));
    assert_eq!(reply["result"]["ack"], json!(true));
    assert_eq!(reply["result"]["payload"]["payload"]["word"], json!("hi"));

    // The task reached a terminal state on the coordinator.
    let status = client
        .call(&a_addr, "task.status", json!({ "task_id": reply["task_id"] }))
        .await
        .unwrap();
    assert_eq!(status["status"], json!("completed"));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn state_write_replicates_to_registered_peer() {
    let a = start_node("node-a", &[]).await;
    let b = start_node("node-b", &[]).await;
    let a_addr = a.local_addr().to_string();
    let b_addr = b.local_addr().to_string();
    let client = RpcClient::new();

    register_peer(&client, &a_addr, &b, "node-b", "state").await;

    client
        .call(&a_addr, "state.set", json!({ "key": "color", "value": "teal" }))
        .await
        .unwrap();

    let mut replicated = Value::Null;
    for _ in 0..50 {
        let got = client
            .call(&b_addr, "state.get", json!({ "key": "color" }))
            .await
            .unwrap();
        if got["value"] == json!("teal") {
            replicated = got;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(replicated["value"], json!("teal"));
    assert_eq!(replicated["version"], json!(1));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn silent_agent_is_swept_and_its_task_requeued() {
    let mut config = MeshConfig::new("node-a", "127.0.0.1:0");
    config.suspect_threshold_secs = 1;
    config.dead_threshold_secs = 2;
    config.audit_interval_secs = 1;
    let node = MeshNode::new(config).unwrap().serve().await.unwrap();
    let addr = node.local_addr().to_string();
    let client = RpcClient::new();

    // An agent that registers once and never heartbeats. Nothing
    // listens on its port; we only exercise the sweep.
    client
        .call(
            &addr,
            "mesh.register",
            json!({
                "agent_id": "mute",
                "host": "127.0.0.1",
                "port": 1,
                "capabilities": ["search"],
            }),
        )
        .await
        .unwrap();

    let assigned = client
        .call(&addr, "lb.assign", json!({ "capability": "search" }))
        .await
        .unwrap();
    assert_eq!(assigned["agent_id"], json!("mute"));
    let task_id = assigned["task_id"].clone();

    // Suspect after ~1s, dead after ~2s, then the task comes back.
    let mut requeued = false;
    for _ in 0..80 {
        let status = client
            .call(&addr, "task.status", json!({ "task_id": task_id }))
            .await
            .unwrap();
        if status["status"] == json!("pending") && status["attempt_count"] == json!(1) {
            requeued = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(requeued, "task was not pulled back from the dead agent");

    let listed = client
        .call(&addr, "mesh.list", json!({ "capability": "search" }))
        .await
        .unwrap();
    assert!(listed["agents"].as_array().unwrap().is_empty());

    node.shutdown();
    node.stopped().await;
}

// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! A full mesh node: RPC server, registry, balancer, state store,
//! and fault monitor wired together behind one config.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::application::balancer::{LoadBalancer, Strategy};
use crate::application::recovery::{CircuitBreakerSet, FaultMonitor};
use crate::application::registry::AgentRegistry;
use crate::application::state_store::{self, StateStore};
use crate::domain::agent::{AgentId, AgentRecord, AgentStatus};
use crate::domain::config::MeshConfig;
use crate::domain::error::MeshError;
use crate::domain::events::MeshEvent;
use crate::domain::state::StateEntry;
use crate::domain::task::{Task, TaskId, TaskStatus};
use crate::infrastructure::codec::RpcError;
use crate::infrastructure::rpc_client::{RetryPolicy, RpcClient};
use crate::infrastructure::rpc_server::{MethodRegistry, RpcHandler, RpcServer, ServerHandle};
use crate::infrastructure::tls;

const EVENT_CHANNEL_CAPACITY: usize = 256;

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

#[derive(Deserialize)]
struct RegisterParams {
    agent_id: String,
    host: String,
    port: u16,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Deserialize)]
struct AgentParams {
    agent_id: String,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    capability: Option<String>,
}

#[derive(Deserialize)]
struct AssignParams {
    #[serde(default)]
    task_id: Option<String>,
    capability: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    strategy: Option<String>,
    /// Explicit candidate set; defaults to the capability listing.
    #[serde(default)]
    agent_ids: Vec<String>,
    /// Per-agent weights for the `weighted` strategy.
    #[serde(default)]
    weights: HashMap<String, f64>,
}

#[derive(Deserialize)]
struct CompleteParams {
    task_id: String,
    success: bool,
}

#[derive(Deserialize)]
struct TaskParams {
    task_id: String,
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Deserialize)]
struct SetParams {
    key: String,
    value: Value,
}

#[derive(Deserialize)]
struct DispatchParams {
    capability: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    strategy: Option<String>,
}

fn strategy_of(raw: &Option<String>) -> Result<Strategy, RpcError> {
    match raw {
        None => Ok(Strategy::RoundRobin),
        Some(s) => s.parse().map_err(RpcError::invalid_params),
    }
}

/// Everything a node needs, built from a [`MeshConfig`] and started
/// with [`MeshNode::serve`].
pub struct MeshNode {
    config: MeshConfig,
    registry: Arc<AgentRegistry>,
    balancer: Arc<LoadBalancer>,
    state: Arc<StateStore>,
    breakers: Arc<CircuitBreakerSet>,
    client: Arc<RpcClient>,
    events: broadcast::Sender<MeshEvent>,
    task_handler: Option<Arc<dyn RpcHandler>>,
}

impl MeshNode {
    pub fn new(config: MeshConfig) -> Result<Self, MeshError> {
        let mut client = RpcClient::new()
            .with_max_frame_len(config.max_frame_len)
            .with_default_timeout(config.call_timeout())
            .with_retry(RetryPolicy {
                attempts: config.connect_attempts,
                base_backoff: config.connect_backoff(),
            });
        if let (Some(ca), Some(domain)) = (&config.tls_ca, &config.tls_domain) {
            client = client.with_tls(tls::connector(ca)?, tls::server_name(domain)?);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            registry: Arc::new(AgentRegistry::new()),
            balancer: Arc::new(LoadBalancer::new(config.max_attempts)),
            state: Arc::new(StateStore::new(config.agent_id.clone())),
            breakers: Arc::new(CircuitBreakerSet::new(
                config.failure_threshold,
                config.breaker_reset(),
            )),
            client: Arc::new(client),
            events,
            task_handler: None,
            config,
        })
    }

    /// Install the handler run when a peer dispatches `task.run` to
    /// this node. Without one the node acknowledges and echoes.
    pub fn with_task_handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.task_handler = Some(handler);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Bind the server, register this node in its own directory, and
    /// start the replicator and fault monitor.
    pub async fn serve(self) -> Result<NodeHandle, MeshError> {
        let registry = self.build_methods();

        let mut server = RpcServer::new(registry).with_max_frame_len(self.config.max_frame_len);
        if let (Some(cert), Some(key)) = (&self.config.tls_cert, &self.config.tls_key) {
            info!("tls enabled for inbound connections");
            server = server.with_tls(tls::acceptor(cert, key)?);
        }
        let server = server.bind(&self.config.bind_addr).await?;
        let local_addr = server.local_addr();
        info!(agent_id = %self.config.agent_id, %local_addr, "mesh node listening");

        self.registry.register(AgentRecord::new(
            self.config.agent_id.clone(),
            local_addr.ip().to_string(),
            local_addr.port(),
            self.config.capabilities.iter().cloned(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let replicator = state_store::spawn_replicator(
            Arc::clone(&self.state),
            Arc::clone(&self.registry),
            Arc::clone(&self.client),
            self.state.attach_replicator(),
        );

        let monitor = Arc::new(FaultMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.balancer),
            Arc::clone(&self.state),
            Arc::clone(&self.breakers),
            self.events.clone(),
            &self.config,
        ));
        let monitor = monitor.spawn(self.config.audit_interval(), shutdown_rx);

        Ok(NodeHandle {
            server,
            shutdown_tx,
            monitor,
            replicator,
            events: self.events,
        })
    }

    fn build_methods(&self) -> MethodRegistry {
        let mut methods = MethodRegistry::new();
        let agent_id = self.config.agent_id.clone();

        methods.register_fn("mesh.ping", move |_params| {
            let agent_id = agent_id.clone();
            async move {
                Ok(json!({
                    "pong": true,
                    "agent_id": agent_id,
                    "time": chrono::Utc::now().to_rfc3339(),
                }))
            }
        });

        methods.register_fn("mesh.echo", |params| async move { Ok(params) });

        let registry = Arc::clone(&self.registry);
        methods.register_fn("mesh.register", move |params| {
            let registry = Arc::clone(&registry);
            async move {
                let p: RegisterParams = parse(params)?;
                registry.register(AgentRecord::new(
                    p.agent_id.clone(),
                    p.host,
                    p.port,
                    p.capabilities,
                ));
                Ok(json!({ "registered": true, "agent_id": p.agent_id }))
            }
        });

        let registry = Arc::clone(&self.registry);
        methods.register_fn("mesh.deregister", move |params| {
            let registry = Arc::clone(&registry);
            async move {
                let p: AgentParams = parse(params)?;
                let removed = registry.deregister(&AgentId::from(p.agent_id));
                Ok(json!({ "removed": removed }))
            }
        });

        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        methods.register_fn("mesh.heartbeat", move |params| {
            let registry = Arc::clone(&registry);
            let events = events.clone();
            async move {
                let p: AgentParams = parse(params)?;
                let id = AgentId::from(p.agent_id);
                match registry.heartbeat(&id) {
                    Ok(recovered) => {
                        if recovered {
                            info!(agent_id = %id, "agent recovered");
                            let _ = events.send(MeshEvent::AgentRecovered { agent_id: id });
                        }
                        Ok(json!({ "status": "ok", "recovered": recovered }))
                    }
                    Err(err) => Err(RpcError::invalid_params(format!(
                        "{err}: register before heartbeating"
                    ))),
                }
            }
        });

        let registry = Arc::clone(&self.registry);
        methods.register_fn("mesh.list", move |params| {
            let registry = Arc::clone(&registry);
            async move {
                let p: ListParams = parse(params)?;
                let agents = registry.list(p.capability.as_deref());
                Ok(json!({ "agents": to_json(&agents)? }))
            }
        });

        let registry = Arc::clone(&self.registry);
        let balancer = Arc::clone(&self.balancer);
        let state = Arc::clone(&self.state);
        let breakers = Arc::clone(&self.breakers);
        methods.register_fn("mesh.stats", move |_params| {
            let registry = Arc::clone(&registry);
            let balancer = Arc::clone(&balancer);
            let state = Arc::clone(&state);
            let breakers = Arc::clone(&breakers);
            async move {
                Ok(json!({
                    "registry": to_json(&registry.stats())?,
                    "balancer": to_json(&balancer.stats())?,
                    "state": to_json(&state.stats())?,
                    "breakers": to_json(&breakers.snapshot())?,
                }))
            }
        });

        let registry = Arc::clone(&self.registry);
        let balancer = Arc::clone(&self.balancer);
        let breakers = Arc::clone(&self.breakers);
        methods.register_fn("lb.assign", move |params| {
            let registry = Arc::clone(&registry);
            let balancer = Arc::clone(&balancer);
            let breakers = Arc::clone(&breakers);
            async move {
                let p: AssignParams = parse(params)?;
                let strategy = strategy_of(&p.strategy)?;
                let task_id = match p.task_id {
                    Some(id) => TaskId::from(id.as_str()),
                    None => TaskId::generate(),
                };
                balancer.submit(Task::new(task_id.clone(), p.capability.clone(), p.payload));

                let pool: Vec<AgentRecord> = if p.agent_ids.is_empty() {
                    registry.list(Some(&p.capability))
                } else {
                    p.agent_ids
                        .iter()
                        .filter_map(|id| registry.get(&AgentId::from(id.as_str())))
                        .collect()
                };
                let candidates: Vec<AgentRecord> = pool
                    .into_iter()
                    .filter(|a| breakers.allow(&a.id))
                    .collect();
                let weights = (!p.weights.is_empty()).then_some(&p.weights);
                let chosen = balancer
                    .assign(&task_id, &candidates, strategy, weights)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                Ok(json!({
                    "task_id": task_id.as_str(),
                    "agent_id": chosen.id.as_str(),
                    "addr": chosen.addr(),
                }))
            }
        });

        let balancer = Arc::clone(&self.balancer);
        methods.register_fn("lb.complete", move |params| {
            let balancer = Arc::clone(&balancer);
            async move {
                let p: CompleteParams = parse(params)?;
                let status = balancer
                    .complete(&TaskId::from(p.task_id.as_str()), p.success)
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                Ok(json!({ "status": to_json(&status)? }))
            }
        });

        let balancer = Arc::clone(&self.balancer);
        methods.register_fn("lb.stats", move |_params| {
            let balancer = Arc::clone(&balancer);
            async move { to_json(&balancer.stats()) }
        });

        let state = Arc::clone(&self.state);
        methods.register_fn("state.set", move |params| {
            let state = Arc::clone(&state);
            async move {
                let p: SetParams = parse(params)?;
                let entry = state.set(p.key, p.value);
                to_json(&entry)
            }
        });

        let state = Arc::clone(&self.state);
        methods.register_fn("state.get", move |params| {
            let state = Arc::clone(&state);
            async move {
                let p: KeyParams = parse(params)?;
                Ok(json!({
                    "key": p.key,
                    "value": state.get(&p.key),
                    "version": state.version(&p.key),
                }))
            }
        });

        let state = Arc::clone(&self.state);
        methods.register_fn("state.delete", move |params| {
            let state = Arc::clone(&state);
            async move {
                let p: KeyParams = parse(params)?;
                let entry = state.delete(p.key);
                to_json(&entry)
            }
        });

        let state = Arc::clone(&self.state);
        methods.register_fn("state.sync", move |params| {
            let state = Arc::clone(&state);
            async move {
                let entry: StateEntry = parse(params)?;
                let applied = state.apply_remote(entry);
                Ok(json!({ "applied": applied }))
            }
        });

        let registry = Arc::clone(&self.registry);
        let balancer = Arc::clone(&self.balancer);
        let breakers = Arc::clone(&self.breakers);
        let client = Arc::clone(&self.client);
        let max_attempts = self.config.max_attempts;
        methods.register_fn("task.dispatch", move |params| {
            let registry = Arc::clone(&registry);
            let balancer = Arc::clone(&balancer);
            let breakers = Arc::clone(&breakers);
            let client = Arc::clone(&client);
            async move {
                let p: DispatchParams = parse(params)?;
                let strategy = strategy_of(&p.strategy)?;
                let task_id = TaskId::generate();
                balancer.submit(Task::new(
                    task_id.clone(),
                    p.capability.clone(),
                    p.payload.clone(),
                ));

                dispatch_task(
                    &registry, &balancer, &breakers, &client, &task_id, &p.capability,
                    p.payload, strategy, max_attempts,
                )
                .await
            }
        });

        let balancer = Arc::clone(&self.balancer);
        methods.register_fn("task.status", move |params| {
            let balancer = Arc::clone(&balancer);
            async move {
                let p: TaskParams = parse(params)?;
                match balancer.get(&TaskId::from(p.task_id.as_str())) {
                    Some(task) => to_json(&task),
                    None => Err(RpcError::invalid_params(format!(
                        "unknown task: {}",
                        p.task_id
                    ))),
                }
            }
        });

        let task_handler = self.task_handler.clone();
        methods.register_fn("task.run", move |params| {
            let task_handler = task_handler.clone();
            async move {
                match task_handler {
                    Some(handler) => handler.handle(params).await,
                    None => Ok(json!({ "ack": true, "payload": params })),
                }
            }
        });

        methods
    }
}

/// Assign-call loop behind `task.dispatch`. Each failed call trips
/// the agent's breaker counter and consumes one task attempt; the
/// next iteration assigns among the remaining allowed agents.
#[allow(clippy::too_many_arguments)]
async fn dispatch_task(
    registry: &AgentRegistry,
    balancer: &LoadBalancer,
    breakers: &CircuitBreakerSet,
    client: &RpcClient,
    task_id: &TaskId,
    capability: &str,
    payload: Value,
    strategy: Strategy,
    max_attempts: u32,
) -> Result<Value, RpcError> {
    for _ in 0..max_attempts {
        let candidates: Vec<AgentRecord> = registry
            .list(Some(capability))
            .into_iter()
            .filter(|a| a.status == AgentStatus::Active && breakers.allow(&a.id))
            .collect();

        let chosen = match balancer.assign(task_id, &candidates, strategy, None) {
            Ok(agent) => agent,
            Err(err) => return Err(RpcError::internal(err.to_string())),
        };
        if let Err(err) = balancer.mark_running(task_id) {
            return Err(RpcError::internal(err.to_string()));
        }

        let request = json!({ "task_id": task_id.as_str(), "payload": payload });
        match client.call(&chosen.addr(), "task.run", request).await {
            Ok(result) => {
                breakers.record_success(&chosen.id);
                balancer
                    .complete(task_id, true)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                return Ok(json!({
                    "task_id": task_id.as_str(),
                    "agent_id": chosen.id.as_str(),
                    "result": result,
                }));
            }
            Err(err) => {
                warn!(task_id = %task_id, agent_id = %chosen.id, %err, "dispatch attempt failed");
                breakers.record_failure(&chosen.id);
                match balancer.requeue_task(task_id) {
                    Ok((TaskStatus::Failed, attempts)) => {
                        return Err(RpcError::internal(format!(
                            "task failed after {attempts} attempts: {err}"
                        )))
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(RpcError::internal(e.to_string())),
                }
            }
        }
    }
    Err(RpcError::internal("task attempts exhausted"))
}

/// Running node. Dropping the handle does not stop the node; call
/// [`NodeHandle::shutdown`] then await [`NodeHandle::stopped`].
pub struct NodeHandle {
    server: ServerHandle,
    shutdown_tx: watch::Sender<bool>,
    monitor: tokio::task::JoinHandle<()>,
    replicator: tokio::task::JoinHandle<()>,
    events: broadcast::Sender<MeshEvent>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Begin graceful shutdown: stop sweeping, stop accepting, let
    /// in-flight requests drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.server.shutdown();
    }

    pub async fn stopped(self) {
        self.server.stopped().await;
        self.monitor.abort();
        self.replicator.abort();
    }
}

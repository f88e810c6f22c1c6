// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Framed RPC server.
//!
//! One tokio task per accepted connection. Within a connection the
//! loop is strict FIFO: read a frame, dispatch, write the response,
//! then read the next frame, so responses always leave in request
//! order. Across connections there is no ordering guarantee.
//!
//! Handler errors become error responses and the connection stays
//! open; only framing/envelope corruption closes a connection, since
//! a corrupted length-prefixed stream cannot be resynchronized.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::codec::{self, DecodedRequest, RpcError, RpcRequest, RpcResponse};
use super::framing::{self, DEFAULT_MAX_FRAME_LEN};
use crate::domain::error::MeshError;

/// Fixed handler signature: opaque params in, result or error out.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value, RpcError>;
}

type BoxedHandlerFn = Box<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>> + Send + Sync,
>;

struct FnHandler {
    f: BoxedHandlerFn,
}

#[async_trait]
impl RpcHandler for FnHandler {
    async fn handle(&self, params: Value) -> Result<Value, RpcError> {
        (self.f)(params).await
    }
}

/// Mapping from method name to handler, populated at server
/// construction time.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn RpcHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        let name = name.into();
        debug!(method = %name, "rpc method registered");
        self.methods.insert(name, handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let boxed: BoxedHandlerFn = Box::new(move |params| Box::pin(f(params)));
        self.register(name, Arc::new(FnHandler { f: boxed }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RpcHandler>> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Per-method call counters, kept for the stats surface.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MethodStats {
    pub calls: u64,
    pub failures: u64,
    pub total_micros: u64,
}

type StatsMap = Arc<RwLock<HashMap<String, MethodStats>>>;

/// Framed RPC server, bound with [`RpcServer::bind`].
pub struct RpcServer {
    registry: Arc<MethodRegistry>,
    max_frame_len: usize,
    grace: Duration,
    tls: Option<TlsAcceptor>,
}

impl RpcServer {
    pub fn new(registry: MethodRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            grace: Duration::from_secs(5),
            tls: None,
        }
    }

    /// Wrap every accepted connection in TLS before framing starts.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// How long in-flight requests get to drain after shutdown before
    /// their connections are force-closed.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Bind the listener and start accepting connections.
    pub async fn bind(self, addr: &str) -> Result<ServerHandle, MeshError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats: StatsMap = Arc::new(RwLock::new(HashMap::new()));

        let task = tokio::spawn(accept_loop(
            listener,
            self.registry,
            self.max_frame_len,
            self.tls,
            self.grace,
            shutdown_rx,
            stats.clone(),
        ));

        info!(%local_addr, "rpc server listening");
        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
            stats,
        })
    }
}

/// Control handle for a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    stats: StatsMap,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown: stop accepting, drain in-flight requests up to
    /// the grace deadline, then force-close what remains. Synchronous
    /// and safe to call from any context; pair with [`Self::stopped`]
    /// to await completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait until the accept loop and all connections have finished.
    pub async fn stopped(self) {
        let _ = self.task.await;
    }

    /// Snapshot of per-method call counters.
    pub fn method_stats(&self) -> HashMap<String, MethodStats> {
        self.stats.read().clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<MethodRegistry>,
    max_frame_len: usize,
    tls: Option<TlsAcceptor>,
    grace: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: StatsMap,
) {
    let mut conns: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        let tls = tls.clone();
                        let rx = shutdown_rx.clone();
                        let stats = stats.clone();
                        conns.spawn(serve_connection(
                            stream, peer, registry, max_frame_len, tls, rx, stats,
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            // Reap finished connection tasks so the set stays small.
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    drop(listener);
    let deadline = tokio::time::timeout(grace, async {
        while conns.join_next().await.is_some() {}
    });
    if deadline.await.is_err() {
        warn!(remaining = conns.len(), "grace deadline reached, force-closing connections");
        conns.abort_all();
        while conns.join_next().await.is_some() {}
    }
    info!("rpc server stopped");
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    registry: Arc<MethodRegistry>,
    max_frame_len: usize,
    tls: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: StatsMap,
) {
    debug!(%peer, "connection accepted");
    let result = match tls {
        Some(acceptor) => match acceptor.accept(tcp).await {
            Ok(stream) => {
                connection_loop(stream, &registry, max_frame_len, &mut shutdown_rx, &stats).await
            }
            Err(e) => {
                warn!(%peer, error = %e, "tls handshake failed");
                return;
            }
        },
        None => connection_loop(tcp, &registry, max_frame_len, &mut shutdown_rx, &stats).await,
    };

    match result {
        Ok(()) => debug!(%peer, "connection closed"),
        Err(e) => warn!(%peer, error = %e, "connection terminated"),
    }
}

async fn connection_loop<S>(
    mut stream: S,
    registry: &MethodRegistry,
    max_frame_len: usize,
    shutdown_rx: &mut watch::Receiver<bool>,
    stats: &StatsMap,
) -> Result<(), MeshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        // Shutdown only interrupts the wait for the *next* request; a
        // request already being dispatched runs to completion below.
        let frame = tokio::select! {
            frame = framing::read_frame(&mut stream, max_frame_len) => frame?,
            _ = shutdown_rx.changed() => return Ok(()),
        };
        let Some(frame) = frame else { return Ok(()) };

        let response = match codec::decode_request(&frame) {
            Ok(DecodedRequest::Ok(request)) => dispatch(registry, stats, request).await,
            Ok(DecodedRequest::Invalid { id, error }) => RpcResponse::failure(id, error),
            // No usable correlation id: nothing to report on, close.
            Err(e) => return Err(e),
        };

        let bytes = serde_json::to_vec(&response)?;
        framing::write_frame(&mut stream, &bytes).await?;
    }
}

async fn dispatch(registry: &MethodRegistry, stats: &StatsMap, request: RpcRequest) -> RpcResponse {
    let started = Instant::now();
    let outcome = match registry.get(&request.method) {
        Some(handler) => handler.handle(request.params).await,
        None => Err(RpcError::method_not_found(&request.method)),
    };

    {
        let mut stats = stats.write();
        let entry = stats.entry(request.method.clone()).or_default();
        entry.calls += 1;
        entry.total_micros += started.elapsed().as_micros() as u64;
        if outcome.is_err() {
            entry.failures += 1;
        }
    }

    match outcome {
        Ok(result) => RpcResponse::success(request.id, result),
        Err(error) => {
            debug!(method = %request.method, code = error.code, "handler returned error");
            RpcResponse::failure(request.id, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_fn_dispatches_through_trait_object() {
        let mut registry = MethodRegistry::new();
        registry.register_fn("double", |params: Value| async move {
            let n = params.as_i64().ok_or_else(|| RpcError::invalid_params("want int"))?;
            Ok(json!(n * 2))
        });

        let handler = registry.get("double").expect("registered");
        assert_eq!(handler.handle(json!(21)).await.unwrap(), json!(42));
        assert!(registry.get("absent").is_none());
    }

    #[tokio::test]
    async fn dispatch_records_stats_and_maps_unknown_method() {
        let registry = MethodRegistry::new();
        let stats: StatsMap = Arc::new(RwLock::new(HashMap::new()));
        let request = RpcRequest {
            id: "r1".into(),
            method: "nope".into(),
            params: Value::Null,
        };

        let response = dispatch(&registry, &stats, request).await;
        let error = response.error.expect("error response");
        assert_eq!(error.code, codec::METHOD_NOT_FOUND);
        assert_eq!(response.id, "r1");

        let snapshot = stats.read();
        let entry = snapshot.get("nope").expect("stats recorded");
        assert_eq!(entry.calls, 1);
        assert_eq!(entry.failures, 1);
    }
}

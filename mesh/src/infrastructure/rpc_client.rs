// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Framed RPC client with pooling, timeouts, and connect retry.
//!
//! Delivery is at-most-once: a call that times out discards its
//! pending correlation and drops the connection, but does not cancel
//! the handler on the server; the response, if any, is simply never
//! read. Callers retrying must use idempotent handlers or accept the
//! duplicate side effect. A request that was fully written is never
//! re-sent by the client itself, even when the connection came from
//! the pool and turns out to be stale.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::codec::{self, RpcRequest};
use super::framing::{self, DEFAULT_MAX_FRAME_LEN};
use crate::domain::error::MeshError;

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BoxTransport = Box<dyn Transport>;

const POOL_CAP_PER_ADDR: usize = 8;

/// Bounded exponential backoff for connection establishment.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// RPC client. Cheap to share behind an `Arc`; the pool is internal.
pub struct RpcClient {
    pool: Mutex<HashMap<String, Vec<BoxTransport>>>,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    retry: RetryPolicy,
    max_frame_len: usize,
    default_timeout: Duration,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            tls: None,
            retry: RetryPolicy::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            default_timeout: Duration::from_secs(10),
        }
    }

    /// Perform a TLS handshake (verifying `name`) before framing on
    /// every new connection.
    pub fn with_tls(mut self, connector: TlsConnector, name: ServerName<'static>) -> Self {
        self.tls = Some((connector, name));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Call `method` on the agent at `addr` with the default timeout.
    pub async fn call(&self, addr: &str, method: &str, params: Value) -> Result<Value, MeshError> {
        self.call_with_timeout(addr, method, params, self.default_timeout)
            .await
    }

    /// Call with an explicit deadline. On timeout the pending
    /// correlation is discarded and [`MeshError::Timeout`] returned.
    pub async fn call_with_timeout(
        &self,
        addr: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, MeshError> {
        let request = RpcRequest::new(method, params);
        let payload = serde_json::to_vec(&request)?;

        // A pooled connection may have been closed by the server since
        // checkin; fall back to a fresh connection once before failing.
        // The fallback only fires when the write never completed: once
        // the request is fully on the wire the server may already be
        // executing it, and re-sending would break at-most-once.
        let mut pooled = self.checkout(addr);
        let mut from_pool = pooled.is_some();
        loop {
            let mut stream = match pooled.take() {
                Some(stream) => stream,
                None => self.connect(addr).await?,
            };

            let mut wrote = false;
            let exchange = async {
                framing::write_frame(&mut stream, &payload).await?;
                wrote = true;
                framing::read_frame(&mut stream, self.max_frame_len).await
            };
            let outcome = tokio::time::timeout(timeout, exchange).await;

            match outcome {
                Err(_) => {
                    debug!(%addr, method, "rpc call timed out");
                    return Err(MeshError::Timeout {
                        method: method.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Ok(Ok(Some(bytes))) => {
                    let response = codec::decode_response(&bytes)?;
                    if response.id != request.id {
                        return Err(MeshError::Protocol(format!(
                            "response id {} does not match request id {}",
                            response.id, request.id
                        )));
                    }
                    self.checkin(addr, stream);
                    return response.into_result().map_err(MeshError::Remote);
                }
                Ok(Ok(None)) if from_pool && !wrote => {
                    from_pool = false;
                    continue;
                }
                Ok(Ok(None)) => {
                    return Err(MeshError::Connection {
                        addr: addr.to_string(),
                        reason: "connection closed before response".into(),
                    })
                }
                Ok(Err(MeshError::Io(_))) if from_pool && !wrote => {
                    from_pool = false;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Open a connection, retrying transient failures with exponential
    /// backoff and jitter. A TLS handshake failure is not retried: a
    /// plaintext/TLS mismatch must surface, never silently degrade.
    async fn connect(&self, addr: &str) -> Result<BoxTransport, MeshError> {
        let mut backoff = self.retry.base_backoff;
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.retry.attempts.max(1) {
            match TcpStream::connect(addr).await {
                Ok(tcp) => {
                    return match &self.tls {
                        Some((connector, name)) => {
                            let stream = connector.connect(name.clone(), tcp).await.map_err(
                                |e| MeshError::Connection {
                                    addr: addr.to_string(),
                                    reason: format!("tls handshake failed: {e}"),
                                },
                            )?;
                            Ok(Box::new(stream) as BoxTransport)
                        }
                        None => Ok(Box::new(tcp) as BoxTransport),
                    };
                }
                Err(e) => {
                    warn!(%addr, attempt, error = %e, "connect failed");
                    last_error = e.to_string();
                    if attempt < self.retry.attempts {
                        let jitter_cap = (backoff.as_millis() as u64 / 2).max(1);
                        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
                        tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(MeshError::Connection {
            addr: addr.to_string(),
            reason: last_error,
        })
    }

    fn checkout(&self, addr: &str) -> Option<BoxTransport> {
        self.pool.lock().get_mut(addr).and_then(Vec::pop)
    }

    fn checkin(&self, addr: &str, stream: BoxTransport) {
        let mut pool = self.pool.lock();
        let idle = pool.entry(addr.to_string()).or_default();
        if idle.len() < POOL_CAP_PER_ADDR {
            idle.push(stream);
        }
    }
}

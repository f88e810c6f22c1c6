// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Request/response envelope codec.
//!
//! Payloads are JSON-RPC shaped: `{id, method, params}` going out,
//! `{id, result}` or `{id, error: {code, message}}` coming back. The
//! error codes reuse the JSON-RPC numbering so they stay recognizable
//! on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::MeshError;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// One outbound call. Created by the client, consumed exactly once by
/// the matching server; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error half of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, detail)
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, detail)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Response envelope: exactly one of `result` or `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Outcome of decoding an inbound request frame.
///
/// `Invalid` carries the envelope's own `id` so the fault can be
/// reported back on the same correlation; anything without a usable
/// `id` is connection-fatal and comes back as `Err`.
#[derive(Debug)]
pub enum DecodedRequest {
    Ok(RpcRequest),
    Invalid { id: String, error: RpcError },
}

pub fn decode_request(buf: &[u8]) -> Result<DecodedRequest, MeshError> {
    let raw: Value = serde_json::from_slice(buf)
        .map_err(|e| MeshError::Protocol(format!("unparseable request envelope: {e}")))?;

    let obj = raw
        .as_object()
        .ok_or_else(|| MeshError::Protocol("request envelope is not an object".into()))?;

    let id = match obj.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(MeshError::Protocol("request envelope missing id".into())),
    };

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => {
            return Ok(DecodedRequest::Invalid {
                id,
                error: RpcError::invalid_request("request envelope missing method"),
            })
        }
    };

    let params = obj.get("params").cloned().unwrap_or(Value::Null);
    Ok(DecodedRequest::Ok(RpcRequest { id, method, params }))
}

pub fn decode_response(buf: &[u8]) -> Result<RpcResponse, MeshError> {
    serde_json::from_slice(buf)
        .map_err(|e| MeshError::Protocol(format!("unparseable response envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip_preserves_fields() {
        let req = RpcRequest::new("mesh.echo", json!({"x": 1}));
        let bytes = serde_json::to_vec(&req).unwrap();
        match decode_request(&bytes).unwrap() {
            DecodedRequest::Ok(decoded) => {
                assert_eq!(decoded.id, req.id);
                assert_eq!(decoded.method, "mesh.echo");
                assert_eq!(decoded.params, json!({"x": 1}));
            }
            other => panic!("unexpected decode outcome: {other:?}"),
        }
    }

    #[test]
    fn missing_method_is_reportable_on_same_id() {
        let bytes = serde_json::to_vec(&json!({"id": "abc", "params": {}})).unwrap();
        match decode_request(&bytes).unwrap() {
            DecodedRequest::Invalid { id, error } => {
                assert_eq!(id, "abc");
                assert_eq!(error.code, INVALID_REQUEST);
            }
            other => panic!("unexpected decode outcome: {other:?}"),
        }
    }

    #[test]
    fn missing_id_is_connection_fatal() {
        let bytes = serde_json::to_vec(&json!({"method": "mesh.ping"})).unwrap();
        let err = decode_request(&bytes).unwrap_err();
        assert!(matches!(err, MeshError::Protocol(_)));
    }

    #[test]
    fn non_json_is_connection_fatal() {
        let err = decode_request(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, MeshError::Protocol(_)));
    }

    #[test]
    fn response_with_error_converts_to_err() {
        let resp = RpcResponse::failure("x", RpcError::internal("boom"));
        let bytes = serde_json::to_vec(&resp).unwrap();
        let decoded = decode_response(&bytes).unwrap();
        let err = decoded.into_result().unwrap_err();
        assert_eq!(err.code, INTERNAL_ERROR);
    }

    #[test]
    fn response_without_result_defaults_to_null() {
        let decoded = decode_response(br#"{"id":"x"}"#).unwrap();
        assert_eq!(decoded.into_result().unwrap(), Value::Null);
    }
}

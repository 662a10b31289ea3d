//! JSON-RPC 2.0 frames spoken on robot service channels.
//!
//! The gateway is always the calling side: it sends [`JsonRpcRequest`]s with
//! numeric ids and matches [`JsonRpcResponse`]s back to the waiting call.

use crate::error::RpcError;
use serde::{Deserialize, Serialize};

const VERSION: &str = "2.0";

/// A call to a robot service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn call(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A robot's answer to a call.
///
/// `id` is absent on frames the robot pushes without being asked; those are
/// not matched to any call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful reply to call `id`.
    pub fn reply(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Failed reply to call `id`.
    pub fn fault(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Outcome of the call. A reply with neither result nor error is `null`.
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            }),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}

/// Error object of a failed reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Standard error codes.
pub mod codes {
    pub const METHOD_NOT_FOUND: i32 = -32601;
}

/// Method names of the direct-control service.
pub mod methods {
    pub const START_DIRECT_CONTROL: &str = "startDirectControl";
    pub const STOP_DIRECT_CONTROL: &str = "stopDirectControl";
    pub const SET_CONTROL_MODE: &str = "setControlMode";
}

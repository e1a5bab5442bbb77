use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tally_core::SessionError;

/// JSON-RPC request, over WebSocket or `POST /rpc`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// Wire format: `{ id, success, result?, error?: { code, message, data? } }`
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Error object. `code` is a stable machine-readable kind.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const PARSE_ERROR: &str = "PARSE_ERROR";
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Malformed params are caller input errors, same kind as domain validation.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
                data,
            }),
        }
    }

    pub fn from_session_error(id: Option<Value>, err: &SessionError) -> Self {
        Self::error(
            id,
            err.kind(),
            err.to_string(),
            Some(serde_json::json!({ "retryable": err.is_retryable() })),
        )
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"), None)
    }

    pub fn invalid_params(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(
            id,
            VALIDATION_ERROR,
            msg,
            Some(serde_json::json!({ "retryable": false })),
        )
    }

    pub fn internal_error(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, msg, None)
    }

    pub fn parse_error() -> Self {
        Self::error(None, PARSE_ERROR, "Parse error", None)
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Deserialize the params object into a typed struct.
pub fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, String> {
    T::deserialize(params).map_err(|e| format!("Invalid params: {e}"))
}

/// Serialize a handler result, mapping failures to `INTERNAL_ERROR`.
pub fn to_result<T: Serialize>(id: Option<Value>, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => RpcResponse::success(id, v),
        Err(e) => RpcResponse::internal_error(id, format!("serialize result: {e}")),
    }
}

//! wsrpc
//!
//! Bidirectional JSON-RPC 2.0 over WebSocket. Provides a reconnecting
//! client and a multi-client server sharing one protocol layer.

use std::time::Duration;

pub mod cli;
pub mod config;
pub mod jsonrpc;
pub mod logging;
pub mod rpc;
pub mod websocket;

pub use jsonrpc::protocol::{JsonRpcErrorObject, RequestId};

/// Application-wide error types with context preserved at construction
#[derive(Debug, thiserror::Error)]
pub enum WsRpcError {
    #[error("Connect error: {message}")]
    Connect { message: String, url: Option<String> },

    #[error("Send error: {message}")]
    Send {
        message: String,
        url: Option<String>,
        payload: Option<serde_json::Value>,
    },

    #[error("Connection closed while the request was outstanding")]
    Disconnected {
        url: Option<String>,
        payload: Option<serde_json::Value>,
    },

    #[error("Request timed out after {timeout:?}")]
    RequestTimeout {
        timeout: Duration,
        payload: Option<serde_json::Value>,
    },

    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        payload: Option<serde_json::Value>,
    },

    #[error("Subscribe to '{event}' was refused by the server")]
    Subscribe { event: String },

    #[error("Method {name} is already registered")]
    MethodExists { name: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl WsRpcError {
    /// Create a connect error, optionally tagged with the target URL
    pub fn connect(message: impl Into<String>, url: Option<String>) -> Self {
        Self::Connect {
            message: message.into(),
            url,
        }
    }

    /// Create a send error carrying the payload that failed to go out
    pub fn send(
        message: impl Into<String>,
        url: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self::Send {
            message: message.into(),
            url,
            payload,
        }
    }

    pub fn disconnected(url: Option<String>, payload: Option<serde_json::Value>) -> Self {
        Self::Disconnected { url, payload }
    }

    pub fn request_timeout(timeout: Duration, payload: Option<serde_json::Value>) -> Self {
        Self::RequestTimeout { timeout, payload }
    }

    pub fn rpc(code: i32, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn protocol(message: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self::Protocol {
            message: message.into(),
            payload,
        }
    }

    /// Wire-level error code for JSON-RPC responses
    pub fn error_code(&self) -> i32 {
        match self {
            WsRpcError::Rpc { code, .. } => *code,
            WsRpcError::RequestTimeout { .. } => jsonrpc::protocol::error_codes::OPERATION_TIMEOUT,
            WsRpcError::Protocol { .. } => jsonrpc::protocol::error_codes::INVALID_REQUEST,
            WsRpcError::Serialization { .. } => jsonrpc::protocol::error_codes::PARSE_ERROR,
            WsRpcError::Connect { .. }
            | WsRpcError::Send { .. }
            | WsRpcError::Disconnected { .. }
            | WsRpcError::Subscribe { .. }
            | WsRpcError::MethodExists { .. }
            | WsRpcError::Io { .. } => jsonrpc::protocol::error_codes::INTERNAL_ERROR,
        }
    }

    /// Convert into the wire error object used in error responses
    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        JsonRpcErrorObject {
            code: self.error_code(),
            message: self.to_string(),
            data: match self {
                WsRpcError::Rpc { data, .. } => data.clone(),
                _ => None,
            },
        }
    }
}

impl From<JsonRpcErrorObject> for WsRpcError {
    fn from(error: JsonRpcErrorObject) -> Self {
        Self::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Convenience type alias for Results
pub type WsRpcResult<T> = Result<T, WsRpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_code_passthrough() {
        let err = WsRpcError::rpc(-32601, "Method not found", None);
        assert_eq!(err.error_code(), -32601);
    }

    #[test]
    fn test_timeout_maps_to_operation_timeout() {
        let err = WsRpcError::request_timeout(Duration::from_secs(5), None);
        assert_eq!(err.error_code(), -32000);
    }

    #[test]
    fn test_error_object_round_trip() {
        let obj = JsonRpcErrorObject {
            code: -32050,
            message: "custom".to_string(),
            data: Some(serde_json::json!({"detail": 1})),
        };

        let err = WsRpcError::from(obj.clone());
        let back = err.to_error_object();

        assert_eq!(back.code, obj.code);
        assert_eq!(back.data, obj.data);
    }

    #[test]
    fn test_send_error_carries_payload() {
        let payload = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "x"});
        let err = WsRpcError::send("Send timeout", Some("ws://localhost".into()), Some(payload));

        if let WsRpcError::Send { payload, url, .. } = err {
            assert!(payload.is_some());
            assert_eq!(url.as_deref(), Some("ws://localhost"));
        } else {
            panic!("Expected Send error");
        }
    }
}

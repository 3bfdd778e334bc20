//! Core JSON-RPC 2.0 envelope types
//!
//! Implements the four wire shapes (request, notification, success
//! response, error response) plus the classification rules that tell
//! them apart on the inbound path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard JSON-RPC 2.0 error codes, plus the operation-timeout extension
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const OPERATION_TIMEOUT: i32 = -32000;
    pub const SERVER_ERROR_START: i32 = -32099;
    pub const SERVER_ERROR_END: i32 = -32000;
}

/// Request id: strings and integers are both legal on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl RequestId {
    /// Parse an id out of a raw JSON value; null and other types yield None
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

/// JSON-RPC 2.0 Request (id required and non-null)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 Notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

/// JSON-RPC 2.0 Response
///
/// The id is nullable: protocol-level failures (parse errors, oversized
/// batches) cannot be attributed to a request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: super::JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Validate the request structure
    pub fn validate(&self) -> Result<(), JsonRpcErrorObject> {
        if self.jsonrpc != super::JSONRPC_VERSION {
            return Err(JsonRpcErrorObject::new(
                error_codes::INVALID_REQUEST,
                "Invalid JSON-RPC version",
                None,
            ));
        }

        if self.method.is_empty() {
            return Err(JsonRpcErrorObject::new(
                error_codes::INVALID_REQUEST,
                "Method name cannot be empty",
                None,
            ));
        }

        if self.method.starts_with("rpc.") {
            return Err(JsonRpcErrorObject::new(
                error_codes::INVALID_REQUEST,
                "Method names starting with 'rpc.' are reserved",
                None,
            ));
        }

        Ok(())
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: super::JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Event-delivery envelope: a `subscribe` notification carrying the
    /// event name and its payload, as sent by the server to subscribers.
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::new(
            "subscribe",
            Some(serde_json::json!({ "event": event.into(), "result": data })),
        )
    }
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: super::JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response; id is None for protocol-level failures
    pub fn error(id: Option<RequestId>, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: super::JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn parse_error() -> Self {
        Self::error(
            None,
            JsonRpcErrorObject::new(error_codes::PARSE_ERROR, "Parse error", None),
        )
    }

    pub fn invalid_request(id: Option<RequestId>) -> Self {
        Self::error(
            id,
            JsonRpcErrorObject::new(error_codes::INVALID_REQUEST, "Invalid Request", None),
        )
    }

    pub fn method_not_found(method: &str, id: RequestId) -> Self {
        Self::error(
            Some(id),
            JsonRpcErrorObject::new(
                error_codes::METHOD_NOT_FOUND,
                "Method not found",
                Some(serde_json::json!({ "method": method })),
            ),
        )
    }

    pub fn invalid_params(message: &str, id: RequestId) -> Self {
        Self::error(
            Some(id),
            JsonRpcErrorObject::new(
                error_codes::INVALID_PARAMS,
                format!("Invalid params: {}", message),
                None,
            ),
        )
    }

    pub fn operation_timeout(id: RequestId) -> Self {
        Self::error(
            Some(id),
            JsonRpcErrorObject::new(error_codes::OPERATION_TIMEOUT, "Operation Timeout", None),
        )
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Split into the settled outcome for correlation
    pub fn into_outcome(self) -> (Option<RequestId>, Result<Value, JsonRpcErrorObject>) {
        match self.error {
            Some(error) => (self.id, Err(error)),
            None => (self.id, Ok(self.result.unwrap_or(Value::Null))),
        }
    }
}

/// A classified inbound JSON-RPC envelope
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Classify a decoded JSON value as one of the envelope kinds.
    ///
    /// A message with `method` and a non-null `id` is a request; with
    /// `method` and no id it is a notification; with an `id` key and
    /// either `result` or `error` it is a response. Anything else is not
    /// a JSON-RPC envelope.
    pub fn classify(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(super::JSONRPC_VERSION) {
            return None;
        }

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let params = obj.get("params").cloned();

            return match obj.get("id") {
                Some(id_value) if !id_value.is_null() => {
                    let id = RequestId::from_value(id_value)?;
                    Some(Self::Request(JsonRpcRequest {
                        jsonrpc: super::JSONRPC_VERSION.to_string(),
                        id,
                        method: method.to_string(),
                        params,
                    }))
                }
                _ => Some(Self::Notification(JsonRpcNotification {
                    jsonrpc: super::JSONRPC_VERSION.to_string(),
                    method: method.to_string(),
                    params,
                })),
            };
        }

        if obj.contains_key("id") && (obj.contains_key("result") || obj.contains_key("error")) {
            let id = obj.get("id").and_then(RequestId::from_value);
            let result = obj.get("result").cloned();
            let error = obj
                .get("error")
                .cloned()
                .and_then(|e| serde_json::from_value(e).ok());

            // An "error" key that does not decode as an error object makes
            // the envelope unclassifiable rather than a success response.
            if obj.contains_key("error") && error.is_none() {
                return None;
            }

            return Some(Self::Response(JsonRpcResponse {
                jsonrpc: super::JSONRPC_VERSION.to_string(),
                id,
                result,
                error,
            }));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(42u64, "test", Some(json!({"a": 1})));

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 42);
        assert_eq!(value["method"], "test");
        assert_eq!(value["params"]["a"], 1);
    }

    #[test]
    fn test_notification_has_no_id() {
        let notify = JsonRpcNotification::new("tick", None);
        let value = serde_json::to_value(&notify).unwrap();

        assert!(value.get("id").is_none());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = JsonRpcNotification::event("price", json!(42));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["method"], "subscribe");
        assert_eq!(value["params"]["event"], "price");
        assert_eq!(value["params"]["result"], 42);
    }

    #[test]
    fn test_classify_request() {
        let value = json!({"jsonrpc": "2.0", "id": 1, "method": "add", "params": [1, 2]});

        match JsonRpcMessage::classify(&value) {
            Some(JsonRpcMessage::Request(req)) => {
                assert_eq!(req.id, RequestId::Number(1));
                assert_eq!(req.method, "add");
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_notification() {
        let value = json!({"jsonrpc": "2.0", "method": "tick"});

        assert!(matches!(
            JsonRpcMessage::classify(&value),
            Some(JsonRpcMessage::Notification(_))
        ));
    }

    #[test]
    fn test_null_id_request_is_notification() {
        let value = json!({"jsonrpc": "2.0", "id": null, "method": "tick"});

        assert!(matches!(
            JsonRpcMessage::classify(&value),
            Some(JsonRpcMessage::Notification(_))
        ));
    }

    #[test]
    fn test_classify_responses() {
        let ok = json!({"jsonrpc": "2.0", "id": "abc", "result": true});
        let err = json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}});

        match JsonRpcMessage::classify(&ok) {
            Some(JsonRpcMessage::Response(resp)) => {
                assert_eq!(resp.id, Some(RequestId::String("abc".into())));
                assert!(!resp.is_error());
            }
            other => panic!("Expected response, got {:?}", other),
        }

        match JsonRpcMessage::classify(&err) {
            Some(JsonRpcMessage::Response(resp)) => {
                assert_eq!(resp.id, None);
                assert_eq!(resp.error.unwrap().code, -32700);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_rejects_non_envelopes() {
        assert!(JsonRpcMessage::classify(&json!({"id": 1, "method": "x"})).is_none());
        assert!(JsonRpcMessage::classify(&json!({"jsonrpc": "1.0", "id": 1, "method": "x"})).is_none());
        assert!(JsonRpcMessage::classify(&json!({"jsonrpc": "2.0"})).is_none());
        assert!(JsonRpcMessage::classify(&json!(42)).is_none());
    }

    #[test]
    fn test_request_validation() {
        let mut req = JsonRpcRequest::new(1u64, "test", None);
        assert!(req.validate().is_ok());

        req.jsonrpc = "1.0".to_string();
        assert!(req.validate().is_err());

        req.jsonrpc = "2.0".to_string();
        req.method = "rpc.internal".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_response_outcome() {
        let (id, outcome) = JsonRpcResponse::success(7u64, json!("pong")).into_outcome();
        assert_eq!(id, Some(RequestId::Number(7)));
        assert_eq!(outcome.unwrap(), json!("pong"));

        let (_, outcome) = JsonRpcResponse::method_not_found("nope", 8u64.into()).into_outcome();
        assert_eq!(outcome.unwrap_err().code, -32601);
    }

    #[test]
    fn test_request_id_string_or_number() {
        let s: RequestId = serde_json::from_value(json!("req-1")).unwrap();
        let n: RequestId = serde_json::from_value(json!(5)).unwrap();

        assert_eq!(s, RequestId::String("req-1".into()));
        assert_eq!(n, RequestId::Number(5));
        assert_eq!(serde_json::to_value(&n).unwrap(), json!(5));
    }
}

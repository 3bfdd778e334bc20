//! JSON-RPC 2.0 protocol layer
//!
//! A focused JSON-RPC 2.0 implementation with no external RPC
//! dependencies: envelope types and classification in [`protocol`],
//! method dispatch with timeouts and batching in [`handler`].

pub mod handler;
pub mod protocol;

pub use handler::{HandlerOutcome, MethodHandler, RpcMessageHandler, RpcMessageHandlerOptions};
pub use protocol::{
    JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};

pub const JSONRPC_VERSION: &str = "2.0";

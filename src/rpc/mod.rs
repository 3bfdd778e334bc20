//! JSON-RPC over WebSocket
//!
//! The RPC layer proper: a correlating client with batching and
//! subscriptions on top of the reconnecting transport, and a
//! multi-peer server with method dispatch and event fan-out.

pub mod client;
pub mod server;

pub use client::{
    BatchEntry, RpcClientEvent, RpcClientOptions, RpcWebSocketClient, Subscription,
};
pub use server::{
    RpcContext, RpcServerEvent, RpcServerOptions, RpcWebSocketServer,
};

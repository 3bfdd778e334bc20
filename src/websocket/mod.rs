//! WebSocket transport layer
//!
//! Connection lifecycle machinery shared by the RPC layer: a
//! reconnecting client, a multi-peer server, and the heartbeat monitor
//! both sides use for liveness detection.

pub mod client;
pub mod heartbeat;
pub mod server;

pub use client::{
    ClientEvent, ConnectionState, ReconnectOptions, WebSocketClient, WebSocketClientOptions,
};
pub use heartbeat::{Heartbeat, HeartbeatOptions};
pub use server::{
    PeerInfo, ServerEvent, UpgradeHook, UpgradeRejection, UpgradeRequest, WebSocketServer,
    WebSocketServerOptions,
};

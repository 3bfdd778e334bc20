//! Shared helpers for integration tests: a test server with a few
//! representative methods, client constructors with tight timeouts, and
//! event-wait utilities.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use wsrpc::rpc::{
    RpcClientOptions, RpcServerOptions, RpcWebSocketClient, RpcWebSocketServer,
};
use wsrpc::websocket::{ReconnectOptions, WebSocketClientOptions};
use wsrpc::WsRpcError;

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn default_server_options() -> RpcServerOptions {
    RpcServerOptions {
        events: vec!["price".to_string(), "trades".to_string()],
        event_patterns: vec!["market.*".to_string()],
        ..Default::default()
    }
}

/// Start a server on an ephemeral port with the standard test methods
pub async fn start_test_server() -> (RpcWebSocketServer, String) {
    start_test_server_with(default_server_options()).await
}

pub async fn start_test_server_with(options: RpcServerOptions) -> (RpcWebSocketServer, String) {
    wsrpc::logging::init_test_logging();

    let server = RpcWebSocketServer::new("127.0.0.1", 0, options).await;
    register_test_methods(&server).await;

    server.start().await.expect("server should start");
    let addr = server.local_addr().expect("server should be bound");
    (server, format!("ws://{}/", addr))
}

async fn register_test_methods(server: &RpcWebSocketServer) {
    server
        .add_method(
            "echo",
            |params, _| async move { Ok(params.unwrap_or(Value::Null)) },
            false,
        )
        .await
        .unwrap();

    // Sleeps for `ms`, then returns `value`; lets tests scramble
    // completion order and exercise timeouts.
    server
        .add_method(
            "delay_echo",
            |params, _| async move {
                let ms = params
                    .as_ref()
                    .and_then(|p| p.get("ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(params
                    .and_then(|p| p.get("value").cloned())
                    .unwrap_or(Value::Null))
            },
            false,
        )
        .await
        .unwrap();

    server
        .add_method(
            "fail",
            |_, _| async { Err(WsRpcError::rpc(-32050, "deliberate failure", Some(json!("details")))) },
            false,
        )
        .await
        .unwrap();

    server
        .add_method(
            "whoami",
            |_, ctx| async move { Ok(json!({ "peer": ctx.peer, "metadata": ctx.metadata })) },
            false,
        )
        .await
        .unwrap();
}

pub fn client_options(request_timeout: Duration, reconnect: ReconnectOptions) -> RpcClientOptions {
    RpcClientOptions {
        socket: WebSocketClientOptions {
            connect_timeout: Duration::from_secs(5),
            reconnect,
            ..Default::default()
        },
        request_timeout,
        auto_resubscribe: true,
    }
}

/// Client with no reconnection and a 5 s request timeout
pub fn test_client(url: &str) -> RpcWebSocketClient {
    RpcWebSocketClient::new(
        url,
        client_options(
            Duration::from_secs(5),
            ReconnectOptions {
                enabled: false,
                ..Default::default()
            },
        ),
    )
}

/// Await one broadcast event, failing the test after 5 s
pub async fn recv_event<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Poll until the condition holds or the deadline passes
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Plain tungstenite connection for protocol-level tests
pub async fn raw_connect(url: &str) -> RawSocket {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("raw connect should succeed");
    socket
}

//! Pre-upgrade gating: metadata attachment and denial before the
//! socket is accepted.

mod common;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use common::*;
use wsrpc::websocket::{UpgradeHook, UpgradeRejection, UpgradeRequest};
use wsrpc::WsRpcError;

struct ApiKeyHook;

#[async_trait]
impl UpgradeHook for ApiKeyHook {
    async fn before_upgrade(&self, request: &UpgradeRequest) -> Result<Value, UpgradeRejection> {
        match request
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
        {
            Some("secret") => Ok(json!({"user": "alice"})),
            _ => Err(UpgradeRejection::forbidden("missing api key")),
        }
    }
}

#[tokio::test]
async fn hook_metadata_is_visible_to_handlers() {
    let (server, url) = start_test_server().await;
    server.set_upgrade_hook(std::sync::Arc::new(ApiKeyHook));

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-api-key", HeaderValue::from_static("secret"));

    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    socket
        .send(Message::text(
            json!({"jsonrpc": "2.0", "id": 1, "method": "whoami"}).to_string(),
        ))
        .await
        .unwrap();

    let reply = loop {
        match socket.next().await.expect("reply expected").unwrap() {
            Message::Text(text) => break text.to_string(),
            _ => continue,
        }
    };

    let value: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["result"]["metadata"]["user"], "alice");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn hook_denial_refuses_the_upgrade() {
    let (server, url) = start_test_server().await;
    server.set_upgrade_hook(std::sync::Arc::new(ApiKeyHook));

    // No api key: the handshake itself must fail.
    let denied = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(denied.is_err());

    // The typed client surfaces this as a connect error.
    let client = test_client(&url);
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, WsRpcError::Connect { .. }));

    assert_eq!(server.peer_count().await, 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn peers_get_distinct_monotonic_ids() {
    let (server, url) = start_test_server().await;
    let mut events = server.events();

    let first = test_client(&url);
    let second = test_client(&url);
    first.connect().await.unwrap();
    second.connect().await.unwrap();

    let mut ids = Vec::new();
    while ids.len() < 2 {
        if let wsrpc::rpc::RpcServerEvent::Connection(info) = recv_event(&mut events).await {
            ids.push(info.id);
        }
    }

    assert!(ids[1] > ids[0]);
    assert_eq!(server.peer_count().await, 2);

    server.stop().await.unwrap();
}

//! Single-call correlation: success, error, timeout, and the
//! classification of stray frames.

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use common::*;
use wsrpc::rpc::RpcClientEvent;
use wsrpc::websocket::ReconnectOptions;
use wsrpc::WsRpcError;

#[tokio::test]
async fn call_resolves_with_result() {
    let (server, url) = start_test_server().await;
    let client = test_client(&url);
    client.connect().await.unwrap();

    let result = client.call("echo", Some(json!({"a": 1}))).await.unwrap();
    assert_eq!(result, json!({"a": 1}));
    assert_eq!(client.pending_count().await, 0);

    client.disconnect(None, None).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn ping_builtin_answers_pong() {
    let (server, url) = start_test_server().await;
    let client = test_client(&url);
    client.connect().await.unwrap();

    assert_eq!(client.call("ping", None).await.unwrap(), json!("pong"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn error_response_carries_code_message_data() {
    let (server, url) = start_test_server().await;
    let client = test_client(&url);
    client.connect().await.unwrap();

    let err = client.call("fail", None).await.unwrap_err();
    match err {
        WsRpcError::Rpc {
            code,
            message,
            data,
        } => {
            assert_eq!(code, -32050);
            assert!(message.contains("deliberate failure"));
            assert_eq!(data, Some(json!("details")));
        }
        other => panic!("Expected Rpc error, got {:?}", other),
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_method_maps_to_32601() {
    let (server, url) = start_test_server().await;
    let client = test_client(&url);
    client.connect().await.unwrap();

    let err = client.call("no_such_method", None).await.unwrap_err();
    assert!(matches!(err, WsRpcError::Rpc { code: -32601, .. }));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn call_timeout_removes_pending_entry() {
    let (server, url) = start_test_server().await;
    let client = wsrpc::rpc::RpcWebSocketClient::new(
        &url,
        client_options(
            Duration::from_millis(200),
            ReconnectOptions {
                enabled: false,
                ..Default::default()
            },
        ),
    );
    client.connect().await.unwrap();

    let err = client
        .call("delay_echo", Some(json!({"ms": 5_000, "value": 1})))
        .await
        .unwrap_err();

    assert!(matches!(err, WsRpcError::RequestTimeout { .. }));
    assert_eq!(client.pending_count().await, 0);

    // The late response must not disturb anything.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.call("echo", Some(json!("ok"))).await.unwrap(), json!("ok"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_side_operation_timeout_maps_to_32000() {
    let mut options = default_server_options();
    options.handler.operation_timeout = Duration::from_millis(100);
    let (server, url) = start_test_server_with(options).await;

    let client = test_client(&url);
    client.connect().await.unwrap();

    let err = client
        .call("delay_echo", Some(json!({"ms": 5_000})))
        .await
        .unwrap_err();
    assert!(matches!(err, WsRpcError::Rpc { code: -32000, .. }));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn notify_reaches_server_without_response() {
    let (server, url) = start_test_server().await;
    let mut events = server.events();

    let client = test_client(&url);
    client.connect().await.unwrap();

    client
        .notify("status_update", Some(json!({"state": "ready"})))
        .await
        .unwrap();

    loop {
        if let wsrpc::rpc::RpcServerEvent::Notification {
            method, params, ..
        } = recv_event(&mut events).await
        {
            assert_eq!(method, "status_update");
            assert_eq!(params, Some(json!({"state": "ready"})));
            break;
        }
    }

    assert_eq!(client.pending_count().await, 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unmatched_response_is_dropped() {
    let (server, url) = start_test_server().await;
    let mut server_events = server.events();

    let client = test_client(&url);
    let mut client_events = client.events();
    client.connect().await.unwrap();

    let peer = loop {
        if let wsrpc::rpc::RpcServerEvent::Connection(info) = recv_event(&mut server_events).await
        {
            break info.id;
        }
    };

    // A response nobody asked for.
    server
        .send_raw(
            peer,
            json!({"jsonrpc": "2.0", "id": 999, "result": "stray"}).to_string(),
        )
        .await
        .unwrap();

    loop {
        if let RpcClientEvent::UnhandledRpcMessage(value) = recv_event(&mut client_events).await {
            assert_eq!(value["id"], 999);
            break;
        }
    }

    // The client still works normally afterwards.
    assert_eq!(client.call("ping", None).await.unwrap(), json!("pong"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn null_id_error_response_is_connection_level() {
    let (server, url) = start_test_server().await;
    let mut server_events = server.events();

    let client = test_client(&url);
    let mut client_events = client.events();
    client.connect().await.unwrap();

    let peer = loop {
        if let wsrpc::rpc::RpcServerEvent::Connection(info) = recv_event(&mut server_events).await
        {
            break info.id;
        }
    };

    server
        .send_raw(
            peer,
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32700, "message": "Parse error"}
            })
            .to_string(),
        )
        .await
        .unwrap();

    loop {
        if let RpcClientEvent::RpcError(error) = recv_event(&mut client_events).await {
            assert_eq!(error.code, -32700);
            break;
        }
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_frame_gets_parse_error_with_null_id() {
    let (server, url) = start_test_server().await;
    let mut socket = raw_connect(&url).await;

    socket.send(Message::text("{definitely not json")).await.unwrap();

    let reply = loop {
        match socket.next().await.expect("reply expected").unwrap() {
            Message::Text(text) => break text.to_string(),
            _ => continue,
        }
    };

    let value: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["id"], Value::Null);
    assert_eq!(value["error"]["code"], -32700);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn response_envelope_sent_to_server_is_invalid_request() {
    let (server, url) = start_test_server().await;
    let mut socket = raw_connect(&url).await;

    socket
        .send(Message::text(
            json!({"jsonrpc": "2.0", "id": 5, "result": true}).to_string(),
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
    assert_eq!(value["error"]["code"], -32600);
    assert_eq!(value["id"], 5);

    server.stop().await.unwrap();
}

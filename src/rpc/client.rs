//! Correlating JSON-RPC client
//!
//! Built on the reconnecting transport client. Requests are keyed by id
//! in a pending table and settled exactly once: by the matching
//! response, by the request timeout, or by disconnection. Subscriptions
//! are recorded and replayed after a reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};

use crate::jsonrpc::protocol::{
    JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId,
};
use crate::websocket::{ClientEvent, ConnectionState, WebSocketClient, WebSocketClientOptions};
use crate::{WsRpcError, WsRpcResult};

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub socket: WebSocketClientOptions,
    /// Ceiling on each call (and each batch as a whole)
    pub request_timeout: Duration,
    /// Replay recorded subscriptions after a reconnect
    pub auto_resubscribe: bool,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            socket: WebSocketClientOptions::default(),
            request_timeout: Duration::from_secs(10),
            auto_resubscribe: true,
        }
    }
}

/// RPC-level events observable through [`RpcWebSocketClient::events`]
#[derive(Debug, Clone)]
pub enum RpcClientEvent {
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Error response with a null id: a connection-level failure not
    /// attributable to any call
    RpcError(JsonRpcErrorObject),
    UnhandledRpcMessage(Value),
    UnhandledMessage(String),
    ResubscribeFailed {
        event: String,
        message: String,
    },
}

/// One entry of a batch call
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<RequestId>,
}

impl BatchEntry {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id: None,
        }
    }
}

struct PendingRequest {
    payload: Value,
    tx: oneshot::Sender<WsRpcResult<Value>>,
}

struct ClientInner {
    socket: WebSocketClient,
    options: RpcClientOptions,
    requests: Mutex<HashMap<RequestId, PendingRequest>>,
    subscriptions: Mutex<HashMap<String, Option<Value>>>,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<RpcClientEvent>,
}

#[derive(Clone)]
pub struct RpcWebSocketClient {
    inner: Arc<ClientInner>,
}

/// Handle returned by a successful subscribe
pub struct Subscription {
    inner: Arc<ClientInner>,
    event: String,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .finish()
    }
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub async fn unsubscribe(self) -> WsRpcResult<()> {
        unsubscribe_inner(&self.inner, &self.event).await
    }
}

impl RpcWebSocketClient {
    pub fn new(url: impl Into<String>, options: RpcClientOptions) -> Self {
        let socket = WebSocketClient::new(url, options.socket.clone());
        let (events_tx, _) = broadcast::channel(64);

        let inner = Arc::new(ClientInner {
            socket,
            options,
            requests: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events_tx,
        });

        spawn_router(&inner);
        Self { inner }
    }

    pub fn url(&self) -> &str {
        self.inner.socket.url()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.socket.state()
    }

    pub fn state_watch(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.inner.socket.state_watch()
    }

    /// Subscribe to RPC-level events
    pub fn events(&self) -> broadcast::Receiver<RpcClientEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Transport lifecycle events (open, close, reconnecting, ...)
    pub fn socket_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.socket.events()
    }

    pub async fn connect(&self) -> WsRpcResult<()> {
        self.inner.socket.connect().await
    }

    /// Close the connection, rejecting every still-pending request
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<String>) -> WsRpcResult<()> {
        self.inner.socket.disconnect(code, reason).await?;
        reject_all_pending(&self.inner).await;
        Ok(())
    }

    /// Fire-and-forget notification, no correlation
    pub async fn notify(&self, method: impl Into<String>, params: Option<Value>) -> WsRpcResult<()> {
        let envelope = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_value(&envelope)?;

        self.inner
            .socket
            .send(payload.to_string())
            .await
            .map_err(|error| wrap_send_error(error, &self.inner, payload))
    }

    /// Issue a request and await its settlement
    pub async fn call(&self, method: impl Into<String>, params: Option<Value>) -> WsRpcResult<Value> {
        self.call_with_id(method, params, None).await
    }

    /// Like [`call`](Self::call) but with a caller-supplied request id
    pub async fn call_with_id(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        id: Option<RequestId>,
    ) -> WsRpcResult<Value> {
        let inner = &self.inner;
        let (id, payload, rx) = register_request(inner, method.into(), params, id).await?;

        if let Err(error) = inner.socket.send(payload.to_string()).await {
            inner.requests.lock().await.remove(&id);
            return Err(wrap_send_error(error, inner, payload));
        }

        await_settlement(inner, id, payload, rx).await
    }

    /// Issue every entry as a single array write. Resolves with results
    /// in input order once all entries settle; the first rejection wins.
    /// One timeout covers the whole batch.
    pub async fn batch_call(&self, entries: Vec<BatchEntry>) -> WsRpcResult<Vec<Value>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let inner = &self.inner;
        let mut ids = Vec::with_capacity(entries.len());
        let mut envelopes = Vec::with_capacity(entries.len());
        let mut receivers = Vec::with_capacity(entries.len());

        for entry in entries {
            match register_request(inner, entry.method, entry.params, entry.id).await {
                Ok((id, envelope, rx)) => {
                    ids.push(id);
                    envelopes.push(envelope);
                    receivers.push(rx);
                }
                Err(error) => {
                    remove_pending(inner, &ids).await;
                    return Err(error);
                }
            }
        }

        let payload = Value::Array(envelopes);
        if let Err(error) = inner.socket.send(payload.to_string()).await {
            remove_pending(inner, &ids).await;
            return Err(wrap_send_error(error, inner, payload));
        }

        let url = inner.socket.url().to_string();
        let all = futures::future::try_join_all(receivers.into_iter().map(|rx| {
            let url = url.clone();
            async move {
                rx.await
                    .map_err(|_| WsRpcError::disconnected(Some(url), None))?
            }
        }));

        match tokio::time::timeout(inner.options.request_timeout, all).await {
            Ok(result) => result,
            Err(_) => {
                remove_pending(inner, &ids).await;
                Err(WsRpcError::request_timeout(
                    inner.options.request_timeout,
                    Some(payload),
                ))
            }
        }
    }

    /// Subscribe to a named server-side event stream. A truthy result
    /// records the subscription and returns an unsubscribe handle.
    pub async fn subscribe(&self, event: &str, params: Option<Value>) -> WsRpcResult<Subscription> {
        let result = self
            .call("subscribe", Some(subscribe_params(event, params.as_ref())))
            .await?;

        if !is_truthy(&result) {
            return Err(WsRpcError::Subscribe {
                event: event.to_string(),
            });
        }

        self.inner
            .subscriptions
            .lock()
            .await
            .insert(event.to_string(), params);

        Ok(Subscription {
            inner: self.inner.clone(),
            event: event.to_string(),
        })
    }

    pub async fn unsubscribe(&self, event: &str) -> WsRpcResult<()> {
        unsubscribe_inner(&self.inner, event).await
    }

    /// Events currently recorded for resubscription
    pub async fn subscription_events(&self) -> Vec<String> {
        self.inner.subscriptions.lock().await.keys().cloned().collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.requests.lock().await.len()
    }
}

fn subscribe_params(event: &str, params: Option<&Value>) -> Value {
    match params {
        Some(params) => json!([event, params]),
        None => json!([event]),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn wrap_send_error(error: WsRpcError, inner: &Arc<ClientInner>, payload: Value) -> WsRpcError {
    match error {
        WsRpcError::Send { message, .. } => WsRpcError::send(
            message,
            Some(inner.socket.url().to_string()),
            Some(payload),
        ),
        other => other,
    }
}

async fn register_request(
    inner: &Arc<ClientInner>,
    method: String,
    params: Option<Value>,
    id: Option<RequestId>,
) -> WsRpcResult<(RequestId, Value, oneshot::Receiver<WsRpcResult<Value>>)> {
    let id = id.unwrap_or_else(|| RequestId::Number(inner.next_id.fetch_add(1, Ordering::SeqCst) + 1));
    let request = JsonRpcRequest::new(id.clone(), method, params);
    let payload = serde_json::to_value(&request)?;

    let (tx, rx) = oneshot::channel();
    let mut requests = inner.requests.lock().await;
    if requests.contains_key(&id) {
        return Err(WsRpcError::protocol(
            format!("Request id {} is already pending", id),
            Some(payload),
        ));
    }
    requests.insert(
        id.clone(),
        PendingRequest {
            payload: payload.clone(),
            tx,
        },
    );

    Ok((id, payload, rx))
}

async fn await_settlement(
    inner: &Arc<ClientInner>,
    id: RequestId,
    payload: Value,
    rx: oneshot::Receiver<WsRpcResult<Value>>,
) -> WsRpcResult<Value> {
    match tokio::time::timeout(inner.options.request_timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(WsRpcError::disconnected(
            Some(inner.socket.url().to_string()),
            Some(payload),
        )),
        Err(_) => {
            // Late responses find no entry and are dropped.
            inner.requests.lock().await.remove(&id);
            Err(WsRpcError::request_timeout(
                inner.options.request_timeout,
                Some(payload),
            ))
        }
    }
}

async fn remove_pending(inner: &Arc<ClientInner>, ids: &[RequestId]) {
    let mut requests = inner.requests.lock().await;
    for id in ids {
        requests.remove(id);
    }
}

async fn reject_all_pending(inner: &Arc<ClientInner>) {
    let drained: Vec<PendingRequest> = {
        let mut requests = inner.requests.lock().await;
        requests.drain().map(|(_, pending)| pending).collect()
    };

    if drained.is_empty() {
        return;
    }

    debug!(count = drained.len(), "Rejecting pending requests after disconnect");
    let url = inner.socket.url().to_string();
    for pending in drained {
        let _ = pending.tx.send(Err(WsRpcError::disconnected(
            Some(url.clone()),
            Some(pending.payload),
        )));
    }
}

async fn unsubscribe_inner(inner: &Arc<ClientInner>, event: &str) -> WsRpcResult<()> {
    let (id, payload, rx) = register_request(
        inner,
        "unsubscribe".to_string(),
        Some(json!([event])),
        None,
    )
    .await?;

    if let Err(error) = inner.socket.send(payload.to_string()).await {
        inner.requests.lock().await.remove(&id);
        return Err(wrap_send_error(error, inner, payload));
    }

    await_settlement(inner, id, payload, rx).await?;
    inner.subscriptions.lock().await.remove(event);
    Ok(())
}

fn spawn_router(inner: &Arc<ClientInner>) {
    let Some(mut msg_rx) = inner.socket.messages() else {
        return;
    };
    let mut events_rx = inner.socket.events();
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        let mut had_open = false;

        loop {
            tokio::select! {
                msg = msg_rx.recv() => match msg {
                    Some(text) => {
                        let Some(inner) = weak.upgrade() else { break };
                        handle_inbound(&inner, text).await;
                    }
                    None => break,
                },
                event = events_rx.recv() => match event {
                    Ok(ClientEvent::Close { .. }) => {
                        let Some(inner) = weak.upgrade() else { break };
                        reject_all_pending(&inner).await;
                    }
                    Ok(ClientEvent::Open) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if had_open && inner.options.auto_resubscribe {
                            spawn_resubscribe(inner);
                        }
                        had_open = true;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "RPC client lagged behind socket events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Reissue every recorded subscription; failures are reported per entry
/// and never abort the rest.
fn spawn_resubscribe(inner: Arc<ClientInner>) {
    tokio::spawn(async move {
        let snapshot: Vec<(String, Option<Value>)> = inner
            .subscriptions
            .lock()
            .await
            .iter()
            .map(|(event, params)| (event.clone(), params.clone()))
            .collect();

        for (event, params) in snapshot {
            let outcome = resubscribe_one(&inner, &event, params.as_ref()).await;
            if let Err(error) = outcome {
                warn!(%event, %error, "Resubscription failed");
                let _ = inner.events_tx.send(RpcClientEvent::ResubscribeFailed {
                    event,
                    message: error.to_string(),
                });
            }
        }
    });
}

async fn resubscribe_one(
    inner: &Arc<ClientInner>,
    event: &str,
    params: Option<&Value>,
) -> WsRpcResult<()> {
    let (id, payload, rx) = register_request(
        inner,
        "subscribe".to_string(),
        Some(subscribe_params(event, params)),
        None,
    )
    .await?;

    if let Err(error) = inner.socket.send(payload.to_string()).await {
        inner.requests.lock().await.remove(&id);
        return Err(wrap_send_error(error, inner, payload));
    }

    let result = await_settlement(inner, id, payload, rx).await?;
    if is_truthy(&result) {
        Ok(())
    } else {
        Err(WsRpcError::Subscribe {
            event: event.to_string(),
        })
    }
}

async fn handle_inbound(inner: &Arc<ClientInner>, text: String) {
    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => {
            emit(inner, RpcClientEvent::UnhandledMessage(text));
            return;
        }
    };

    match &value {
        Value::Array(items) => {
            let classified: Vec<Option<JsonRpcMessage>> =
                items.iter().map(JsonRpcMessage::classify).collect();

            if classified.iter().any(Option::is_none) {
                emit(inner, RpcClientEvent::UnhandledMessage(text));
                return;
            }

            for message in classified.into_iter().flatten() {
                handle_rpc_message(inner, message).await;
            }
        }
        Value::Object(_) => match JsonRpcMessage::classify(&value) {
            Some(message) => handle_rpc_message(inner, message).await,
            None => emit(inner, RpcClientEvent::UnhandledMessage(text)),
        },
        _ => emit(inner, RpcClientEvent::UnhandledMessage(text)),
    }
}

async fn handle_rpc_message(inner: &Arc<ClientInner>, message: JsonRpcMessage) {
    match message {
        JsonRpcMessage::Notification(notification) => {
            emit(
                inner,
                RpcClientEvent::Notification {
                    method: notification.method,
                    params: notification.params,
                },
            );
        }
        JsonRpcMessage::Response(response) => {
            let raw = serde_json::to_value(&response).unwrap_or(Value::Null);
            let (id, outcome) = response.into_outcome();

            match id {
                Some(id) => {
                    let pending = inner.requests.lock().await.remove(&id);
                    match pending {
                        Some(pending) => {
                            // Exactly one settlement per id; duplicates find
                            // nothing here and are dropped.
                            let settled = outcome.map_err(WsRpcError::from);
                            let _ = pending.tx.send(settled);
                        }
                        None => {
                            debug!(%id, "Dropping response with no pending request");
                            emit(inner, RpcClientEvent::UnhandledRpcMessage(raw));
                        }
                    }
                }
                None => match outcome {
                    Err(error) => emit(inner, RpcClientEvent::RpcError(error)),
                    Ok(_) => emit(inner, RpcClientEvent::UnhandledRpcMessage(raw)),
                },
            }
        }
        JsonRpcMessage::Request(request) => {
            // This client does not serve methods.
            let raw = serde_json::to_value(&request).unwrap_or(Value::Null);
            emit(inner, RpcClientEvent::UnhandledRpcMessage(raw));
        }
    }
}

fn emit(inner: &Arc<ClientInner>, event: RpcClientEvent) {
    let _ = inner.events_tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RpcWebSocketClient {
        RpcWebSocketClient::new("ws://127.0.0.1:1", RpcClientOptions::default())
    }

    #[tokio::test]
    async fn test_call_without_connection_fails_with_send_error() {
        let err = client().call("ping", None).await.unwrap_err();
        assert!(matches!(err, WsRpcError::Send { .. }));
    }

    #[tokio::test]
    async fn test_failed_call_leaves_no_pending_entry() {
        let c = client();
        let _ = c.call("ping", None).await;
        assert_eq!(c.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_ids_increment_per_client() {
        let c = client();
        let _ = c.call("a", None).await;
        let _ = c.call("b", None).await;

        // Two failed calls still consumed two ids.
        assert_eq!(c.inner.next_id.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_resolves_immediately() {
        let results = client().batch_call(Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_truthiness_rules() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("ok")));
        assert!(is_truthy(&json!({})));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
    }

    #[test]
    fn test_subscribe_params_shape() {
        assert_eq!(subscribe_params("price", None), json!(["price"]));
        assert_eq!(
            subscribe_params("price", Some(&json!({"pair": "BTC"}))),
            json!(["price", {"pair": "BTC"}])
        );
    }
}

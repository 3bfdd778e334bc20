//! Multi-peer JSON-RPC server
//!
//! Composes the transport server with the message handler: inbound
//! frames are dispatched per peer without head-of-line blocking, the
//! built-in ping/subscribe/unsubscribe methods are always present, and
//! `emit` fans server-side events out to subscribed peers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::jsonrpc::handler::{HandlerOutcome, RpcMessageHandler, RpcMessageHandlerOptions};
use crate::jsonrpc::protocol::{error_codes, JsonRpcNotification};
use crate::websocket::{
    PeerInfo, ServerEvent, UpgradeHook, WebSocketServer, WebSocketServerOptions,
};
use crate::{WsRpcError, WsRpcResult};

/// Predicate approving ad hoc event names for subscribe
pub type EventPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct RpcServerOptions {
    pub socket: WebSocketServerOptions,
    pub handler: RpcMessageHandlerOptions,
    /// Statically allowed event names
    pub events: Vec<String>,
    /// Wildcard patterns approving event names, e.g. `price.*`
    pub event_patterns: Vec<String>,
}

/// Per-call context handed to method handlers
#[derive(Debug, Clone)]
pub struct RpcContext {
    pub peer: u64,
    pub addr: SocketAddr,
    pub metadata: Value,
}

/// Server-level events observable through [`RpcWebSocketServer::events`]
#[derive(Debug, Clone)]
pub enum RpcServerEvent {
    Connection(PeerInfo),
    Disconnected {
        peer: u64,
    },
    Notification {
        peer: u64,
        method: String,
        params: Option<Value>,
    },
    ClientError {
        peer: Option<u64>,
        message: String,
    },
    UnhandledMessage {
        peer: u64,
        message: String,
    },
}

struct RpcServerInner {
    server: WebSocketServer,
    handler: RpcMessageHandler<RpcContext>,
    subscriptions: Mutex<HashMap<String, HashSet<u64>>>,
    allowed_events: Mutex<HashSet<String>>,
    event_patterns: Vec<WildMatch>,
    event_predicate: StdMutex<Option<EventPredicate>>,
    events_tx: broadcast::Sender<RpcServerEvent>,
}

pub struct RpcWebSocketServer {
    inner: Arc<RpcServerInner>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl RpcWebSocketServer {
    pub async fn new(host: impl Into<String>, port: u16, options: RpcServerOptions) -> Self {
        let server = WebSocketServer::new(host, port, options.socket.clone());
        let handler = RpcMessageHandler::new(options.handler.clone());
        let (events_tx, _) = broadcast::channel(256);

        let inner = Arc::new(RpcServerInner {
            server,
            handler,
            subscriptions: Mutex::new(HashMap::new()),
            allowed_events: Mutex::new(options.events.iter().cloned().collect()),
            event_patterns: options
                .event_patterns
                .iter()
                .map(|p| WildMatch::new(p))
                .collect(),
            event_predicate: StdMutex::new(None),
            events_tx,
        });

        register_builtins(&inner).await;
        wire_hooks(&inner);

        Self {
            inner,
            dispatcher: StdMutex::new(None),
        }
    }

    /// Gate upgrades (auth, metadata) before sockets are accepted
    pub fn set_upgrade_hook(&self, hook: Arc<dyn UpgradeHook>) {
        self.inner.server.set_upgrade_hook(hook);
    }

    /// Approve ad hoc event names beyond the configured set and patterns
    pub fn set_event_predicate(&self, predicate: EventPredicate) {
        *self
            .inner
            .event_predicate
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(predicate);
    }

    /// Dynamically allow one more event name
    pub async fn register_event(&self, event: impl Into<String>) {
        self.inner.allowed_events.lock().await.insert(event.into());
    }

    /// Register a method handler. Duplicates are rejected unless
    /// `override_existing` is set.
    pub async fn add_method<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        override_existing: bool,
    ) -> WsRpcResult<()>
    where
        F: Fn(Option<Value>, RpcContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = WsRpcResult<Value>> + Send + 'static,
    {
        self.inner
            .handler
            .add_method(name, handler, override_existing)
            .await
    }

    pub fn events(&self) -> broadcast::Receiver<RpcServerEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.server.peer_count().await
    }

    pub async fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(event)
            .map_or(0, HashSet::len)
    }

    /// Bind and start dispatching. Idempotent.
    pub async fn start(&self) -> WsRpcResult<()> {
        self.inner.server.start().await?;

        let mut guard = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let Some(mut events_rx) = self.inner.server.events() else {
            return Ok(());
        };
        let weak = Arc::downgrade(&self.inner);

        *guard = Some(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };

                match event {
                    ServerEvent::Connected(info) => {
                        let _ = inner.events_tx.send(RpcServerEvent::Connection(info));
                    }
                    ServerEvent::Disconnected { peer } => {
                        purge_subscriptions(&inner, peer).await;
                        let _ = inner.events_tx.send(RpcServerEvent::Disconnected { peer });
                    }
                    ServerEvent::ClientError { peer, message } => {
                        let _ = inner
                            .events_tx
                            .send(RpcServerEvent::ClientError { peer, message });
                    }
                    ServerEvent::Message { peer, text } => {
                        // Per-message dispatch; a slow handler never blocks
                        // other peers or later frames.
                        tokio::spawn(dispatch_message(inner, peer, text));
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop dispatching and close the listener. Idempotent.
    pub async fn stop(&self) -> WsRpcResult<()> {
        self.inner.server.stop().await?;

        let task = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    /// Broadcast an event notification to every subscribed peer.
    /// Disconnected peers were already purged from the registry.
    pub async fn emit(&self, event: &str, data: Value) -> WsRpcResult<()> {
        let inner = &self.inner;
        let envelope = JsonRpcNotification::event(event, data);
        let text = serde_json::to_value(&envelope)?.to_string();

        let subscribers: Vec<u64> = {
            let subscriptions = inner.subscriptions.lock().await;
            subscriptions
                .get(event)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };

        debug!(%event, count = subscribers.len(), "Emitting event");
        let sends = subscribers.iter().map(|&peer| {
            let text = text.clone();
            async move {
                if let Err(error) = inner.server.send(peer, text).await {
                    debug!(peer, %error, "Event delivery failed");
                }
            }
        });
        futures::future::join_all(sends).await;

        Ok(())
    }

    /// Send a notification to one peer
    pub async fn notify(
        &self,
        peer: u64,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> WsRpcResult<()> {
        let envelope = JsonRpcNotification::new(method, params);
        self.inner
            .server
            .send(peer, serde_json::to_value(&envelope)?.to_string())
            .await
    }

    /// Send a raw text frame to one peer
    pub async fn send_raw(&self, peer: u64, text: String) -> WsRpcResult<()> {
        self.inner.server.send(peer, text).await
    }

    /// Kick one peer by force-closing its socket
    pub async fn close_peer(&self, peer: u64) {
        self.inner.server.close_peer(peer).await;
    }
}

async fn dispatch_message(inner: Arc<RpcServerInner>, peer: u64, text: String) {
    let Some(info) = inner.server.peer_info(peer).await else {
        debug!(peer, "Dropping frame from departed peer");
        return;
    };

    let ctx = RpcContext {
        peer,
        addr: info.addr,
        metadata: info.metadata,
    };

    let reply = match inner.handler.handle_message(&text, ctx).await {
        HandlerOutcome::Response(response) => serde_json::to_value(&response).ok(),
        HandlerOutcome::Batch(responses) if !responses.is_empty() => {
            serde_json::to_value(&responses).ok()
        }
        // Notify-only traffic gets no reply at all.
        HandlerOutcome::Batch(_) | HandlerOutcome::None => None,
    };

    if let Some(reply) = reply {
        if let Err(error) = inner.server.send(peer, reply.to_string()).await {
            warn!(peer, %error, "Failed to deliver response");
        }
    }
}

async fn purge_subscriptions(inner: &Arc<RpcServerInner>, peer: u64) {
    let mut subscriptions = inner.subscriptions.lock().await;
    subscriptions.retain(|_, set| {
        set.remove(&peer);
        !set.is_empty()
    });
}

async fn event_allowed(inner: &Arc<RpcServerInner>, event: &str) -> bool {
    if inner.allowed_events.lock().await.contains(event) {
        return true;
    }

    if inner.event_patterns.iter().any(|p| p.matches(event)) {
        return true;
    }

    let predicate = inner
        .event_predicate
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    predicate.is_some_and(|p| p(event))
}

/// First positional argument must be the event name
fn parse_event_argument(params: &Option<Value>) -> WsRpcResult<String> {
    let event = match params {
        Some(Value::String(event)) => Some(event.clone()),
        Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    event.ok_or_else(|| {
        WsRpcError::rpc(
            error_codes::INVALID_PARAMS,
            "Invalid params: expected an event name",
            None,
        )
    })
}

async fn register_builtins(inner: &Arc<RpcServerInner>) {
    let result = inner
        .handler
        .add_method("ping", |_, _| async { Ok(json!("pong")) }, false)
        .await;
    debug_assert!(result.is_ok());

    let weak = Arc::downgrade(inner);
    let result = inner
        .handler
        .add_method(
            "subscribe",
            move |params, ctx: RpcContext| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(WsRpcError::rpc(
                            error_codes::INTERNAL_ERROR,
                            "Server is shutting down",
                            None,
                        ));
                    };

                    let event = parse_event_argument(&params)?;
                    if !event_allowed(&inner, &event).await {
                        return Err(WsRpcError::rpc(
                            error_codes::INVALID_PARAMS,
                            format!("Invalid params: unknown event '{}'", event),
                            None,
                        ));
                    }

                    inner
                        .subscriptions
                        .lock()
                        .await
                        .entry(event)
                        .or_default()
                        .insert(ctx.peer);

                    // The peer may have raced a disconnect; keep the
                    // registry consistent with the peer table.
                    if inner.server.peer_info(ctx.peer).await.is_none() {
                        purge_subscriptions(&inner, ctx.peer).await;
                    }

                    Ok(json!(true))
                }
            },
            false,
        )
        .await;
    debug_assert!(result.is_ok());

    let weak = Arc::downgrade(inner);
    let result = inner
        .handler
        .add_method(
            "unsubscribe",
            move |params, ctx: RpcContext| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(WsRpcError::rpc(
                            error_codes::INTERNAL_ERROR,
                            "Server is shutting down",
                            None,
                        ));
                    };

                    let event = parse_event_argument(&params)?;
                    let mut subscriptions = inner.subscriptions.lock().await;
                    if let Some(set) = subscriptions.get_mut(&event) {
                        set.remove(&ctx.peer);
                        if set.is_empty() {
                            subscriptions.remove(&event);
                        }
                    }

                    Ok(json!(true))
                }
            },
            false,
        )
        .await;
    debug_assert!(result.is_ok());
}

fn wire_hooks(inner: &Arc<RpcServerInner>) {
    let weak = Arc::downgrade(inner);
    inner
        .handler
        .set_notification_hook(Arc::new(move |method, params, ctx: RpcContext| {
            if let Some(inner) = weak.upgrade() {
                let _ = inner.events_tx.send(RpcServerEvent::Notification {
                    peer: ctx.peer,
                    method,
                    params,
                });
            }
        }));

    let weak = Arc::downgrade(inner);
    inner
        .handler
        .set_unhandled_hook(Arc::new(move |message, ctx: RpcContext| {
            if let Some(inner) = weak.upgrade() {
                let _ = inner.events_tx.send(RpcServerEvent::UnhandledMessage {
                    peer: ctx.peer,
                    message,
                });
            }
        }));
}

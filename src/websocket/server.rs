//! Multi-client WebSocket server
//!
//! Binds an HTTP listener and upgrades connections at a configured
//! path. Every accepted socket becomes a Peer: a monotonically
//! increasing id, a dedicated writer task, and a heartbeat whose
//! failure force-closes the socket. Peers are fully independent; a slow
//! or broken peer never blocks the others.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::heartbeat::{Heartbeat, HeartbeatOptions};
use crate::{WsRpcError, WsRpcResult};

/// Request metadata handed to the upgrade hook before a socket is accepted
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub remote_addr: SocketAddr,
    pub path: String,
    pub headers: HeaderMap,
}

/// Refusing an upgrade; turned into a plain HTTP response
#[derive(Debug, Clone)]
pub struct UpgradeRejection {
    pub status: u16,
    pub reason: String,
}

impl UpgradeRejection {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self {
            status: 403,
            reason: reason.into(),
        }
    }
}

/// Pre-upgrade gate. Runs before the socket is accepted: await freely to
/// defer, return metadata to attach it to the peer, or return a
/// rejection to deny the upgrade.
#[async_trait]
pub trait UpgradeHook: Send + Sync {
    async fn before_upgrade(&self, request: &UpgradeRequest) -> Result<Value, UpgradeRejection>;
}

#[derive(Debug, Clone)]
pub struct WebSocketServerOptions {
    /// Route that accepts WebSocket upgrades
    pub path: String,
    pub heartbeat: HeartbeatOptions,
    pub send_timeout: Duration,
}

impl Default for WebSocketServerOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            heartbeat: HeartbeatOptions::default(),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// One accepted connection and its session attributes
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub metadata: Value,
    pub connected_at: DateTime<Utc>,
}

/// Transport-level events observable through [`WebSocketServer::events`]
#[derive(Debug)]
pub enum ServerEvent {
    Connected(PeerInfo),
    Disconnected { peer: u64 },
    Message { peer: u64, text: String },
    ClientError { peer: Option<u64>, message: String },
}

enum Outbound {
    Frame {
        message: Message,
        ack: Option<oneshot::Sender<Result<(), String>>>,
    },
    Close,
}

struct PeerEntry {
    info: PeerInfo,
    outbound: mpsc::Sender<Outbound>,
    close_tx: watch::Sender<bool>,
}

struct ServerInner {
    options: WebSocketServerOptions,
    hook: StdMutex<Option<Arc<dyn UpgradeHook>>>,
    peers: Mutex<HashMap<u64, PeerEntry>>,
    next_peer_id: AtomicU64,
    event_tx: mpsc::Sender<ServerEvent>,
    event_consumer_attached: AtomicBool,
}

struct Runtime {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct WebSocketServer {
    host: String,
    port: u16,
    inner: Arc<ServerInner>,
    runtime: StdMutex<Option<Runtime>>,
    event_rx: StdMutex<Option<mpsc::Receiver<ServerEvent>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl WebSocketServer {
    pub fn new(host: impl Into<String>, port: u16, options: WebSocketServerOptions) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            host: host.into(),
            port,
            inner: Arc::new(ServerInner {
                options,
                hook: StdMutex::new(None),
                peers: Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(0),
                event_tx,
                event_consumer_attached: AtomicBool::new(false),
            }),
            runtime: StdMutex::new(None),
            event_rx: StdMutex::new(Some(event_rx)),
            local_addr: StdMutex::new(None),
        }
    }

    /// Install the pre-upgrade gate. Takes effect for later upgrades.
    pub fn set_upgrade_hook(&self, hook: Arc<dyn UpgradeHook>) {
        *self.inner.hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Take the transport event stream. Single consumer.
    pub fn events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        let rx = self
            .event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if rx.is_some() {
            self.inner
                .event_consumer_attached
                .store(true, Ordering::SeqCst);
        }
        rx
    }

    /// Bound address after a successful start; useful with port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn peer_info(&self, id: u64) -> Option<PeerInfo> {
        self.inner.peers.lock().await.get(&id).map(|p| p.info.clone())
    }

    pub async fn peer_ids(&self) -> Vec<u64> {
        self.inner.peers.lock().await.keys().copied().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    /// Bind the listener and start accepting upgrades. Resolves once the
    /// listener is bound. Idempotent.
    pub async fn start(&self) -> WsRpcResult<()> {
        {
            let guard = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
            if guard.as_ref().is_some_and(|r| !r.task.is_finished()) {
                return Ok(());
            }
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);

        let app = Router::new()
            .route(&self.inner.options.path, get(upgrade_handler))
            .with_state(self.inner.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;

            if let Err(error) = result {
                warn!(%error, "WebSocket server terminated abnormally");
            }
        });

        info!(%addr, path = %self.inner.options.path, "WebSocket server listening");
        *self.runtime.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Runtime { shutdown_tx, task });
        Ok(())
    }

    /// Close every peer and shut the listener down. Resolves once the
    /// listener is closed. Idempotent.
    pub async fn stop(&self) -> WsRpcResult<()> {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(runtime) = runtime else {
            return Ok(());
        };

        // Graceful shutdown waits for live connections, so close them.
        {
            let peers = self.inner.peers.lock().await;
            for peer in peers.values() {
                let _ = peer.close_tx.send(true);
            }
        }

        let _ = runtime.shutdown_tx.send(());
        let task = runtime.task;
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("Listener did not shut down in time");
        }

        self.inner.peers.lock().await.clear();
        info!("WebSocket server stopped");
        Ok(())
    }

    /// Send a text frame to one peer, bounded by the send timeout.
    /// Failures surface a peer-scoped client-error event and never affect
    /// other peers.
    pub async fn send(&self, peer: u64, text: String) -> WsRpcResult<()> {
        send_to_peer(&self.inner, peer, text).await
    }

    /// Force-close one peer's socket
    pub async fn close_peer(&self, peer: u64) {
        if let Some(entry) = self.inner.peers.lock().await.get(&peer) {
            let _ = entry.close_tx.send(true);
        }
    }
}

async fn send_to_peer(inner: &Arc<ServerInner>, peer: u64, text: String) -> WsRpcResult<()> {
    let outbound = {
        let peers = inner.peers.lock().await;
        peers.get(&peer).map(|p| p.outbound.clone())
    };

    let Some(outbound) = outbound else {
        return Err(WsRpcError::send(
            format!("Unknown peer {}", peer),
            None,
            Some(Value::String(text)),
        ));
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    let frame = Outbound::Frame {
        message: Message::Text(text.clone().into()),
        ack: Some(ack_tx),
    };

    if outbound.send(frame).await.is_err() {
        return Err(WsRpcError::send(
            "Peer connection closed",
            None,
            Some(Value::String(text)),
        ));
    }

    let failure = match tokio::time::timeout(inner.options.send_timeout, ack_rx).await {
        Ok(Ok(Ok(()))) => return Ok(()),
        Ok(Ok(Err(error))) => format!("Failed to send message to peer: {}", error),
        Ok(Err(_)) => "Peer connection closed".to_string(),
        Err(_) => "Send timeout".to_string(),
    };

    emit(inner, ServerEvent::ClientError {
        peer: Some(peer),
        message: failure.clone(),
    })
    .await;

    Err(WsRpcError::send(failure, None, Some(Value::String(text))))
}

async fn emit(inner: &Arc<ServerInner>, event: ServerEvent) {
    if !inner.event_consumer_attached.load(Ordering::SeqCst) {
        return;
    }
    if inner.event_tx.send(event).await.is_err() {
        debug!("Server event consumer dropped");
    }
}

async fn upgrade_handler(
    State(inner): State<Arc<ServerInner>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let request = UpgradeRequest {
        remote_addr: addr,
        path: inner.options.path.clone(),
        headers,
    };

    let hook = inner.hook.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let metadata = match hook {
        Some(hook) => match hook.before_upgrade(&request).await {
            Ok(metadata) => metadata,
            Err(rejection) => {
                debug!(%addr, reason = %rejection.reason, "Upgrade denied");
                let status =
                    StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::FORBIDDEN);
                return (status, rejection.reason).into_response();
            }
        },
        None => Value::Null,
    };

    ws.on_upgrade(move |socket| handle_socket(inner, socket, addr, metadata))
}

async fn handle_socket(
    inner: Arc<ServerInner>,
    socket: WebSocket,
    addr: SocketAddr,
    metadata: Value,
) {
    let id = inner.next_peer_id.fetch_add(1, Ordering::SeqCst) + 1;
    let info = PeerInfo {
        id,
        addr,
        metadata,
        connected_at: Utc::now(),
    };

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);
    let (close_tx, mut close_rx) = watch::channel(false);

    inner.peers.lock().await.insert(
        id,
        PeerEntry {
            info: info.clone(),
            outbound: outbound_tx.clone(),
            close_tx,
        },
    );

    debug!(peer = id, %addr, "Peer connected");
    emit(&inner, ServerEvent::Connected(info)).await;

    // Dedicated writer; per-peer sends never contend on a shared sink.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame { message, ack } => {
                    let result = sink.send(message).await.map_err(|e| e.to_string());
                    let failed = result.is_err();
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    if failed {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let hb = inner.options.heartbeat;
    let mut heartbeat = hb.enabled.then(|| {
        let probe_tx = outbound_tx.clone();
        let timeout_inner = inner.clone();
        Heartbeat::start(
            hb.interval,
            hb.timeout,
            move || {
                let _ = probe_tx.try_send(Outbound::Frame {
                    message: Message::Ping(Vec::new().into()),
                    ack: None,
                });
            },
            move || {
                // Liveness lost: surface the failure and force-close.
                let _ = timeout_inner.event_tx.try_send(ServerEvent::ClientError {
                    peer: Some(id),
                    message: "Heartbeat timeout".to_string(),
                });
                tokio::spawn(async move {
                    if let Some(entry) = timeout_inner.peers.lock().await.get(&id) {
                        let _ = entry.close_tx.send(true);
                    }
                });
            },
        )
    });

    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    let _ = outbound_tx.try_send(Outbound::Close);
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(hb) = heartbeat.as_ref() {
                        hb.resolve();
                    }
                    emit(&inner, ServerEvent::Message { peer: id, text: text.to_string() }).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(hb) = heartbeat.as_ref() {
                        hb.resolve();
                    }
                    match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            emit(&inner, ServerEvent::Message { peer: id, text }).await;
                        }
                        Err(_) => warn!(peer = id, "Dropping non-UTF-8 binary frame"),
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Control frames count as liveness; pings are answered
                    // automatically below us.
                    if let Some(hb) = heartbeat.as_ref() {
                        hb.resolve();
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(error)) => {
                    emit(&inner, ServerEvent::ClientError {
                        peer: Some(id),
                        message: error.to_string(),
                    })
                    .await;
                    break;
                }
            },
        }
    }

    if let Some(hb) = heartbeat.as_mut() {
        hb.stop();
    }
    drop(heartbeat);
    drop(outbound_tx);

    // No peer entry may outlive its socket.
    inner.peers.lock().await.remove(&id);
    emit(&inner, ServerEvent::Disconnected { peer: id }).await;
    debug!(peer = id, "Peer disconnected");

    let _ = writer.await;
}

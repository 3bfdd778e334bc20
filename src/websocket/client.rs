//! Reconnecting WebSocket client
//!
//! One logical connection per client. A connection actor task owns the
//! socket; callers talk to it over a command channel, so every public
//! operation is a bounded await. Unsolicited closes run the bounded
//! reconnect loop; explicit disconnects suppress it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::heartbeat::{Heartbeat, HeartbeatOptions};
use crate::{WsRpcError, WsRpcResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub enabled: bool,
    /// Delay before each reconnect attempt
    pub delay: Duration,
    /// Maximum reconnect attempts after an unsolicited close
    pub attempts: u32,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(1),
            attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketClientOptions {
    pub protocols: Vec<String>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub reconnect: ReconnectOptions,
    pub heartbeat: HeartbeatOptions,
}

impl Default for WebSocketClientOptions {
    fn default() -> Self {
        Self {
            protocols: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            reconnect: ReconnectOptions::default(),
            heartbeat: HeartbeatOptions::default(),
        }
    }
}

/// Lifecycle events observable through [`WebSocketClient::events`]
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Open,
    Close { code: u16, reason: String },
    Reconnecting { attempt: u32 },
    ReconnectFailed,
    Error { message: String },
}

enum Command {
    Send {
        text: String,
        ack: oneshot::Sender<WsRpcResult<()>>,
    },
    Disconnect {
        code: u16,
        reason: String,
        ack: oneshot::Sender<()>,
    },
    Ping,
    HeartbeatTimeout,
}

enum Exit {
    Explicit {
        code: u16,
        reason: String,
        ack: Option<oneshot::Sender<()>>,
    },
    Unsolicited {
        code: u16,
        reason: String,
    },
}

struct ActorHandle {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

pub struct WebSocketClient {
    url: String,
    options: WebSocketClientOptions,
    state_tx: watch::Sender<ConnectionState>,
    // Retained so the watch channel keeps at least one receiver: without
    // it `state_tx.send(..)` fails (and leaves the value unchanged) whenever
    // no external subscriber happens to be alive.
    _state_keepalive: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
    msg_tx: mpsc::Sender<String>,
    msg_rx: StdMutex<Option<mpsc::Receiver<String>>>,
    msg_consumer_attached: std::sync::Arc<AtomicBool>,
    actor: StdMutex<Option<ActorHandle>>,
}

impl WebSocketClient {
    pub fn new(url: impl Into<String>, options: WebSocketClientOptions) -> Self {
        let (state_tx, state_keepalive) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        let (msg_tx, msg_rx) = mpsc::channel(256);

        Self {
            url: url.into(),
            options,
            state_tx,
            _state_keepalive: state_keepalive,
            events_tx,
            msg_tx,
            msg_rx: StdMutex::new(Some(msg_rx)),
            msg_consumer_attached: std::sync::Arc::new(AtomicBool::new(false)),
            actor: StdMutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Take the inbound message stream. Single consumer; the first caller
    /// gets the receiver, later calls get None.
    pub fn messages(&self) -> Option<mpsc::Receiver<String>> {
        let rx = self
            .msg_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if rx.is_some() {
            self.msg_consumer_attached.store(true, Ordering::SeqCst);
        }
        rx
    }

    /// Open the connection. A call while Connecting or Open awaits the
    /// existing attempt instead of opening a second socket.
    pub async fn connect(&self) -> WsRpcResult<()> {
        {
            let mut guard = self.actor.lock().unwrap_or_else(|e| e.into_inner());
            let running = guard.as_ref().is_some_and(|h| !h.task.is_finished());

            if !running {
                let (cmd_tx, cmd_rx) = mpsc::channel(64);
                // Transition before the task runs so a concurrent connect()
                // never mistakes the spawn window for a failed attempt.
                let _ = self.state_tx.send(ConnectionState::Connecting);

                let actor = Actor {
                    url: self.url.clone(),
                    options: self.options.clone(),
                    state_tx: self.state_tx.clone(),
                    events_tx: self.events_tx.clone(),
                    msg_tx: self.msg_tx.clone(),
                    msg_consumer_attached: self.msg_consumer_attached.clone(),
                    cmd_tx: cmd_tx.clone(),
                };

                let task = tokio::spawn(actor.run(cmd_rx));
                *guard = Some(ActorHandle { cmd_tx, task });
            }
        }

        let mut state_rx = self.state_tx.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(WsRpcError::connect(
                        "Connection failed",
                        Some(self.url.clone()),
                    ));
                }
                ConnectionState::Connecting | ConnectionState::Closing => {}
            }

            if state_rx.changed().await.is_err() {
                return Err(WsRpcError::connect(
                    "Connection task terminated",
                    Some(self.url.clone()),
                ));
            }
        }
    }

    /// Send a text frame. Requires the Open state; this client never
    /// auto-connects on send.
    pub async fn send(&self, text: String) -> WsRpcResult<()> {
        let payload = || Some(serde_json::Value::String(text.clone()));

        if self.state() != ConnectionState::Open {
            return Err(WsRpcError::send(
                "Not connected",
                Some(self.url.clone()),
                payload(),
            ));
        }

        let cmd_tx = {
            let guard = self.actor.lock().unwrap_or_else(|e| e.into_inner());
            guard.as_ref().map(|h| h.cmd_tx.clone())
        };
        let cmd_tx = cmd_tx.ok_or_else(|| {
            WsRpcError::send("Not connected", Some(self.url.clone()), payload())
        })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                text: text.clone(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| WsRpcError::send("Connection closed", Some(self.url.clone()), payload()))?;

        match tokio::time::timeout(self.options.send_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WsRpcError::send(
                "Connection closed before the write was acknowledged",
                Some(self.url.clone()),
                payload(),
            )),
            Err(_) => Err(WsRpcError::send(
                "Send timeout",
                Some(self.url.clone()),
                payload(),
            )),
        }
    }

    /// Close the connection and suppress reconnection. Idempotent: extra
    /// calls on a disconnected client are no-ops.
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<String>) -> WsRpcResult<()> {
        let handle = {
            let guard = self.actor.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(h) if !h.task.is_finished() => Some(h.cmd_tx.clone()),
                _ => None,
            }
        };

        let Some(cmd_tx) = handle else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = cmd_tx
            .send(Command::Disconnect {
                code: code.unwrap_or(1000),
                reason: reason.unwrap_or_default(),
                ack: ack_tx,
            })
            .await;

        if sent.is_ok() && tokio::time::timeout(self.options.disconnect_timeout, ack_rx).await.is_err()
        {
            // Graceful close never confirmed; force termination.
            warn!(url = %self.url, "Disconnect timeout, terminating connection task");
            let mut guard = self.actor.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(h) = guard.take() {
                h.task.abort();
            }
            let _ = self.state_tx.send(ConnectionState::Disconnected);
        }

        Ok(())
    }
}

struct Actor {
    url: String,
    options: WebSocketClientOptions,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
    msg_tx: mpsc::Sender<String>,
    msg_consumer_attached: std::sync::Arc<AtomicBool>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Actor {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut ws = match self.dial().await {
            Ok(ws) => ws,
            Err(error) => {
                self.emit(ClientEvent::Error {
                    message: error.to_string(),
                });
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                return;
            }
        };

        let _ = self.state_tx.send(ConnectionState::Open);
        self.emit(ClientEvent::Open);

        let mut retried = 0u32;
        loop {
            let exit = self.run_session(ws, &mut cmd_rx).await;

            match exit {
                Exit::Explicit { code, reason, ack } => {
                    self.emit(ClientEvent::Close { code, reason });
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                Exit::Unsolicited { code, reason } => {
                    self.emit(ClientEvent::Close { code, reason });

                    let reconnect = &self.options.reconnect;
                    if !reconnect.enabled || reconnect.attempts == 0 {
                        let _ = self.state_tx.send(ConnectionState::Disconnected);
                        return;
                    }

                    let _ = self.state_tx.send(ConnectionState::Connecting);
                    match self.reconnect(&mut cmd_rx, &mut retried).await {
                        Some(next) => {
                            ws = next;
                            let _ = self.state_tx.send(ConnectionState::Open);
                            self.emit(ClientEvent::Open);
                        }
                        None => {
                            let _ = self.state_tx.send(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Retry dialing until the budget is exhausted. None means terminal
    /// failure (reconnect-failed already emitted) or explicit disconnect.
    async fn reconnect(
        &self,
        cmd_rx: &mut mpsc::Receiver<Command>,
        retried: &mut u32,
    ) -> Option<WsStream> {
        loop {
            *retried += 1;
            if *retried > self.options.reconnect.attempts {
                self.emit(ClientEvent::ReconnectFailed);
                return None;
            }

            self.emit(ClientEvent::Reconnecting { attempt: *retried });

            // Stay responsive to explicit disconnects while waiting.
            let sleep = tokio::time::sleep(self.options.reconnect.delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Disconnect { ack, .. }) => {
                            let _ = ack.send(());
                            return None;
                        }
                        Some(Command::Send { ack, .. }) => {
                            let _ = ack.send(Err(WsRpcError::send(
                                "Not connected",
                                Some(self.url.clone()),
                                None,
                            )));
                        }
                        Some(_) => {}
                        None => return None,
                    },
                }
            }

            match self.dial().await {
                Ok(ws) => {
                    *retried = 0;
                    return Some(ws);
                }
                Err(error) => {
                    debug!(url = %self.url, %error, "Reconnect attempt failed");
                    self.emit(ClientEvent::Error {
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    /// Drive one established socket until it closes
    async fn run_session(&self, ws: WsStream, cmd_rx: &mut mpsc::Receiver<Command>) -> Exit {
        let (mut sink, mut stream) = ws.split();

        let hb = &self.options.heartbeat;
        let mut heartbeat = hb.enabled.then(|| {
            let probe_tx = self.cmd_tx.clone();
            let timeout_tx = self.cmd_tx.clone();
            Heartbeat::start(
                hb.interval,
                hb.timeout,
                move || {
                    let _ = probe_tx.try_send(Command::Ping);
                },
                move || {
                    let _ = timeout_tx.try_send(Command::HeartbeatTimeout);
                },
            )
        });

        let exit = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send { text, ack }) => {
                        let write = tokio::time::timeout(
                            self.options.send_timeout,
                            sink.send(Message::text(text)),
                        )
                        .await;

                        match write {
                            Ok(Ok(())) => {
                                let _ = ack.send(Ok(()));
                            }
                            Ok(Err(error)) => {
                                let _ = ack.send(Err(WsRpcError::send(
                                    error.to_string(),
                                    Some(self.url.clone()),
                                    None,
                                )));
                                break Exit::Unsolicited {
                                    code: 1006,
                                    reason: format!("write failed: {}", error),
                                };
                            }
                            Err(_) => {
                                let _ = ack.send(Err(WsRpcError::send(
                                    "Send timeout",
                                    Some(self.url.clone()),
                                    None,
                                )));
                            }
                        }
                    }
                    Some(Command::Ping) => {
                        let _ = sink.send(Message::Ping(Vec::new().into())).await;
                    }
                    Some(Command::HeartbeatTimeout) => {
                        self.emit(ClientEvent::Error {
                            message: "Heartbeat timeout".to_string(),
                        });
                        let _ = tokio::time::timeout(
                            Duration::from_secs(1),
                            sink.send(Message::Close(None)),
                        )
                        .await;
                        break Exit::Unsolicited {
                            code: 1006,
                            reason: "heartbeat timeout".to_string(),
                        };
                    }
                    Some(Command::Disconnect { code, reason, ack }) => {
                        let _ = self.state_tx.send(ConnectionState::Closing);
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };

                        // Bounded graceful close: send the frame and wait
                        // for the peer's close (or stream end).
                        let _ = tokio::time::timeout(self.options.disconnect_timeout, async {
                            let _ = sink.send(Message::Close(Some(frame))).await;
                            while let Some(Ok(msg)) = stream.next().await {
                                if matches!(msg, Message::Close(_)) {
                                    break;
                                }
                            }
                        })
                        .await;

                        break Exit::Explicit {
                            code,
                            reason,
                            ack: Some(ack),
                        };
                    }
                    None => {
                        // Client dropped; close quietly without reconnecting.
                        let _ = tokio::time::timeout(
                            Duration::from_secs(1),
                            sink.send(Message::Close(None)),
                        )
                        .await;
                        break Exit::Explicit {
                            code: 1000,
                            reason: String::new(),
                            ack: None,
                        };
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(hb) = heartbeat.as_ref() {
                            hb.resolve();
                        }
                        self.forward(text.to_string()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(hb) = heartbeat.as_ref() {
                            hb.resolve();
                        }
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => self.forward(text).await,
                            Err(_) => warn!(url = %self.url, "Dropping non-UTF-8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Control traffic counts as liveness; tungstenite
                        // answers pings on its own.
                        if let Some(hb) = heartbeat.as_ref() {
                            hb.resolve();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        break Exit::Unsolicited { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        self.emit(ClientEvent::Error {
                            message: error.to_string(),
                        });
                        break Exit::Unsolicited {
                            code: 1006,
                            reason: error.to_string(),
                        };
                    }
                    None => break Exit::Unsolicited {
                        code: 1006,
                        reason: "connection reset".to_string(),
                    },
                },
            }
        };

        if let Some(hb) = heartbeat.as_mut() {
            hb.stop();
        }

        exit
    }

    async fn dial(&self) -> WsRpcResult<WsStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| WsRpcError::connect(e.to_string(), Some(self.url.clone())))?;

        if !self.options.protocols.is_empty() {
            let value = HeaderValue::from_str(&self.options.protocols.join(", "))
                .map_err(|e| WsRpcError::connect(e.to_string(), Some(self.url.clone())))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        match tokio::time::timeout(self.options.connect_timeout, connect_async(request)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(error)) => Err(WsRpcError::connect(
                error.to_string(),
                Some(self.url.clone()),
            )),
            Err(_) => Err(WsRpcError::connect(
                "Connect timeout",
                Some(self.url.clone()),
            )),
        }
    }

    async fn forward(&self, text: String) {
        if !self.msg_consumer_attached.load(Ordering::SeqCst) {
            return;
        }
        if self.msg_tx.send(text).await.is_err() {
            debug!(url = %self.url, "Message consumer dropped");
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_open_state() {
        let client = WebSocketClient::new("ws://127.0.0.1:1", WebSocketClientOptions::default());

        let err = client.send("hello".to_string()).await.unwrap_err();
        assert!(matches!(err, WsRpcError::Send { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let client = WebSocketClient::new("ws://127.0.0.1:1", WebSocketClientOptions::default());

        client.disconnect(None, None).await.unwrap();
        client.disconnect(Some(1001), Some("bye".into())).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_typed_and_terminal() {
        let options = WebSocketClientOptions {
            connect_timeout: Duration::from_millis(300),
            reconnect: ReconnectOptions {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        // Unroutable port: nothing listens on it.
        let client = WebSocketClient::new("ws://127.0.0.1:9", options);

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, WsRpcError::Connect { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_message_stream_taken_once() {
        let client = WebSocketClient::new("ws://127.0.0.1:1", WebSocketClientOptions::default());

        assert!(client.messages().is_some());
        assert!(client.messages().is_none());
    }
}

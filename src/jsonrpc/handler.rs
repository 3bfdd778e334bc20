//! JSON-RPC method dispatch
//!
//! [`RpcMessageHandler`] owns the method registry and turns one raw
//! inbound frame into zero or one outbound frames: single requests get a
//! response, notifications get none, batches get an input-ordered array
//! with notification slots dropped. Handler failures never propagate
//! past the call that caused them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::jsonrpc::protocol::{
    error_codes, JsonRpcErrorObject, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
};
use crate::{WsRpcError, WsRpcResult};

/// Method handler function signature: JSON params plus a per-connection
/// context, returning a JSON result
pub type MethodHandler<C> = Arc<
    dyn Fn(Option<Value>, C) -> BoxFuture<'static, WsRpcResult<Value>> + Send + Sync,
>;

/// Hook invoked for inbound notifications that have no registered method
pub type NotificationHook<C> = Arc<dyn Fn(String, Option<Value>, C) + Send + Sync>;

/// Hook invoked for frames that cannot be routed anywhere
pub type UnhandledHook<C> = Arc<dyn Fn(String, C) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RpcMessageHandlerOptions {
    /// Per-call ceiling on handler execution time
    pub operation_timeout: Duration,
    /// Largest batch accepted before the whole array is refused
    pub max_batch_size: usize,
}

impl Default for RpcMessageHandlerOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            max_batch_size: 1000,
        }
    }
}

/// What the dispatcher should write back, if anything
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Single response envelope
    Response(JsonRpcResponse),
    /// Batch responses in input order; empty means send nothing
    Batch(Vec<JsonRpcResponse>),
    /// Notification path, nothing to send
    None,
}

pub struct RpcMessageHandler<C> {
    methods: Mutex<HashMap<String, MethodHandler<C>>>,
    options: RpcMessageHandlerOptions,
    on_notification: std::sync::Mutex<Option<NotificationHook<C>>>,
    on_unhandled: std::sync::Mutex<Option<UnhandledHook<C>>>,
}

impl<C> RpcMessageHandler<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(options: RpcMessageHandlerOptions) -> Self {
        Self {
            methods: Mutex::new(HashMap::new()),
            options,
            on_notification: std::sync::Mutex::new(None),
            on_unhandled: std::sync::Mutex::new(None),
        }
    }

    /// Register a method handler. Duplicate names are rejected unless
    /// `override_existing` is set.
    pub async fn add_method<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        override_existing: bool,
    ) -> WsRpcResult<()>
    where
        F: Fn(Option<Value>, C) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = WsRpcResult<Value>> + Send + 'static,
    {
        let name = name.into();
        let wrapped: MethodHandler<C> = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));

        let mut methods = self.methods.lock().await;
        if methods.contains_key(&name) && !override_existing {
            return Err(WsRpcError::MethodExists { name });
        }

        debug!("Registered method: {}", name);
        methods.insert(name, wrapped);
        Ok(())
    }

    pub async fn has_method(&self, name: &str) -> bool {
        self.methods.lock().await.contains_key(name)
    }

    pub async fn method_names(&self) -> Vec<String> {
        self.methods.lock().await.keys().cloned().collect()
    }

    /// Observe notifications that have no registered method handler
    pub fn set_notification_hook(&self, hook: NotificationHook<C>) {
        *self.on_notification.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Observe frames that could not be routed at all
    pub fn set_unhandled_hook(&self, hook: UnhandledHook<C>) {
        *self.on_unhandled.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Dispatch one raw inbound frame.
    ///
    /// Parse failures and non-object/array payloads yield a -32700
    /// response with a null id; everything else follows the JSON-RPC 2.0
    /// single/batch rules.
    pub async fn handle_message(&self, raw: &str, ctx: C) -> HandlerOutcome {
        let data: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => {
                self.emit_unhandled(raw, &ctx);
                return HandlerOutcome::Response(JsonRpcResponse::parse_error());
            }
        };

        match data {
            Value::Array(items) => self.handle_batch(items, ctx).await,
            Value::Object(_) => match self.handle_single(&data, ctx).await {
                Some(response) => HandlerOutcome::Response(response),
                None => HandlerOutcome::None,
            },
            _ => {
                self.emit_unhandled(raw, &ctx);
                HandlerOutcome::Response(JsonRpcResponse::parse_error())
            }
        }
    }

    async fn handle_batch(&self, items: Vec<Value>, ctx: C) -> HandlerOutcome {
        if items.len() > self.options.max_batch_size {
            warn!(
                size = items.len(),
                limit = self.options.max_batch_size,
                "Refusing oversized batch"
            );
            return HandlerOutcome::Response(JsonRpcResponse::error(
                None,
                JsonRpcErrorObject::new(error_codes::INVALID_REQUEST, "Batch size exceeded", None),
            ));
        }

        // Elements are dispatched concurrently; join_all preserves the
        // input order regardless of completion order.
        let responses = join_all(
            items
                .iter()
                .map(|item| self.handle_single(item, ctx.clone())),
        )
        .await;

        HandlerOutcome::Batch(responses.into_iter().flatten().collect())
    }

    /// Dispatch one envelope; None for notifications
    async fn handle_single(&self, value: &Value, ctx: C) -> Option<JsonRpcResponse> {
        let message = match JsonRpcMessage::classify(value) {
            Some(message) => message,
            None => {
                let id = value.get("id").and_then(super::protocol::RequestId::from_value);
                return Some(JsonRpcResponse::invalid_request(id));
            }
        };

        match message {
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification, ctx).await;
                None
            }
            JsonRpcMessage::Request(request) => Some(self.handle_request(request, ctx).await),
            JsonRpcMessage::Response(response) => {
                // A response envelope is not dispatchable on the server side
                Some(JsonRpcResponse::invalid_request(response.id))
            }
        }
    }

    async fn handle_notification(&self, notification: super::JsonRpcNotification, ctx: C) {
        let handler = {
            let methods = self.methods.lock().await;
            methods.get(&notification.method).cloned()
        };

        match handler {
            Some(handler) => {
                // Registered methods run for notifications too; the result
                // is discarded and failures only get logged.
                let outcome = tokio::time::timeout(
                    self.options.operation_timeout,
                    handler(notification.params, ctx),
                )
                .await;

                match outcome {
                    Ok(Err(error)) => warn!(
                        method = %notification.method,
                        %error,
                        "Notification handler failed"
                    ),
                    Err(_) => warn!(
                        method = %notification.method,
                        "Notification handler hit operation timeout"
                    ),
                    Ok(Ok(_)) => {}
                }
            }
            None => {
                let hook = self
                    .on_notification
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(hook) = hook {
                    hook(notification.method, notification.params, ctx);
                } else {
                    debug!(method = %notification.method, "Unrouted notification dropped");
                }
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest, ctx: C) -> JsonRpcResponse {
        if let Err(error) = request.validate() {
            return JsonRpcResponse::error(Some(request.id), error);
        }

        let handler = {
            let methods = self.methods.lock().await;
            methods.get(&request.method).cloned()
        };

        let handler = match handler {
            Some(handler) => handler,
            None => return JsonRpcResponse::method_not_found(&request.method, request.id),
        };

        let id = request.id.clone();
        let outcome =
            tokio::time::timeout(self.options.operation_timeout, handler(request.params, ctx))
                .await;

        match outcome {
            Ok(Ok(result)) => JsonRpcResponse::success(id, result),
            Ok(Err(error)) => {
                debug!(method = %request.method, %error, "Handler returned error");
                JsonRpcResponse::error(Some(id), error.to_error_object())
            }
            Err(_) => {
                warn!(method = %request.method, "Handler hit operation timeout");
                JsonRpcResponse::operation_timeout(id)
            }
        }
    }

    fn emit_unhandled(&self, raw: &str, ctx: &C) {
        let hook = self
            .on_unhandled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(raw.to_string(), ctx.clone());
        }
    }
}

//! CLI command implementations

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::rpc::{RpcClientOptions, RpcServerEvent, RpcWebSocketClient, RpcWebSocketServer};

fn parse_params(params: Option<&str>) -> Result<Option<Value>> {
    params
        .map(|raw| serde_json::from_str(raw).context("Params must be valid JSON"))
        .transpose()
}

pub async fn serve(
    config: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
) -> Result<()> {
    let mut settings = Settings::load(config)?;
    if let Some(host) = host {
        settings.listen.host = host;
    }
    if let Some(port) = port {
        settings.listen.port = port;
    }
    if let Some(path) = path {
        settings.listen.path = path;
    }
    settings.validate()?;

    let server = RpcWebSocketServer::new(
        settings.listen.host.clone(),
        settings.listen.port,
        settings.server_options(),
    )
    .await;

    let mut events = server.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RpcServerEvent::Connection(info)) => {
                    info!(peer = info.id, addr = %info.addr, "Client connected");
                }
                Ok(RpcServerEvent::Disconnected { peer }) => {
                    info!(peer, "Client disconnected");
                }
                Ok(RpcServerEvent::ClientError { peer, message }) => {
                    warn!(?peer, %message, "Client error");
                }
                Ok(RpcServerEvent::Notification {
                    peer,
                    method,
                    params,
                }) => {
                    info!(peer, %method, ?params, "Notification");
                }
                Ok(RpcServerEvent::UnhandledMessage { peer, message }) => {
                    warn!(peer, %message, "Unhandled message");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    server.start().await?;
    if let Some(addr) = server.local_addr() {
        info!(%addr, path = %settings.listen.path, "Serving JSON-RPC over WebSocket");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await?;
    Ok(())
}

pub async fn call(
    url: &str,
    method: &str,
    params: Option<&str>,
    timeout_ms: u64,
) -> Result<()> {
    let params = parse_params(params)?;

    let client = RpcWebSocketClient::new(
        url,
        RpcClientOptions {
            request_timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        },
    );

    client.connect().await?;
    match client.call(method, params).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Err(err) => {
            error!("{}", err);
            client.disconnect(None, None).await.ok();
            return Err(err.into());
        }
    }

    client.disconnect(None, None).await.ok();
    Ok(())
}

pub async fn notify(url: &str, method: &str, params: Option<&str>) -> Result<()> {
    let params = parse_params(params)?;

    let client = RpcWebSocketClient::new(url, RpcClientOptions::default());
    client.connect().await?;
    client.notify(method, params).await?;
    client.disconnect(None, None).await.ok();
    Ok(())
}

pub fn show_config(config: Option<&Path>) -> Result<()> {
    let settings = Settings::load(config)?;
    println!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}

//! Server settings loaded from a TOML file or environment variables
//!
//! Controls the `wsrpc serve` process; library consumers configure the
//! client and server types directly through their options structs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::jsonrpc::RpcMessageHandlerOptions;
use crate::rpc::RpcServerOptions;
use crate::websocket::{HeartbeatOptions, WebSocketServerOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen: ListenSettings,
    pub heartbeat: HeartbeatSettings,
    pub limits: LimitsSettings,
    /// Event names clients may subscribe to
    pub events: Vec<String>,
    /// Wildcard patterns approving further event names, e.g. `price.*`
    pub event_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSettings {
    pub send_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub max_batch_size: usize,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            operation_timeout_ms: 60_000,
            max_batch_size: 1000,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: ListenSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            limits: LimitsSettings::default(),
            events: Vec::new(),
            event_patterns: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Ok(val) = std::env::var("WSRPC_HOST") {
            settings.listen.host = val;
        }
        if let Ok(val) = std::env::var("WSRPC_PORT") {
            settings.listen.port = val.parse().context("WSRPC_PORT must be a port number")?;
        }
        if let Ok(val) = std::env::var("WSRPC_PATH") {
            settings.listen.path = val;
        }
        if let Ok(val) = std::env::var("WSRPC_LOG_LEVEL") {
            settings.listen.log_level = val;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.host.is_empty() {
            anyhow::bail!("Listen host cannot be empty");
        }

        if !self.listen.path.starts_with('/') {
            anyhow::bail!("Upgrade path must start with '/'");
        }

        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            anyhow::bail!("Heartbeat interval must be greater than 0");
        }

        if self.limits.max_batch_size == 0 {
            anyhow::bail!("Max batch size must be greater than 0");
        }

        Ok(())
    }

    /// Translate into the RPC server options
    pub fn server_options(&self) -> RpcServerOptions {
        RpcServerOptions {
            socket: WebSocketServerOptions {
                path: self.listen.path.clone(),
                heartbeat: HeartbeatOptions {
                    enabled: self.heartbeat.enabled,
                    interval: Duration::from_millis(self.heartbeat.interval_ms),
                    timeout: Duration::from_millis(self.heartbeat.timeout_ms),
                },
                send_timeout: Duration::from_millis(self.limits.send_timeout_ms),
            },
            handler: RpcMessageHandlerOptions {
                operation_timeout: Duration::from_millis(self.limits.operation_timeout_ms),
                max_batch_size: self.limits.max_batch_size,
            },
            events: self.events.clone(),
            event_patterns: self.event_patterns.clone(),
        }
    }
}

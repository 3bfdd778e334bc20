//! CLI interface for wsrpc
//!
//! `serve` runs the RPC server; `call` and `notify` are thin client
//! commands for poking at a running server.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wsrpc")]
#[command(about = "Bidirectional JSON-RPC 2.0 over WebSocket")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Configuration file path (TOML format)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the JSON-RPC WebSocket server
    Serve {
        /// Listen host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config)
        #[arg(long, short = 'p')]
        port: Option<u16>,

        /// WebSocket upgrade path (overrides config)
        #[arg(long)]
        path: Option<String>,
    },

    /// Call a method on a running server and print the result
    Call {
        /// Server URL, e.g. ws://127.0.0.1:8080/
        url: String,

        /// Method name
        method: String,

        /// Params as inline JSON
        #[arg(long, short = 'j')]
        params: Option<String>,

        /// Request timeout in milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },

    /// Send a notification to a running server
    Notify {
        url: String,
        method: String,

        /// Params as inline JSON
        #[arg(long, short = 'j')]
        params: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config.as_deref();

        match self.command {
            Commands::Serve { host, port, path } => {
                commands::serve(config, host, port, path).await
            }
            Commands::Call {
                url,
                method,
                params,
                timeout_ms,
            } => commands::call(&url, &method, params.as_deref(), timeout_ms).await,
            Commands::Notify {
                url,
                method,
                params,
            } => commands::notify(&url, &method, params.as_deref()).await,
            Commands::Config => commands::show_config(config),
        }
    }
}

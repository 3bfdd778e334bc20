//! wsrpc - bidirectional JSON-RPC 2.0 over WebSocket.

use anyhow::Result;
use wsrpc::cli::Cli;
use wsrpc::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.log_level.as_deref())?;

    cli.run().await
}

//! Purpose: Wire configuration, tools, and the stdio transport into a running server.
//! Exports: `run_stdio`, `init_tracing`, `shutdown_signal`.
//! Role: Entry point used by the CLI `serve` command.
//! Invariants: Diagnostics go to stderr; stdout is reserved for protocol frames.
//! Invariants: Configuration is validated before any input is read.
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::core::error::Error;
use crate::mcp::dispatcher::McpDispatcher;
use crate::mcp::stdio;
use crate::tools::ToolRegistry;

/// Serve MCP on this process's stdin/stdout until EOF or a termination signal.
pub async fn run_stdio(config: ServerConfig) -> Result<(), Error> {
    config.validate()?;
    let config = Arc::new(config);
    let registry = Arc::new(ToolRegistry::standard(&config)?);
    let dispatcher = Arc::new(McpDispatcher::new(Arc::clone(&config), Arc::clone(&registry)));
    info!(
        version = %dispatcher.metadata().version,
        tools = ?registry.names(),
        max_in_flight = config.max_in_flight,
        tool_timeout_ms = config.tool_timeout.as_millis() as u64,
        "sgmcp listening on stdio"
    );
    stdio::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        dispatcher,
        config.max_frame_bytes,
        shutdown_signal(),
    )
    .await
}

/// `RUST_LOG` wins over `level`; both fall back to `info`.
pub fn init_tracing(level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

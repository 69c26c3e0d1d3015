//! Stdio transport for the MCP server.
//!
//! Reads JSON-RPC messages from stdin and writes responses to stdout. Logs must
//! therefore go to stderr.

use crate::error::{DbError, DbResult};
use crate::mcp::DbService;
use crate::tools::DbOperations;
use crate::transport::Transport;
use rmcp::{ServiceExt, transport::stdio};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

pub struct StdioTransport {
    operations: Arc<DbOperations>,
}

impl StdioTransport {
    pub fn new(operations: Arc<DbOperations>) -> Self {
        Self { operations }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> DbResult<()> {
        info!("Starting MCP server with stdio transport");

        let service = DbService::new(Arc::clone(&self.operations));
        let running_service = service
            .serve(stdio())
            .await
            .map_err(|e| DbError::internal(format!("Failed to start stdio transport: {e}")))?;

        let shutdown_requested = tokio::select! {
            result = running_service.waiting() => {
                match result {
                    Ok(quit_reason) => {
                        info!(reason = ?quit_reason, "Stdio transport completed normally");
                    }
                    Err(e) => {
                        warn!(error = %e, "Stdio transport error");
                        return Err(DbError::internal(format!("Stdio transport error: {e}")));
                    }
                }
                false
            }
            _ = wait_for_signal() => {
                info!("Shutdown signal received");
                true
            }
        };

        if shutdown_requested {
            // Each tool call closes its own pool, so nothing is left to release.
            // A blocking stdin read cannot be interrupted by select!
            info!("Exiting process");
            std::process::exit(0);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// A handler that cannot be installed never fires; the other one still does.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

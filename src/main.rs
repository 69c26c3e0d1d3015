//! dbkit MCP server entry point.
//!
//! Serves the structured database operations over MCP stdio.

use clap::Parser;
use dbkit::config::Config;
use dbkit::tools::DbOperations;
use dbkit::transport::{StdioTransport, Transport};
use std::sync::Arc;
use tracing::{error, info, info_span};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber. Logs go to stderr; stdout carries MCP traffic.
fn init_tracing(config: &Config) {
    if !config.enable_logs {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let defaults = config.operation_defaults()?;
    info!(
        default_connection = defaults
            .default_connection
            .as_ref()
            .map(|c| c.masked_target())
            .unwrap_or_else(|| "none".to_string()),
        query_timeout_secs = config.query_timeout,
        "Starting dbkit v{}",
        env!("CARGO_PKG_VERSION")
    );

    let operations = Arc::new(DbOperations::new(defaults).with_span(info_span!("dbkit")));
    let transport = StdioTransport::new(operations);

    if let Err(e) = transport.run().await {
        error!(error = %e, transport = transport.name(), "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

//! Transport layer for the MCP server.
//!
//! Only stdio is provided: JSON-RPC over standard input/output.

pub mod stdio;

pub use stdio::StdioTransport;

use crate::error::DbResult;
use std::future::Future;

/// An MCP transport.
pub trait Transport: Send + Sync {
    /// Serve requests until the client disconnects or a shutdown signal arrives.
    fn run(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}

//! dbkit: vendor-agnostic relational database access.
//!
//! Connection pooling with reconnection, transactions with savepoints and
//! timeouts, a parameterized query builder with a textual SQL safety layer,
//! batch execution and streaming selects, for PostgreSQL, MySQL and SQLite.
//! The `tools` module wraps these as self-contained operations, which the
//! `dbkit` binary serves over MCP stdio.

pub mod config;
pub mod db;
pub mod error;
pub mod mcp;
pub mod models;
pub mod sql;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use db::{ConnectionManager, TransactionManager};
pub use error::{DbError, DbResult};
pub use mcp::DbService;
pub use tools::{DbOperations, OperationResult};

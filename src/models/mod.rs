//! Data models for dbkit.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

pub use connection::{
    ConnectionConfig, ConnectionConfigError, ConnectionTarget, EmbeddedDescriptor,
    NetworkDescriptor, TransactionState, Vendor, mask_connection_string,
};
pub use query::{
    JsonRow, QueryParam, QueryResult, Statement, StatementKind, StatementOrigin,
};

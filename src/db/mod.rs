//! Database access layer.
//!
//! - `dialect`: per-vendor SQL differences
//! - `pool`: connection manager owning one vendor pool
//! - `executor`: statement execution on a checked-out connection
//! - `transaction`: transactions, savepoints, timeouts and cancellation
//! - `batch`: chunked execution with retry
//! - `stream`: chunked SELECT streaming
//! - `params` / `types`: parameter binding and row decoding

pub mod batch;
pub mod dialect;
pub mod executor;
pub(crate) mod params;
pub mod pool;
pub mod stream;
pub mod transaction;
pub mod types;

pub use batch::{BatchExecutionResult, BatchExecutor, BatchFailure, BatchOptions, BatchProgress};
pub use dialect::{Dialect, dialect_for};
pub use executor::DbConnection;
pub use pool::{ConnectionEvent, ConnectionManager, PoolState, PoolStatus};
pub use stream::{StreamOptions, StreamResult, StreamStats, StreamingExecutor};
pub use transaction::{CancelHandle, Transaction, TransactionManager, TransactionOptions};

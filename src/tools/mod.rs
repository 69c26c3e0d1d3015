//! Operation handlers for external callers.
//!
//! Each operation takes a structured input, opens its own connection manager,
//! executes, closes the manager and reports an [`OperationResult`]. Nothing is
//! pooled across calls.
//!
//! - `query`: `select`
//! - `write`: `insert`, `update`, `delete`
//! - `batch`: `batch_write`
//! - `stream`: `stream_select`
//! - `sql`: `execute_sql`, `check_connection`

pub mod batch;
pub mod query;
pub mod sql;
pub mod stream;
pub mod write;

pub use batch::BatchWriteInput;
pub use query::SelectInput;
pub use sql::{CheckConnectionInput, ConnectionCheck, ExecuteSqlInput};
pub use stream::{StreamSelectInput, StreamSummary};
pub use write::{DeleteInput, InsertInput, UpdateInput, WriteOperation};

use crate::config::OperationDefaults;
use crate::db::{BatchExecutionResult, ConnectionManager};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, JsonRow};
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, Span, info_span, warn};

/// Outcome of one operation, successful or not.
#[derive(Debug, Clone, Default, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<JsonRow>>,
    /// Rows returned, affected or streamed
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_ids: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionCheck>,
}

impl OperationResult {
    pub fn with_rows(rows: Vec<JsonRow>) -> Self {
        Self {
            success: true,
            row_count: rows.len() as u64,
            rows: Some(rows),
            ..Default::default()
        }
    }

    pub fn with_row_count(row_count: u64) -> Self {
        Self {
            success: true,
            row_count,
            ..Default::default()
        }
    }

    pub fn failure(error: &DbError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Entry point for the caller-facing operations.
#[derive(Debug, Clone)]
pub struct DbOperations {
    defaults: OperationDefaults,
    span: Span,
}

impl DbOperations {
    pub fn new(defaults: OperationDefaults) -> Self {
        Self {
            defaults,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn defaults(&self) -> &OperationDefaults {
        &self.defaults
    }

    fn resolve_connection(&self, database: Option<ConnectionConfig>) -> DbResult<ConnectionConfig> {
        database
            .or_else(|| self.defaults.default_connection.clone())
            .ok_or_else(|| {
                DbError::invalid_input(
                    "no database given and no default connection configured (--database / DBKIT_DATABASE)",
                )
            })
    }

    /// Open a manager for `database`, run `op` against it and close it again.
    pub(crate) async fn with_manager<T, F, Fut>(
        &self,
        operation: &'static str,
        database: Option<ConnectionConfig>,
        op: F,
    ) -> DbResult<T>
    where
        F: FnOnce(Arc<ConnectionManager>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let config = self.resolve_connection(database)?;
        let span = info_span!(
            parent: &self.span,
            "operation",
            operation,
            vendor = %config.vendor,
            target = %config.masked_target()
        );
        let manager = Arc::new(
            ConnectionManager::new(config)?
                .with_span(span.clone())
                .with_query_timeout(self.defaults.query_timeout),
        );

        async {
            manager.initialize().await?;
            let result = op(Arc::clone(&manager)).await;
            manager.close().await;
            result
        }
        .instrument(span)
        .await
    }

    /// Turn an operation outcome into the caller-facing result.
    ///
    /// `cascade` only matters for deletes: foreign key failures then point at
    /// ON DELETE CASCADE.
    pub(crate) fn respond(
        operation: &'static str,
        cascade: bool,
        start: Instant,
        outcome: DbResult<OperationResult>,
    ) -> OperationResult {
        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let e = e.classify(operation, cascade);
                warn!(operation, error = %e, "Operation failed");
                OperationResult::failure(&e)
            }
        };
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        result
    }
}

//! Batched structured writes.
//!
//! Operations are split into batches; each batch runs in its own transaction, so
//! a failed batch leaves no partial writes behind.

use crate::db::{BatchExecutor, BatchOptions, BatchProgress, TransactionManager, TransactionOptions};
use crate::error::{DbError, DbResult};
use crate::models::ConnectionConfig;
use crate::tools::write::{WriteOperation, WriteOutcome};
use crate::tools::{DbOperations, OperationResult};
use futures_util::FutureExt;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchWriteInput {
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
    /// Writes to run, in order
    pub operations: Vec<WriteOperation>,
    /// Operations per batch (1-1000)
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Record failed batches and keep going instead of stopping at the first one
    #[serde(default)]
    pub continue_on_error: Option<bool>,
    /// Options for each batch's transaction
    #[serde(default)]
    pub transaction: TransactionOptions,
}

impl BatchWriteInput {
    fn batch_options(&self, defaults: &BatchOptions) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            continue_on_error: self.continue_on_error.unwrap_or(defaults.continue_on_error),
        }
    }
}

/// Writes from batches whose transaction committed.
#[derive(Debug, Default)]
struct Committed {
    rows_affected: u64,
    inserted_ids: Vec<JsonValue>,
}

impl DbOperations {
    pub async fn batch_write(&self, input: BatchWriteInput) -> OperationResult {
        let start = Instant::now();
        let options = match resolve_batch_options(&input, &self.defaults().batch) {
            Ok(options) => options,
            Err(e) => return Self::respond("batch_write", false, start, Err(e)),
        };
        let cascade = input.operations.iter().any(WriteOperation::cascade);
        let transaction_timeout = self.defaults().transaction_timeout;
        let BatchWriteInput {
            database,
            operations,
            transaction,
            ..
        } = input;

        let outcome = self
            .with_manager("batch_write", database, |manager| async move {
                if operations.is_empty() {
                    return Err(DbError::invalid_input(
                        "batch_write requires at least one operation",
                    ));
                }
                let dialect = manager.dialect();
                let transactions = TransactionManager::new(Arc::clone(&manager))
                    .with_default_timeout(transaction_timeout);
                let executor = BatchExecutor::new(options).with_span(manager.span().clone());
                let committed = Mutex::new(Committed::default());
                let progress = |p: &BatchProgress| {
                    debug!(
                        batch = p.batch_index + 1,
                        total_batches = p.total_batches,
                        processed = p.processed_items,
                        failed = p.failed_items,
                        "Batch progress"
                    );
                };

                let report = executor
                    .execute(
                        operations,
                        |_, batch| {
                            let transactions = &transactions;
                            let committed = &committed;
                            let tx_options = transaction.clone();
                            async move {
                                let outcomes = transactions
                                    .with_transaction(tx_options, move |tx| {
                                        async move {
                                            let mut outcomes: Vec<WriteOutcome> =
                                                Vec::with_capacity(batch.len());
                                            for op in &batch {
                                                let statement = op.statement(dialect)?;
                                                let result = tx.execute(&statement).await?;
                                                outcomes.push(op.finish(dialect, result)?);
                                            }
                                            Ok(outcomes)
                                        }
                                        .boxed()
                                    })
                                    .await
                                    .map_err(|e| e.classify("batch_write", cascade))?;

                                let mut committed = committed.lock().await;
                                for outcome in outcomes {
                                    committed.rows_affected += outcome.rows_affected;
                                    committed.inserted_ids.extend(outcome.inserted_ids);
                                }
                                Ok(())
                            }
                        },
                        Some(&progress),
                    )
                    .await?;

                let committed = committed.into_inner();
                info!(
                    operations = report.total_items,
                    batches = report.total_batches,
                    failed = report.failed_items,
                    rows_affected = committed.rows_affected,
                    "Batch write finished"
                );
                Ok(batch_result(report, committed))
            })
            .await;
        Self::respond("batch_write", cascade, start, outcome)
    }
}

fn batch_result(report: crate::db::BatchExecutionResult, committed: Committed) -> OperationResult {
    let error = (report.failed_items > 0).then(|| {
        format!(
            "{} of {} operations failed in {} batch(es)",
            report.failed_items,
            report.total_items,
            report.failures.len()
        )
    });
    OperationResult {
        success: error.is_none(),
        error,
        inserted_ids: (!committed.inserted_ids.is_empty()).then_some(committed.inserted_ids),
        batch: Some(report),
        ..OperationResult::with_row_count(committed.rows_affected)
    }
}

/// Per-call batch options over the configured defaults.
pub(crate) fn resolve_batch_options(
    input: &BatchWriteInput,
    defaults: &BatchOptions,
) -> DbResult<BatchOptions> {
    if input.batch_size == Some(0) {
        return Err(DbError::invalid_input("batchSize must be at least 1"));
    }
    Ok(input.batch_options(defaults))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BatchFailure;

    fn input(json: &str) -> BatchWriteInput {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_input_overrides_defaults() {
        let input = input(
            r#"{"operations": [], "batchSize": 5, "continueOnError": true, "retryDelayMs": 0}"#,
        );
        let options = resolve_batch_options(&input, &BatchOptions::default()).unwrap();
        assert_eq!(options.batch_size, 5);
        assert!(options.continue_on_error);
        assert_eq!(options.retry_delay, Duration::ZERO);
        assert_eq!(options.max_retries, BatchOptions::default().max_retries);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let input = input(r#"{"operations": [], "batchSize": 0}"#);
        assert!(resolve_batch_options(&input, &BatchOptions::default()).is_err());
    }

    #[test]
    fn test_partial_failure_reported() {
        let report = crate::db::BatchExecutionResult {
            total_items: 4,
            processed_items: 4,
            successful_items: 3,
            failed_items: 1,
            total_batches: 4,
            failures: vec![BatchFailure {
                batch_index: 2,
                attempts: 1,
                item_count: 1,
                error: "unique constraint violation".into(),
            }],
            partial_success: true,
            execution_time_ms: 1,
        };
        let result = batch_result(
            report,
            Committed {
                rows_affected: 3,
                inserted_ids: Vec::new(),
            },
        );
        assert!(!result.success);
        assert_eq!(result.row_count, 3);
        assert!(result.error.unwrap().contains("1 of 4 operations failed"));
        assert!(result.batch.unwrap().partial_success);
    }
}

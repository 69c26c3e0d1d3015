//! Batch execution engine.
//!
//! Splits an ordered item list into chunks and runs a caller-supplied operation on
//! each chunk, one batch at a time. Failed batches are retried with a fixed delay;
//! a batch that exhausts its attempts is either recorded (`continue_on_error`) or
//! aborts the run.

use crate::error::{DbError, DbResult};
use schemars::JsonSchema;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{Instrument, Span, debug, info, warn};

/// Upper bound on items per batch.
pub const MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Items per batch, clamped to `1..=MAX_BATCH_SIZE`
    pub batch_size: usize,
    /// Extra attempts after the first failure
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Record exhausted batches and keep going instead of aborting
    pub continue_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            continue_on_error: false,
        }
    }
}

/// Cumulative counts reported after every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch_index: usize,
    pub total_batches: usize,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
}

/// A batch that failed every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub batch_index: usize,
    pub attempts: u32,
    pub item_count: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchExecutionResult {
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub total_batches: usize,
    pub failures: Vec<BatchFailure>,
    pub partial_success: bool,
    pub execution_time_ms: u64,
}

/// Timings from running the same workload item-by-item and batched.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchBenchmark {
    pub item_count: usize,
    pub batch_size: usize,
    pub individual_ms: u64,
    pub batched_ms: u64,
    /// `individual / batched`
    pub speedup: f64,
}

pub type ProgressFn<'a> = &'a (dyn Fn(&BatchProgress) + Send + Sync);

fn clamp_batch_size(size: usize) -> usize {
    size.clamp(1, MAX_BATCH_SIZE)
}

#[derive(Debug, Clone)]
pub struct BatchExecutor {
    options: BatchOptions,
    span: Span,
}

impl BatchExecutor {
    pub fn new(options: BatchOptions) -> Self {
        let batch_size = clamp_batch_size(options.batch_size);
        if batch_size != options.batch_size {
            debug!(requested = options.batch_size, batch_size, "Batch size clamped");
        }
        Self {
            options: BatchOptions {
                batch_size,
                ..options
            },
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Run `op` over `items` in batches.
    ///
    /// `op` receives the batch index and the batch's items. `progress`, when
    /// given, is called after every batch with cumulative counts.
    pub async fn execute<T, F, Fut>(
        &self,
        items: Vec<T>,
        op: F,
        progress: Option<ProgressFn<'_>>,
    ) -> DbResult<BatchExecutionResult>
    where
        T: Clone,
        F: Fn(usize, Vec<T>) -> Fut,
        Fut: Future<Output = DbResult<()>>,
    {
        self.run(items, op, progress)
            .instrument(self.span.clone())
            .await
    }

    async fn run<T, F, Fut>(
        &self,
        items: Vec<T>,
        op: F,
        progress: Option<ProgressFn<'_>>,
    ) -> DbResult<BatchExecutionResult>
    where
        T: Clone,
        F: Fn(usize, Vec<T>) -> Fut,
        Fut: Future<Output = DbResult<()>>,
    {
        let start = Instant::now();
        let total_items = items.len();
        let batches: Vec<Vec<T>> = items
            .chunks(self.options.batch_size)
            .map(<[T]>::to_vec)
            .collect();
        let total_batches = batches.len();
        let max_attempts = self.options.max_retries + 1;

        info!(
            total_items,
            total_batches,
            batch_size = self.options.batch_size,
            "Starting batch execution"
        );

        let mut processed = 0;
        let mut successful = 0;
        let mut failed = 0;
        let mut failures = Vec::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let count = batch.len();
            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match op(index, batch.clone()).await {
                    Ok(()) => break Ok(()),
                    Err(e) if attempt < max_attempts => {
                        warn!(
                            batch_index = index,
                            attempt,
                            max_attempts,
                            error = %e,
                            "Batch failed; retrying"
                        );
                        sleep(self.options.retry_delay).await;
                    }
                    Err(e) => break Err(e),
                }
            };

            processed += count;
            let failure = match outcome {
                Ok(()) => {
                    successful += count;
                    debug!(batch_index = index, items = count, attempts = attempt, "Batch succeeded");
                    None
                }
                Err(e) => {
                    failed += count;
                    warn!(batch_index = index, attempts = attempt, error = %e, "Batch failed");
                    failures.push(BatchFailure {
                        batch_index: index,
                        attempts: attempt,
                        item_count: count,
                        error: e.to_string(),
                    });
                    Some(e)
                }
            };

            if let Some(report) = progress {
                report(&BatchProgress {
                    batch_index: index,
                    total_batches,
                    total_items,
                    processed_items: processed,
                    successful_items: successful,
                    failed_items: failed,
                });
            }

            if let Some(e) = failure {
                if !self.options.continue_on_error {
                    return Err(DbError::batch_failed(index, attempt, e));
                }
            }
        }

        let result = BatchExecutionResult {
            total_items,
            processed_items: processed,
            successful_items: successful,
            failed_items: failed,
            total_batches,
            failures,
            partial_success: successful > 0 && failed > 0,
            execution_time_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            successful = result.successful_items,
            failed = result.failed_items,
            execution_time_ms = result.execution_time_ms,
            "Batch execution finished"
        );
        Ok(result)
    }

    /// Run the workload once item-by-item and once in batches of `batch_size`.
    ///
    /// Both passes run `op` for real, so the workload must be repeatable.
    pub async fn benchmark<T, F, Fut>(
        &self,
        items: Vec<T>,
        batch_size: usize,
        op: F,
    ) -> DbResult<BatchBenchmark>
    where
        T: Clone,
        F: Fn(usize, Vec<T>) -> Fut,
        Fut: Future<Output = DbResult<()>>,
    {
        let batch_size = clamp_batch_size(batch_size);

        let start = Instant::now();
        for (index, item) in items.iter().enumerate() {
            op(index, vec![item.clone()]).await?;
        }
        let individual = start.elapsed();

        let start = Instant::now();
        for (index, chunk) in items.chunks(batch_size).enumerate() {
            op(index, chunk.to_vec()).await?;
        }
        let batched = start.elapsed();

        let speedup = individual.as_secs_f64() / batched.as_secs_f64().max(f64::EPSILON);
        info!(
            items = items.len(),
            batch_size,
            individual_ms = individual.as_millis() as u64,
            batched_ms = batched.as_millis() as u64,
            speedup,
            "Batch benchmark finished"
        );
        Ok(BatchBenchmark {
            item_count: items.len(),
            batch_size,
            individual_ms: individual.as_millis() as u64,
            batched_ms: batched.as_millis() as u64,
            speedup,
        })
    }
}

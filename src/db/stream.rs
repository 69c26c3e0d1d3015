//! Streaming SELECT execution.
//!
//! Rows are pulled from the driver in fixed-size chunks instead of being buffered.
//! Only a small sample of rows is kept for the caller; everything else is counted
//! and dropped.

use crate::db::executor::DbConnection;
use crate::db::pool::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::models::{JsonRow, Statement};
use crate::sql::safety::check_statement;
use futures_util::{FutureExt, StreamExt};
use schemars::JsonSchema;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Span, debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub chunk_size: usize,
    /// Stop reading once this many rows have been streamed.
    /// `Some(0)` runs nothing.
    pub max_rows: Option<usize>,
    /// Rows kept in the result
    pub sample_size: usize,
    /// Re-run the statement buffered and streamed for comparison.
    /// Only safe for idempotent statements.
    pub benchmark: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_rows: None,
            sample_size: DEFAULT_SAMPLE_SIZE,
            benchmark: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    /// Rows read from the driver, not just the sampled ones
    pub streamed_rows: usize,
    pub sampled_rows: usize,
    pub chunk_count: usize,
    /// Reading stopped at the row cap while more rows were available
    pub cancelled_early: bool,
    /// Largest estimated in-memory size of a single chunk
    pub peak_chunk_bytes: u64,
    pub peak_chunk_memory: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamBenchmark {
    pub streaming_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffered_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_streaming_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StreamResult {
    pub rows: Vec<JsonRow>,
    pub stats: StreamStats,
    pub benchmark: Option<StreamBenchmark>,
}

/// Estimated size of a row once decoded, taken as its JSON length.
fn estimate_row_bytes(row: &JsonRow) -> u64 {
    serde_json::to_vec(row).map(|v| v.len() as u64).unwrap_or(0)
}

pub fn format_memory(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::WINDOWS)
}

#[derive(Debug, Default)]
struct Drained {
    sample: Vec<JsonRow>,
    streamed: usize,
    chunks: usize,
    cancelled_early: bool,
    peak_chunk_bytes: u64,
}

async fn drain(
    conn: &mut DbConnection,
    statement: &Statement,
    options: &StreamOptions,
) -> DbResult<Drained> {
    let mut out = Drained::default();
    if options.max_rows == Some(0) {
        return Ok(out);
    }
    let mut chunks = conn.stream_rows(statement).chunks(options.chunk_size);

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.into_iter().collect::<DbResult<Vec<JsonRow>>>()?;
        let read = chunk.len();
        out.chunks += 1;
        out.peak_chunk_bytes = out
            .peak_chunk_bytes
            .max(chunk.iter().map(estimate_row_bytes).sum());

        let remaining = options
            .max_rows
            .map_or(usize::MAX, |cap| cap.saturating_sub(out.streamed));
        for row in chunk.into_iter().take(remaining) {
            out.streamed += 1;
            if out.sample.len() < options.sample_size {
                out.sample.push(row);
            }
        }

        if options.max_rows.is_some_and(|cap| out.streamed >= cap) {
            out.cancelled_early = if read > remaining {
                true
            } else {
                // The chunk ended exactly at the cap; look for one more row
                chunks.get_mut().next().await.transpose()?.is_some()
            };
            break;
        }
    }
    Ok(out)
}

/// Runs SELECT statements as chunked row streams.
#[derive(Debug, Clone)]
pub struct StreamingExecutor {
    manager: Arc<ConnectionManager>,
    span: Span,
}

impl StreamingExecutor {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let span = manager.span().clone();
        Self { manager, span }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        options: StreamOptions,
    ) -> DbResult<StreamResult> {
        if !statement.returns_rows {
            return Err(DbError::invalid_input(
                "streaming requires a row-returning statement",
            ));
        }
        check_statement(statement, self.manager.vendor())?;
        let options = StreamOptions {
            chunk_size: options.chunk_size.max(1),
            ..options
        };

        async {
            let start = Instant::now();
            let drained = self.stream_once(statement, &options).await?;
            let elapsed = start.elapsed();

            let benchmark = if options.benchmark {
                Some(self.benchmark(statement, &options, elapsed).await)
            } else {
                None
            };

            let stats = StreamStats {
                streamed_rows: drained.streamed,
                sampled_rows: drained.sample.len(),
                chunk_count: drained.chunks,
                cancelled_early: drained.cancelled_early,
                peak_chunk_bytes: drained.peak_chunk_bytes,
                peak_chunk_memory: format_memory(drained.peak_chunk_bytes),
                execution_time_ms: elapsed.as_millis() as u64,
            };
            info!(
                streamed_rows = stats.streamed_rows,
                chunks = stats.chunk_count,
                cancelled_early = stats.cancelled_early,
                peak_chunk_memory = %stats.peak_chunk_memory,
                "Streaming select finished"
            );
            Ok(StreamResult {
                rows: drained.sample,
                stats,
                benchmark,
            })
        }
        .instrument(self.span.clone())
        .await
    }

    async fn stream_once(&self, statement: &Statement, options: &StreamOptions) -> DbResult<Drained> {
        let statement = statement.clone();
        let options = options.clone();
        self.manager
            .execute_in_connection(move |conn| {
                async move { drain(conn, &statement, &options).await }.boxed()
            })
            .await
    }

    /// Time a buffered fetch and a second streaming pass against the first pass.
    ///
    /// Failures here are logged and leave the corresponding timing empty.
    async fn benchmark(
        &self,
        statement: &Statement,
        options: &StreamOptions,
        streaming: Duration,
    ) -> StreamBenchmark {
        let start = Instant::now();
        let buffered_ms = match self.manager.execute(statement).await {
            Ok(_) => Some(start.elapsed().as_millis() as u64),
            Err(e) => {
                warn!(error = %e, "Buffered benchmark pass failed");
                None
            }
        };

        let start = Instant::now();
        let repeat_streaming_ms = match self.stream_once(statement, options).await {
            Ok(_) => Some(start.elapsed().as_millis() as u64),
            Err(e) => {
                warn!(error = %e, "Repeat streaming benchmark pass failed");
                None
            }
        };

        debug!(?buffered_ms, ?repeat_streaming_ms, "Streaming benchmark finished");
        StreamBenchmark {
            streaming_ms: streaming.as_millis() as u64,
            buffered_ms,
            repeat_streaming_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_options() {
        let options = StreamOptions::default();
        assert_eq!(options.chunk_size, 100);
        assert_eq!(options.sample_size, 10);
        assert!(options.max_rows.is_none());
        assert!(!options.benchmark);
    }

    #[test]
    fn test_row_size_estimate() {
        let mut row = JsonRow::new();
        row.insert("id".into(), json!(1));
        // {"id":1}
        assert_eq!(estimate_row_bytes(&row), 8);
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512 B");
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let stats = StreamStats {
            streamed_rows: 3,
            sampled_rows: 2,
            chunk_count: 1,
            cancelled_early: false,
            peak_chunk_bytes: 10,
            peak_chunk_memory: format_memory(10),
            execution_time_ms: 0,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["streamedRows"], 3);
        assert_eq!(value["cancelledEarly"], false);
    }
}

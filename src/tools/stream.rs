//! Streaming structured SELECT.

use crate::db::StreamingExecutor;
use crate::db::stream::{StreamBenchmark, StreamOptions};
use crate::db::StreamStats;
use crate::models::ConnectionConfig;
use crate::sql::{SelectQuery, build_select};
use crate::tools::{DbOperations, OperationResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamSelectInput {
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
    #[serde(flatten)]
    pub query: SelectQuery,
    /// Rows fetched per chunk
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Stop after this many rows
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// Rows returned to the caller
    #[serde(default)]
    pub sample_size: Option<usize>,
    /// Also time a buffered run and a second streaming run.
    /// Executes the statement up to two more times.
    #[serde(default)]
    pub benchmark: bool,
}

/// Streaming statistics reported alongside the sampled rows.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    #[serde(flatten)]
    pub stats: StreamStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<StreamBenchmark>,
}

impl StreamSelectInput {
    fn stream_options(&self, defaults: &StreamOptions) -> StreamOptions {
        StreamOptions {
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            max_rows: self.max_rows.or(defaults.max_rows),
            sample_size: self.sample_size.unwrap_or(defaults.sample_size),
            benchmark: self.benchmark,
        }
    }
}

impl DbOperations {
    pub async fn stream_select(&self, input: StreamSelectInput) -> OperationResult {
        let start = Instant::now();
        let options = input.stream_options(&self.defaults().stream);
        let StreamSelectInput {
            database, query, ..
        } = input;

        let outcome = self
            .with_manager("stream_select", database, |manager| async move {
                let statement = build_select(manager.dialect(), &query)?;
                let streamed = StreamingExecutor::new(manager)
                    .execute(&statement, options)
                    .await?;
                Ok(OperationResult {
                    rows: Some(streamed.rows),
                    stream: Some(StreamSummary {
                        stats: streamed.stats.clone(),
                        benchmark: streamed.benchmark,
                    }),
                    ..OperationResult::with_row_count(streamed.stats.streamed_rows as u64)
                })
            })
            .await;
        Self::respond("stream_select", false, start, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_fall_back_to_defaults() {
        let input: StreamSelectInput =
            serde_json::from_str(r#"{"table": "events", "maxRows": 500}"#).unwrap();
        let options = input.stream_options(&StreamOptions::default());
        assert_eq!(options.chunk_size, 100);
        assert_eq!(options.sample_size, 10);
        assert_eq!(options.max_rows, Some(500));
        assert!(!options.benchmark);
    }

    #[test]
    fn test_summary_flattens_stats() {
        let summary = StreamSummary {
            stats: StreamStats {
                streamed_rows: 250,
                sampled_rows: 10,
                chunk_count: 3,
                cancelled_early: true,
                peak_chunk_bytes: 2048,
                peak_chunk_memory: "2 kB".into(),
                execution_time_ms: 4,
            },
            benchmark: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["streamedRows"], 250);
        assert_eq!(json["chunkCount"], 3);
        assert!(json.get("benchmark").is_none());
    }
}

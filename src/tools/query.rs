//! Structured SELECT.

use crate::models::ConnectionConfig;
use crate::sql::{SelectQuery, build_select};
use crate::tools::{DbOperations, OperationResult};
use schemars::JsonSchema;
use serde::Deserialize;
use std::time::Instant;
use tracing::info;

/// Input for the select operation.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SelectInput {
    /// Target database. Falls back to the configured default connection.
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
    #[serde(flatten)]
    pub query: SelectQuery,
}

impl DbOperations {
    pub async fn select(&self, input: SelectInput) -> OperationResult {
        let start = Instant::now();
        let SelectInput { database, query } = input;

        let outcome = self
            .with_manager("select", database, |manager| async move {
                let statement = build_select(manager.dialect(), &query)?;
                let result = manager.execute(&statement).await?;
                info!(
                    table = %query.table,
                    rows = result.row_count(),
                    execution_time_ms = result.execution_time_ms,
                    "Select executed"
                );
                Ok(OperationResult::with_rows(result.rows))
            })
            .await;
        Self::respond("select", false, start, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Operator, SortDirection};

    #[test]
    fn test_select_input_flattens_query() {
        let json = r#"{
            "database": {"vendor": "sqlite", "connection": {"path": ":memory:"}},
            "table": "users",
            "columns": ["id", "name"],
            "where": [{"column": "status", "operator": "eq", "value": "active"}],
            "orderBy": [{"column": "id", "direction": "desc"}],
            "limit": 10
        }"#;
        let input: SelectInput = serde_json::from_str(json).unwrap();
        assert!(input.database.is_some());
        assert_eq!(input.query.table, "users");
        assert_eq!(input.query.conditions[0].operator, Operator::Eq);
        assert_eq!(input.query.order_by[0].direction, SortDirection::Desc);
        assert_eq!(input.query.limit, Some(10));
    }

    #[test]
    fn test_database_is_optional() {
        let input: SelectInput = serde_json::from_str(r#"{"table": "users"}"#).unwrap();
        assert!(input.database.is_none());
        assert!(input.query.columns.is_none());
    }

    #[tokio::test]
    async fn test_select_on_empty_memory_database_fails_cleanly() {
        let ops = DbOperations::new(Default::default());
        let result = ops
            .select(SelectInput {
                database: Some(ConnectionConfig::sqlite_memory()),
                query: SelectQuery::table("missing"),
            })
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("select failed"));
    }
}

//! Raw SQL and connection checks.

use crate::db::PoolStatus;
use crate::models::{ConnectionConfig, QueryParam, Statement, Vendor};
use crate::tools::{DbOperations, OperationResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Instant;
use tracing::info;

/// Input for execute_sql.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteSqlInput {
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
    /// A single statement. DDL (CREATE, DROP, ALTER, TRUNCATE) is rejected.
    pub sql: String,
    /// Positional parameters for the statement's placeholders ($1 or ?).
    /// Required for INSERT, UPDATE and DELETE.
    #[serde(default)]
    pub params: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct CheckConnectionInput {
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
}

/// Health report for one database.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCheck {
    pub vendor: Vendor,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub pool: PoolStatus,
}

impl DbOperations {
    /// Run caller-written SQL through the full safety layer.
    pub async fn execute_sql(&self, input: ExecuteSqlInput) -> OperationResult {
        let start = Instant::now();
        let ExecuteSqlInput {
            database,
            sql,
            params,
        } = input;

        let outcome = self
            .with_manager("execute_sql", database, |manager| async move {
                let params = params.iter().map(QueryParam::from_json).collect();
                let statement = Statement::raw(sql, params, manager.vendor());
                let result = manager.execute(&statement).await?;
                info!(
                    returns_rows = statement.returns_rows,
                    rows = result.row_count(),
                    rows_affected = result.rows_affected,
                    "Raw SQL executed"
                );
                if statement.returns_rows {
                    return Ok(OperationResult::with_rows(result.rows));
                }
                Ok(OperationResult {
                    inserted_ids: result.last_insert_id.map(|id| vec![JsonValue::from(id)]),
                    ..OperationResult::with_row_count(result.rows_affected)
                })
            })
            .await;
        Self::respond("execute_sql", false, start, outcome)
    }

    /// Connect, ping and report the server version and pool state.
    pub async fn check_connection(&self, input: CheckConnectionInput) -> OperationResult {
        let start = Instant::now();
        let outcome = self
            .with_manager("check_connection", input.database, |manager| async move {
                let healthy = manager.is_healthy().await;
                let server_version = manager.server_version().await.ok();
                let check = ConnectionCheck {
                    vendor: manager.vendor(),
                    healthy,
                    server_version,
                    pool: manager.pool_status().await,
                };
                Ok(OperationResult {
                    success: healthy,
                    error: (!healthy).then(|| "health check query failed".to_string()),
                    connection: Some(check),
                    ..Default::default()
                })
            })
            .await;
        Self::respond("check_connection", false, start, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Option<ConnectionConfig> {
        Some(ConnectionConfig::sqlite_memory())
    }

    #[tokio::test]
    async fn test_check_connection_sqlite_memory() {
        let ops = DbOperations::new(Default::default());
        let result = ops
            .check_connection(CheckConnectionInput { database: memory() })
            .await;
        assert!(result.success);
        let check = result.connection.unwrap();
        assert_eq!(check.vendor, Vendor::SQLite);
        assert!(check.server_version.is_some());
    }

    #[tokio::test]
    async fn test_execute_sql_select_literal() {
        let ops = DbOperations::new(Default::default());
        let result = ops
            .execute_sql(ExecuteSqlInput {
                database: memory(),
                sql: "SELECT 1 AS one".into(),
                params: Vec::new(),
            })
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.rows.unwrap()[0]["one"], 1);
    }

    #[tokio::test]
    async fn test_execute_sql_rejects_ddl() {
        let ops = DbOperations::new(Default::default());
        let result = ops
            .execute_sql(ExecuteSqlInput {
                database: memory(),
                sql: "DROP TABLE users".into(),
                params: Vec::new(),
            })
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("DROP"));
    }

    #[tokio::test]
    async fn test_execute_sql_requires_params_for_writes() {
        let ops = DbOperations::new(Default::default());
        let result = ops
            .execute_sql(ExecuteSqlInput {
                database: memory(),
                sql: "DELETE FROM users WHERE id = 1".into(),
                params: Vec::new(),
            })
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}

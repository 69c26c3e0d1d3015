//! Structured INSERT, UPDATE and DELETE.
//!
//! [`WriteOperation`] is shared with `batch_write`, so a write behaves the same
//! whether it runs alone or inside a batch transaction.

use crate::db::Dialect;
use crate::error::DbResult;
use crate::models::{ConnectionConfig, JsonRow, QueryResult, Statement};
use crate::sql::{
    DeleteQuery, InsertQuery, ReturningMode, UpdateQuery, build_delete, build_insert, build_update,
};
use crate::tools::{DbOperations, OperationResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Instant;
use tracing::info;

/// One structured write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriteOperation {
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

/// What a write produced, before it is shaped into an [`OperationResult`].
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct WriteOutcome {
    pub rows_affected: u64,
    pub rows: Option<Vec<JsonRow>>,
    pub inserted_ids: Vec<JsonValue>,
}

impl From<WriteOutcome> for OperationResult {
    fn from(outcome: WriteOutcome) -> Self {
        Self {
            rows: outcome.rows,
            inserted_ids: (!outcome.inserted_ids.is_empty()).then_some(outcome.inserted_ids),
            ..OperationResult::with_row_count(outcome.rows_affected)
        }
    }
}

impl WriteOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Insert(q) => &q.table,
            Self::Update(q) => &q.table,
            Self::Delete(q) => &q.table,
        }
    }

    /// Whether foreign key failures should be reported with cascade guidance.
    pub fn cascade(&self) -> bool {
        matches!(self, Self::Delete(q) if q.cascade)
    }

    pub fn statement(&self, dialect: &dyn Dialect) -> DbResult<Statement> {
        match self {
            Self::Insert(q) => build_insert(dialect, q),
            Self::Update(q) => build_update(dialect, q),
            Self::Delete(q) => build_delete(dialect, q),
        }
    }

    /// Interpret the driver result. An UPDATE under an optimistic lock that
    /// matched nothing is an error.
    pub(crate) fn finish(&self, dialect: &dyn Dialect, result: QueryResult) -> DbResult<WriteOutcome> {
        match self {
            Self::Insert(q) => {
                let inserted_ids = q.inserted_ids(dialect, &result);
                let rows_affected = result.rows_affected;
                let rows = (q.returning == ReturningMode::Row && !result.rows.is_empty())
                    .then_some(result.rows);
                Ok(WriteOutcome {
                    rows_affected,
                    rows,
                    inserted_ids,
                })
            }
            Self::Update(q) => {
                if result.rows_affected == 0 {
                    if let Some(stale) = q.stale_version_error() {
                        return Err(stale);
                    }
                }
                Ok(WriteOutcome {
                    rows_affected: result.rows_affected,
                    ..Default::default()
                })
            }
            Self::Delete(_) => Ok(WriteOutcome {
                rows_affected: result.rows_affected,
                ..Default::default()
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct InsertInput {
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
    #[serde(flatten)]
    pub query: InsertQuery,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateInput {
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
    #[serde(flatten)]
    pub query: UpdateQuery,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteInput {
    #[serde(default)]
    pub database: Option<ConnectionConfig>,
    #[serde(flatten)]
    pub query: DeleteQuery,
}

impl DbOperations {
    pub async fn insert(&self, input: InsertInput) -> OperationResult {
        self.write(input.database, WriteOperation::Insert(input.query))
            .await
    }

    pub async fn update(&self, input: UpdateInput) -> OperationResult {
        self.write(input.database, WriteOperation::Update(input.query))
            .await
    }

    pub async fn delete(&self, input: DeleteInput) -> OperationResult {
        self.write(input.database, WriteOperation::Delete(input.query))
            .await
    }

    async fn write(
        &self,
        database: Option<ConnectionConfig>,
        operation: WriteOperation,
    ) -> OperationResult {
        let start = Instant::now();
        let name = operation.name();
        let cascade = operation.cascade();

        let outcome = self
            .with_manager(name, database, |manager| async move {
                let statement = operation.statement(manager.dialect())?;
                let result = manager.execute(&statement).await?;
                let outcome = operation.finish(manager.dialect(), result)?;
                info!(
                    operation = name,
                    table = %operation.table(),
                    rows_affected = outcome.rows_affected,
                    "Write executed"
                );
                Ok(OperationResult::from(outcome))
            })
            .await;
        Self::respond(name, cascade, start, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect_for;
    use crate::error::DbError;
    use crate::models::Vendor;
    use crate::sql::{OptimisticLock, WhereCondition};
    use serde_json::json;

    fn row(value: JsonValue) -> JsonRow {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_write_operation_tagged_by_type() {
        let json = r#"[
            {"type": "insert", "table": "users", "values": {"name": "Ada"}},
            {"type": "update", "table": "users", "set": {"name": "Grace"},
             "where": [{"column": "id", "operator": "eq", "value": 1}]},
            {"type": "delete", "table": "users", "cascade": true,
             "where": [{"column": "id", "operator": "eq", "value": 2}]}
        ]"#;
        let ops: Vec<WriteOperation> = serde_json::from_str(json).unwrap();
        assert_eq!(ops[0].name(), "insert");
        assert_eq!(ops[1].name(), "update");
        assert!(ops[2].cascade());
        assert!(!ops[1].cascade());
    }

    #[test]
    fn test_stale_optimistic_lock_is_an_error() {
        let mut query = UpdateQuery::new("accounts", row(json!({"balance": 10})))
            .filter(WhereCondition::eq("id", 1).unwrap());
        query.optimistic_lock = Some(OptimisticLock {
            version_column: "version".into(),
            expected_version: json!(3),
        });
        let op = WriteOperation::Update(query);
        let err = op
            .finish(dialect_for(Vendor::PostgreSQL), QueryResult::write_result(0, None))
            .unwrap_err();
        assert!(matches!(err, DbError::OptimisticLock { .. }));
        assert!(err.to_string().contains("optimistic lock check failed"));
    }

    #[test]
    fn test_plain_update_matching_nothing_succeeds() {
        let query = UpdateQuery::new("accounts", row(json!({"balance": 10})))
            .filter(WhereCondition::eq("id", 1).unwrap());
        let outcome = WriteOperation::Update(query)
            .finish(dialect_for(Vendor::MySQL), QueryResult::write_result(0, None))
            .unwrap();
        assert_eq!(outcome.rows_affected, 0);
    }

    #[test]
    fn test_insert_ids_from_driver() {
        let query = InsertQuery::new(
            "users",
            crate::sql::InsertValues::Many(vec![
                row(json!({"name": "a"})),
                row(json!({"name": "b"})),
            ]),
        );
        let outcome = WriteOperation::Insert(query)
            .finish(dialect_for(Vendor::MySQL), QueryResult::write_result(2, Some(7)))
            .unwrap();
        assert_eq!(outcome.inserted_ids, vec![json!(7), json!(8)]);
        let result = OperationResult::from(outcome);
        assert!(result.success);
        assert_eq!(result.row_count, 2);
        assert!(result.rows.is_none());
    }

    #[tokio::test]
    async fn test_unguarded_update_rejected_before_execution() {
        let ops = DbOperations::new(Default::default());
        let result = ops
            .update(UpdateInput {
                database: Some(ConnectionConfig::sqlite_memory()),
                query: UpdateQuery::new("users", row(json!({"status": "inactive"}))),
            })
            .await;
        assert!(!result.success);
        assert_eq!(result.row_count, 0);
        assert!(result.error.unwrap().contains("WHERE conditions are required"));
    }
}

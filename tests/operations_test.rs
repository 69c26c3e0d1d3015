//! End-to-end tests of the caller-facing operations against SQLite files.

mod common;

use common::TestDb;
use dbkit::sql::{
    DeleteQuery, InsertQuery, InsertValues, OptimisticLock, ReturningMode, SelectQuery,
    SoftDelete, SoftDeleteMode, UpdateQuery, WhereCondition,
};
use dbkit::tools::{
    BatchWriteInput, DeleteInput, ExecuteSqlInput, InsertInput, SelectInput, StreamSelectInput,
    UpdateInput, WriteOperation,
};
use dbkit::models::JsonRow;
use serde_json::{Value, json};

fn row(value: Value) -> JsonRow {
    value.as_object().cloned().unwrap()
}

async fn insert_users(db: &TestDb, names: &[&str]) {
    let rows = names.iter().map(|n| row(json!({ "name": n }))).collect();
    let result = db
        .operations()
        .insert(InsertInput {
            database: None,
            query: InsertQuery::new("users", InsertValues::Many(rows)),
        })
        .await;
    assert!(result.success, "{:?}", result.error);
}

#[tokio::test]
async fn test_insert_returning_id() {
    let db = TestDb::users().await;
    let result = db
        .operations()
        .insert(InsertInput {
            database: None,
            query: InsertQuery::new("users", InsertValues::One(row(json!({"name": "Ada"}))))
                .returning(ReturningMode::Id),
        })
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.inserted_ids, Some(vec![json!(1)]));
}

#[tokio::test]
async fn test_multi_row_insert_reports_driver_ids() {
    let db = TestDb::users().await;
    insert_users(&db, &["seed"]).await;

    let result = db
        .operations()
        .insert(InsertInput {
            database: None,
            query: InsertQuery::new(
                "users",
                InsertValues::Many(vec![row(json!({"name": "a"})), row(json!({"name": "b"}))]),
            ),
        })
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 2);
    assert_eq!(result.inserted_ids, Some(vec![json!(2), json!(3)]));
}

#[tokio::test]
async fn test_unguarded_update_is_refused() {
    let db = TestDb::users().await;
    insert_users(&db, &["Ada", "Grace"]).await;

    let result = db
        .operations()
        .update(UpdateInput {
            database: None,
            query: UpdateQuery::new("users", row(json!({"status": "inactive"}))),
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.row_count, 0);
    assert!(result.error.unwrap().contains("WHERE conditions are required"));
}

#[tokio::test]
async fn test_full_table_update_when_allowed() {
    let db = TestDb::users().await;
    insert_users(&db, &["Ada", "Grace"]).await;

    let mut query = UpdateQuery::new("users", row(json!({"status": "inactive"})));
    query.allow_full_table_update = true;
    let result = db
        .operations()
        .update(UpdateInput {
            database: None,
            query,
        })
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 2);
}

#[tokio::test]
async fn test_cascade_delete_reports_foreign_key_guidance() {
    let db = TestDb::users().await;
    insert_users(&db, &["Ada"]).await;
    let seeded = db
        .operations()
        .execute_sql(ExecuteSqlInput {
            database: None,
            sql: "INSERT INTO sessions (user_id, token) VALUES (?, ?)".into(),
            params: vec![json!(1), json!("abc")],
        })
        .await;
    assert!(seeded.success, "{:?}", seeded.error);

    let mut query = DeleteQuery::new("users").filter(WhereCondition::eq("id", 1).unwrap());
    query.cascade = true;
    let result = db
        .operations()
        .delete(DeleteInput {
            database: None,
            query,
        })
        .await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("foreign key constraint violation"), "{error}");
    assert!(error.contains("ON DELETE CASCADE"), "{error}");
}

#[tokio::test]
async fn test_unique_violation_message() {
    let db = TestDb::users().await;
    let insert = |email: &'static str| InsertInput {
        database: None,
        query: InsertQuery::new(
            "users",
            InsertValues::One(row(json!({"name": "x", "email": email}))),
        ),
    };
    let ops = db.operations();
    assert!(ops.insert(insert("a@example.com")).await.success);

    let result = ops.insert(insert("a@example.com")).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("unique constraint violation"));
}

#[tokio::test]
async fn test_optimistic_lock() {
    let db = TestDb::users().await;
    insert_users(&db, &["Ada"]).await;
    let ops = db.operations();

    let update = |expected: i64| {
        let mut query = UpdateQuery::new("users", row(json!({"name": "Ada L."})))
            .filter(WhereCondition::eq("id", 1).unwrap());
        query.optimistic_lock = Some(OptimisticLock {
            version_column: "version".into(),
            expected_version: json!(expected),
        });
        UpdateInput {
            database: None,
            query,
        }
    };

    let first = ops.update(update(1)).await;
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.row_count, 1);

    // The version is now 2, so expecting 1 again is stale
    let stale = ops.update(update(1)).await;
    assert!(!stale.success);
    assert!(stale.error.unwrap().contains("optimistic lock check failed"));
}

#[tokio::test]
async fn test_soft_delete_marks_rows() {
    let db = TestDb::users().await;
    insert_users(&db, &["Ada", "Grace"]).await;
    let ops = db.operations();

    let mut query = DeleteQuery::new("users").filter(WhereCondition::eq("name", "Ada").unwrap());
    query.soft_delete = Some(SoftDelete {
        column: "deleted_at".into(),
        mode: SoftDeleteMode::Timestamp,
    });
    let result = ops
        .delete(DeleteInput {
            database: None,
            query,
        })
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 1);

    let mut select = SelectQuery::table("users");
    select.conditions = vec![WhereCondition::is_null("deleted_at").unwrap()];
    let remaining = ops
        .select(SelectInput {
            database: None,
            query: select,
        })
        .await;
    let rows = remaining.rows.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "Grace");
}

#[tokio::test]
async fn test_select_with_in_order_and_limit() {
    let db = TestDb::users().await;
    insert_users(&db, &["a", "b", "c", "d"]).await;

    let mut query = SelectQuery::table("users");
    query.columns = Some(vec!["name".into()]);
    query.conditions = vec![
        WhereCondition::new(
            "name",
            dbkit::sql::Operator::In,
            Some(json!(["a", "c", "d"])),
        )
        .unwrap(),
    ];
    query.order_by = vec![dbkit::sql::OrderBy {
        column: "name".into(),
        direction: dbkit::sql::SortDirection::Desc,
    }];
    query.limit = Some(2);

    let result = db
        .operations()
        .select(SelectInput {
            database: None,
            query,
        })
        .await;
    assert!(result.success, "{:?}", result.error);
    let names: Vec<&Value> = result.rows.as_ref().unwrap().iter().map(|r| &r["name"]).collect();
    assert_eq!(names, vec![&json!("d"), &json!("c")]);
}

#[tokio::test]
async fn test_batched_updates_with_batch_size_one() {
    let db = TestDb::users().await;
    insert_users(&db, &["Ada", "Grace"]).await;

    let operations = (1..=2)
        .map(|id| {
            WriteOperation::Update(
                UpdateQuery::new("users", row(json!({"status": "inactive"})))
                    .filter(WhereCondition::eq("id", id).unwrap()),
            )
        })
        .collect();
    let input = BatchWriteInput {
        database: None,
        operations,
        batch_size: Some(1),
        max_retries: Some(0),
        retry_delay_ms: Some(0),
        continue_on_error: None,
        transaction: Default::default(),
    };

    let result = db.operations().batch_write(input).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 2);
    let batch = result.batch.unwrap();
    assert_eq!(batch.total_items, 2);
    assert_eq!(batch.total_batches, 2);
    assert_eq!(batch.failed_items, 0);
}

#[tokio::test]
async fn test_batch_continue_on_error_keeps_good_batches() {
    let db = TestDb::users().await;
    let insert = |email: &str| {
        WriteOperation::Insert(InsertQuery::new(
            "users",
            InsertValues::One(row(json!({"name": "x", "email": email}))),
        ))
    };
    let input = BatchWriteInput {
        database: None,
        operations: vec![insert("a@x"), insert("a@x"), insert("b@x")],
        batch_size: Some(1),
        max_retries: Some(1),
        retry_delay_ms: Some(0),
        continue_on_error: Some(true),
        transaction: Default::default(),
    };

    let result = db.operations().batch_write(input).await;
    assert!(!result.success);
    assert_eq!(result.row_count, 2);
    let batch = result.batch.unwrap();
    assert_eq!(batch.successful_items + batch.failed_items, batch.total_items);
    assert_eq!(batch.failed_items, 1);
    assert!(batch.partial_success);
    assert_eq!(batch.failures[0].batch_index, 1);
    assert_eq!(batch.failures[0].attempts, 2);
    assert!(batch.failures[0].error.contains("unique constraint violation"));
}

#[tokio::test]
async fn test_batch_abort_rolls_back_failing_batch() {
    let db = TestDb::users().await;
    let insert = |email: &str| {
        WriteOperation::Insert(InsertQuery::new(
            "users",
            InsertValues::One(row(json!({"name": "x", "email": email}))),
        ))
    };
    let input = BatchWriteInput {
        database: None,
        // Second batch holds a good row and a duplicate
        operations: vec![insert("a@x"), insert("b@x"), insert("a@x"), insert("c@x")],
        batch_size: Some(2),
        max_retries: Some(0),
        retry_delay_ms: Some(0),
        continue_on_error: Some(false),
        transaction: Default::default(),
    };

    let ops = db.operations();
    let result = ops.batch_write(input).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("Batch 1 failed"));

    let count = ops
        .execute_sql(ExecuteSqlInput {
            database: None,
            sql: "SELECT COUNT(*) AS n FROM users".into(),
            params: Vec::new(),
        })
        .await;
    assert_eq!(count.rows.unwrap()[0]["n"], 2);
}

#[tokio::test]
async fn test_stream_select_caps_rows_and_samples() {
    let db = TestDb::users().await;
    let names: Vec<String> = (0..25).map(|i| format!("user{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    insert_users(&db, &refs).await;

    let input = StreamSelectInput {
        database: None,
        query: SelectQuery::table("users"),
        chunk_size: Some(4),
        max_rows: Some(10),
        sample_size: Some(3),
        benchmark: false,
    };
    let result = db.operations().stream_select(input).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.rows.unwrap().len(), 3);
    assert_eq!(result.row_count, 10);
    let stats = result.stream.unwrap().stats;
    assert_eq!(stats.streamed_rows, 10);
    assert_eq!(stats.chunk_count, 3);
    assert!(stats.cancelled_early);
    assert!(stats.peak_chunk_bytes > 0);
}

async fn stream_users(db: &TestDb, chunk_size: usize, max_rows: usize) -> dbkit::db::StreamStats {
    let input = StreamSelectInput {
        database: None,
        query: SelectQuery::table("users"),
        chunk_size: Some(chunk_size),
        max_rows: Some(max_rows),
        sample_size: Some(2),
        benchmark: false,
    };
    let result = db.operations().stream_select(input).await;
    assert!(result.success, "{:?}", result.error);
    result.stream.unwrap().stats
}

#[tokio::test]
async fn test_stream_select_cap_on_chunk_boundary() {
    let db = TestDb::users().await;
    let names: Vec<String> = (0..8).map(|i| format!("user{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    insert_users(&db, &refs).await;

    // Cap equals the row count and a full chunk ends the result
    let stats = stream_users(&db, 4, 8).await;
    assert_eq!(stats.streamed_rows, 8);
    assert!(!stats.cancelled_early);

    // Cap equals the row count with a short final chunk
    let stats = stream_users(&db, 3, 8).await;
    assert_eq!(stats.streamed_rows, 8);
    assert!(!stats.cancelled_early);

    // Cap lands on a chunk boundary with rows left over
    let stats = stream_users(&db, 4, 4).await;
    assert_eq!(stats.streamed_rows, 4);
    assert_eq!(stats.chunk_count, 1);
    assert!(stats.cancelled_early);
}

#[tokio::test]
async fn test_stream_select_zero_cap_reads_nothing() {
    let db = TestDb::users().await;
    insert_users(&db, &["a", "b"]).await;

    let stats = stream_users(&db, 4, 0).await;
    assert_eq!(stats.streamed_rows, 0);
    assert_eq!(stats.sampled_rows, 0);
    assert_eq!(stats.chunk_count, 0);
    assert!(!stats.cancelled_early);
}

#[tokio::test]
async fn test_stream_select_full_scan_with_benchmark() {
    let db = TestDb::users().await;
    insert_users(&db, &["a", "b", "c"]).await;

    let input = StreamSelectInput {
        database: None,
        query: SelectQuery::table("users"),
        chunk_size: Some(2),
        max_rows: None,
        sample_size: Some(10),
        benchmark: true,
    };
    let result = db.operations().stream_select(input).await;
    assert!(result.success, "{:?}", result.error);
    let summary = result.stream.unwrap();
    assert_eq!(summary.stats.streamed_rows, 3);
    assert_eq!(summary.stats.chunk_count, 2);
    assert!(!summary.stats.cancelled_early);
    let benchmark = summary.benchmark.unwrap();
    assert!(benchmark.buffered_ms.is_some());
    assert!(benchmark.repeat_streaming_ms.is_some());
}

#[tokio::test]
async fn test_execute_sql_hides_driver_details() {
    let db = TestDb::users().await;
    let result = db
        .operations()
        .execute_sql(ExecuteSqlInput {
            database: None,
            sql: "SELECT secret_column FROM users".into(),
            params: Vec::new(),
        })
        .await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("see logs"));
    assert!(!error.contains("secret_column"));
}

//! Integration tests for the connection manager and transactions on SQLite files.

mod common;

use common::{TestDb, USERS_SCHEMA};
use dbkit::db::dialect::IsolationLevel;
use dbkit::db::{ConnectionManager, PoolState, TransactionManager, TransactionOptions};
use dbkit::error::DbError;
use dbkit::models::{QueryParam, Statement, TransactionState, Vendor};
use futures_util::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn insert_user(name: &str) -> Statement {
    Statement::raw(
        "INSERT INTO users (name) VALUES (?)",
        vec![QueryParam::String(name.to_string())],
        Vendor::SQLite,
    )
}

fn count_users() -> Statement {
    Statement::raw("SELECT COUNT(*) AS n FROM users", Vec::new(), Vendor::SQLite)
}

async fn open(db: &TestDb) -> Arc<ConnectionManager> {
    let manager = Arc::new(ConnectionManager::new(db.config()).unwrap());
    manager.initialize().await.unwrap();
    manager
}

async fn user_count(manager: &ConnectionManager) -> i64 {
    let result = manager.execute(&count_users()).await.unwrap();
    result.rows[0]["n"].as_i64().unwrap()
}

#[tokio::test]
async fn test_execute_before_initialize_fails_without_io() {
    let db = TestDb::users().await;
    let manager = ConnectionManager::new(db.config()).unwrap();
    let err = manager.execute(&count_users()).await.unwrap_err();
    assert!(matches!(err, DbError::NotInitialized));
    assert_eq!(manager.pool_status().await.state, PoolState::Uninitialized);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    assert!(manager.is_healthy().await);

    manager.close().await;
    manager.close().await;

    assert!(!manager.is_healthy().await);
    assert_eq!(manager.pool_status().await.state, PoolState::Closed);
    let err = manager.execute(&count_users()).await.unwrap_err();
    assert!(matches!(err, DbError::NotInitialized));
}

#[tokio::test]
async fn test_commit_persists() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let mut tx = transactions.begin(TransactionOptions::default()).await.unwrap();
    assert!(tx.id().starts_with("tx_"));
    assert_eq!(tx.state(), TransactionState::Active);
    tx.execute(&insert_user("Ada")).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);

    assert_eq!(user_count(&manager).await, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_commit_after_rollback_is_noop() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let mut tx = transactions.begin(TransactionOptions::default()).await.unwrap();
    tx.execute(&insert_user("Ada")).await.unwrap();
    tx.rollback().await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);

    // A finished transaction rejects further work
    assert!(tx.execute(&insert_user("Grace")).await.is_err());
    assert!(tx.create_savepoint(None).await.is_err());

    assert_eq!(user_count(&manager).await, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_with_transaction_rolls_back_on_error() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let result: Result<(), DbError> = transactions
        .with_transaction(TransactionOptions::default(), |tx| {
            async move {
                tx.execute(&insert_user("Ada")).await?;
                Err(DbError::invalid_input("caller changed its mind"))
            }
            .boxed()
        })
        .await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert_eq!(user_count(&manager).await, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_savepoint_rolls_back_only_inner_work() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    transactions
        .with_transaction(TransactionOptions::default(), |tx| {
            async move {
                tx.execute(&insert_user("outer")).await?;
                let inner: Result<(), DbError> = tx
                    .with_savepoint(|tx| {
                        async move {
                            tx.execute(&insert_user("inner")).await?;
                            Err(DbError::invalid_input("inner failure"))
                        }
                        .boxed()
                    })
                    .await;
                assert!(inner.is_err());
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(user_count(&manager).await, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_named_savepoints() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let mut tx = transactions.begin(TransactionOptions::default()).await.unwrap();
    let auto = tx.create_savepoint(None).await.unwrap();
    assert_eq!(auto, "sp_1");
    tx.execute(&insert_user("kept")).await.unwrap();
    let named = tx.create_savepoint(Some("before_bulk")).await.unwrap();
    tx.execute(&insert_user("dropped")).await.unwrap();
    tx.rollback_to_savepoint(&named).await.unwrap();
    tx.release_savepoint(&auto).await.unwrap();
    assert!(tx.create_savepoint(Some("bad name; DROP")).await.is_err());
    tx.commit().await.unwrap();

    assert_eq!(user_count(&manager).await, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_cancel_rejects_execute_and_forces_rollback() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let mut tx = transactions.begin(TransactionOptions::default()).await.unwrap();
    tx.execute(&insert_user("Ada")).await.unwrap();
    tx.cancel("user pressed stop");

    let err = tx.execute(&insert_user("Grace")).await.unwrap_err();
    assert!(err.to_string().contains("user pressed stop"));
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));
    assert_eq!(tx.state(), TransactionState::RolledBack);

    assert_eq!(user_count(&manager).await, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_transaction_timeout() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let options = TransactionOptions::default().timeout(Duration::from_millis(50));
    let started = Instant::now();
    let result: Result<(), DbError> = transactions
        .with_transaction(options, |tx| {
            async move {
                tx.execute(&insert_user("slow")).await?;
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(())
            }
            .boxed()
        })
        .await;

    assert!(matches!(result, Err(DbError::Timeout { .. })));
    // The unit of work is abandoned, not waited for
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert_eq!(user_count(&manager).await, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_statement_timeout_cancels_transaction() {
    let db = TestDb::users().await;
    let manager = Arc::new(
        ConnectionManager::new(db.config())
            .unwrap()
            .with_query_timeout(Duration::from_millis(50)),
    );
    manager.initialize().await.unwrap();
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let mut tx = transactions.begin(TransactionOptions::default()).await.unwrap();
    tx.execute(&insert_user("Ada")).await.unwrap();

    let slow = Statement::raw(
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100000000) \
         SELECT COUNT(*) AS n FROM c",
        Vec::new(),
        Vendor::SQLite,
    );
    let err = tx.execute(&slow).await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));

    // The connection is in an unknown state, so nothing else may run on it
    assert!(tx.execute(&insert_user("Grace")).await.is_err());
    assert!(tx.create_savepoint(None).await.is_err());
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));
    assert_eq!(tx.state(), TransactionState::RolledBack);

    let count = manager.execute(&count_users()).await.unwrap();
    assert_eq!(count.rows[0]["n"], 0);
    manager.close().await;
}

#[tokio::test]
async fn test_read_uncommitted_on_sqlite() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let options = TransactionOptions::default().isolation(IsolationLevel::ReadUncommitted);
    transactions
        .with_transaction(options, |tx| {
            async move {
                tx.execute(&insert_user("Ada")).await?;
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

    // The pragma is restored on the pooled connection
    let pragma = Statement::raw("PRAGMA read_uncommitted", Vec::new(), Vendor::SQLite);
    let result = manager.execute(&pragma).await.unwrap();
    assert_eq!(result.rows[0]["read_uncommitted"], 0);
    manager.close().await;
}

#[tokio::test]
async fn test_dropped_transaction_is_rolled_back() {
    let db = TestDb::users().await;
    let manager = open(&db).await;
    let transactions = TransactionManager::new(Arc::clone(&manager));

    {
        let mut tx = transactions.begin(TransactionOptions::default()).await.unwrap();
        tx.execute(&insert_user("abandoned")).await.unwrap();
    }
    // Give the spawned rollback a moment to return the connection
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(user_count(&manager).await, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_ddl_rejected_by_manager() {
    let db = TestDb::with_schema(USERS_SCHEMA).await;
    let manager = open(&db).await;
    let ddl = Statement::raw("DROP TABLE users", Vec::new(), Vendor::SQLite);
    let err = manager.execute(&ddl).await.unwrap_err();
    assert!(matches!(err, DbError::UnsafeSql { .. }));
    assert_eq!(user_count(&manager).await, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_postgres_transaction_roundtrip() {
    let url = match std::env::var("TEST_POSTGRES_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_POSTGRES_URL not set");
            return;
        }
    };
    let config = dbkit::models::ConnectionConfig::from_url(url).unwrap();
    let manager = Arc::new(ConnectionManager::new(config).unwrap());
    manager.initialize().await.unwrap();
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let options = TransactionOptions::default().isolation(IsolationLevel::Serializable);
    let one = transactions
        .with_transaction(options, |tx| {
            async move {
                let select = Statement::raw("SELECT 1 AS one", Vec::new(), Vendor::PostgreSQL);
                let result = tx.execute(&select).await?;
                Ok(result.rows[0]["one"].clone())
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(one, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_mysql_transaction_roundtrip() {
    let url = match std::env::var("TEST_MYSQL_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_MYSQL_URL not set");
            return;
        }
    };
    let config = dbkit::models::ConnectionConfig::from_url(url).unwrap();
    let manager = Arc::new(ConnectionManager::new(config).unwrap());
    manager.initialize().await.unwrap();
    let transactions = TransactionManager::new(Arc::clone(&manager));

    let options = TransactionOptions::default().isolation(IsolationLevel::ReadCommitted);
    let mut tx = transactions.begin(options).await.unwrap();
    let select = Statement::raw("SELECT 1 AS one", Vec::new(), Vendor::MySQL);
    let result = tx.execute(&select).await.unwrap();
    assert_eq!(result.rows[0]["one"], 1);
    tx.rollback().await.unwrap();
    manager.close().await;
}

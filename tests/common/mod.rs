//! Shared helpers for integration tests.

#![allow(dead_code)]

use dbkit::config::OperationDefaults;
use dbkit::models::ConnectionConfig;
use dbkit::tools::DbOperations;
use tempfile::TempDir;

pub const USERS_SCHEMA: &str = "
    CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT UNIQUE,
        status TEXT NOT NULL DEFAULT 'active',
        version INTEGER NOT NULL DEFAULT 1,
        deleted_at TEXT
    );
    CREATE TABLE sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        token TEXT NOT NULL
    );
";

/// A SQLite database file in a temporary directory. The file goes away with the guard.
pub struct TestDb {
    _dir: TempDir,
    pub path: String,
}

impl TestDb {
    /// Create the database and apply `schema` directly through sqlx,
    /// since DDL is rejected by the safety layer.
    pub async fn with_schema(schema: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db").to_string_lossy().into_owned();
        let url = format!("sqlite:{path}?mode=rwc");
        let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
        sqlx::raw_sql(schema).execute(&pool).await.unwrap();
        pool.close().await;
        Self { _dir: dir, path }
    }

    pub async fn users() -> Self {
        Self::with_schema(USERS_SCHEMA).await
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::sqlite_file(&self.path)
    }

    pub fn operations(&self) -> DbOperations {
        DbOperations::new(OperationDefaults {
            default_connection: Some(self.config()),
            ..Default::default()
        })
    }
}

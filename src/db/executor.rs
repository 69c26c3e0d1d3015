//! Statement execution on a single checked-out connection.
//!
//! [`DbConnection`] wraps a pooled connection of one vendor. The connection manager,
//! transactions and the streaming executor all run statements through it, so a
//! statement behaves the same whether it runs alone or inside a transaction.
//!
//! # Architecture
//!
//! The executor uses vendor-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific fetch and write paths
//! - `postgres`: PostgreSQL-specific fetch and write paths
//! - `sqlite`: SQLite-specific fetch and write paths
//!
//! Each submodule provides identical functionality adapted to the driver's types.

use crate::db::params::bind_params;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{JsonRow, QueryResult, Statement, Vendor};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, Postgres, Sqlite};
use std::time::Instant;
use tracing::debug;

/// A connection checked out of a vendor pool.
#[derive(Debug)]
pub enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbConnection {
    pub fn vendor(&self) -> Vendor {
        match self {
            Self::MySql(_) => Vendor::MySQL,
            Self::Postgres(_) => Vendor::PostgreSQL,
            Self::SQLite(_) => Vendor::SQLite,
        }
    }

    /// Run one statement: rows are fetched for row-returning statements, otherwise
    /// the affected count and driver insert id are reported.
    pub async fn run(&mut self, statement: &Statement) -> DbResult<QueryResult> {
        let start = Instant::now();
        debug!(
            sql = %statement.sql,
            params = statement.params.len(),
            kind = ?statement.kind,
            returns_rows = statement.returns_rows,
            "Executing statement"
        );

        let result = match self {
            Self::MySql(conn) => mysql::run(conn, statement).await?,
            Self::Postgres(conn) => postgres::run(conn, statement).await?,
            Self::SQLite(conn) => sqlite::run(conn, statement).await?,
        };
        Ok(result.with_elapsed(start.elapsed()))
    }

    /// Run unparameterized control SQL (BEGIN, SAVEPOINT, PRAGMA ...).
    pub async fn run_control(&mut self, sql: &str) -> DbResult<()> {
        use sqlx::Executor;
        debug!(sql = %sql, "Executing control statement");
        match self {
            Self::MySql(conn) => (&mut **conn).execute(sql).await.map(|_| ())?,
            Self::Postgres(conn) => (&mut **conn).execute(sql).await.map(|_| ())?,
            Self::SQLite(conn) => (&mut **conn).execute(sql).await.map(|_| ())?,
        }
        Ok(())
    }

    /// Fetch a single integer, e.g. a PRAGMA value.
    pub async fn fetch_i64(&mut self, sql: &str) -> DbResult<Option<i64>> {
        let value = match self {
            Self::MySql(conn) => {
                sqlx::query_scalar::<_, i64>(sql)
                    .fetch_optional(&mut **conn)
                    .await?
            }
            Self::Postgres(conn) => {
                sqlx::query_scalar::<_, i64>(sql)
                    .fetch_optional(&mut **conn)
                    .await?
            }
            Self::SQLite(conn) => {
                sqlx::query_scalar::<_, i64>(sql)
                    .fetch_optional(&mut **conn)
                    .await?
            }
        };
        Ok(value)
    }

    /// Fetch a single text value, e.g. the server version.
    pub async fn fetch_string(&mut self, sql: &str) -> DbResult<Option<String>> {
        let value = match self {
            Self::MySql(conn) => {
                sqlx::query_scalar::<_, String>(sql)
                    .fetch_optional(&mut **conn)
                    .await?
            }
            Self::Postgres(conn) => {
                sqlx::query_scalar::<_, String>(sql)
                    .fetch_optional(&mut **conn)
                    .await?
            }
            Self::SQLite(conn) => {
                sqlx::query_scalar::<_, String>(sql)
                    .fetch_optional(&mut **conn)
                    .await?
            }
        };
        Ok(value)
    }

    /// Stream decoded rows of a statement without buffering the result set.
    pub fn stream_rows<'c>(
        &'c mut self,
        statement: &'c Statement,
    ) -> BoxStream<'c, DbResult<JsonRow>> {
        debug!(sql = %statement.sql, params = statement.params.len(), "Streaming statement");
        match self {
            Self::MySql(conn) => bind_params(sqlx::query(&statement.sql), &statement.params)
                .fetch(&mut **conn)
                .map(|row| row.map(|r| r.to_json_map()).map_err(DbError::from))
                .boxed(),
            Self::Postgres(conn) => bind_params(sqlx::query(&statement.sql), &statement.params)
                .fetch(&mut **conn)
                .map(|row| row.map(|r| r.to_json_map()).map_err(DbError::from))
                .boxed(),
            Self::SQLite(conn) => bind_params(sqlx::query(&statement.sql), &statement.params)
                .fetch(&mut **conn)
                .map(|row| row.map(|r| r.to_json_map()).map_err(DbError::from))
                .boxed(),
        }
    }

    /// Take the connection out of its pool and close it instead of returning it.
    ///
    /// Used when the connection's state is unknown, e.g. a transaction that
    /// could not be rolled back.
    pub fn discard(self) {
        match self {
            Self::MySql(conn) => drop(conn.detach()),
            Self::Postgres(conn) => drop(conn.detach()),
            Self::SQLite(conn) => drop(conn.detach()),
        }
    }
}

fn rows_to_result<R: RowToJson>(rows: Vec<R>) -> QueryResult {
    QueryResult::from_rows(rows.iter().map(RowToJson::to_json_map).collect())
}

// =============================================================================
// Vendor-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its driver. Without
// parameters the SQL is sent unprepared, so statements that cannot be prepared
// still run.

mod mysql {
    use super::*;
    use sqlx::Executor;
    use sqlx::mysql::MySqlConnection;

    pub async fn run(conn: &mut MySqlConnection, statement: &Statement) -> DbResult<QueryResult> {
        if statement.returns_rows {
            let rows = if statement.params.is_empty() {
                conn.fetch_all(statement.sql.as_str()).await?
            } else {
                bind_params(sqlx::query(&statement.sql), &statement.params)
                    .fetch_all(&mut *conn)
                    .await?
            };
            return Ok(rows_to_result(rows));
        }

        let done = if statement.params.is_empty() {
            conn.execute(statement.sql.as_str()).await?
        } else {
            bind_params(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut *conn)
                .await?
        };
        // LAST_INSERT_ID() is 0 when nothing was generated
        let last_id = i64::try_from(done.last_insert_id()).ok().filter(|id| *id > 0);
        Ok(QueryResult::write_result(done.rows_affected(), last_id))
    }
}

mod postgres {
    use super::*;
    use sqlx::Executor;
    use sqlx::postgres::PgConnection;

    pub async fn run(conn: &mut PgConnection, statement: &Statement) -> DbResult<QueryResult> {
        if statement.returns_rows {
            let rows = if statement.params.is_empty() {
                conn.fetch_all(statement.sql.as_str()).await?
            } else {
                bind_params(sqlx::query(&statement.sql), &statement.params)
                    .fetch_all(&mut *conn)
                    .await?
            };
            return Ok(rows_to_result(rows));
        }

        let done = if statement.params.is_empty() {
            conn.execute(statement.sql.as_str()).await?
        } else {
            bind_params(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut *conn)
                .await?
        };
        Ok(QueryResult::write_result(done.rows_affected(), None))
    }
}

mod sqlite {
    use super::*;
    use sqlx::Executor;
    use sqlx::sqlite::SqliteConnection;

    pub async fn run(conn: &mut SqliteConnection, statement: &Statement) -> DbResult<QueryResult> {
        if statement.returns_rows {
            let rows = if statement.params.is_empty() {
                conn.fetch_all(statement.sql.as_str()).await?
            } else {
                bind_params(sqlx::query(&statement.sql), &statement.params)
                    .fetch_all(&mut *conn)
                    .await?
            };
            return Ok(rows_to_result(rows));
        }

        let done = if statement.params.is_empty() {
            conn.execute(statement.sql.as_str()).await?
        } else {
            bind_params(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut *conn)
                .await?
        };
        let last_id = Some(done.last_insert_rowid()).filter(|id| *id > 0);
        Ok(QueryResult::write_result(done.rows_affected(), last_id))
    }
}

//! Per-vendor SQL rules.
//!
//! Each vendor has one static [`Dialect`] implementation, resolved once when a
//! connection manager is created and shared by the builder and the transaction code.

use crate::models::Vendor;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// How a vendor applies an isolation level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationPlan {
    /// Statement issued before `BEGIN` (applies to the next transaction only)
    BeforeBegin(String),
    /// Statement issued as the first statement inside the transaction
    AfterBegin(String),
    /// Connection-level flag set after `BEGIN` and restored on completion
    SessionFlag { pragma: &'static str, value: i64 },
    /// Level accepted but nothing to apply
    Noop,
}

pub trait Dialect: Send + Sync + fmt::Debug {
    fn vendor(&self) -> Vendor;

    /// Quote one identifier part. Callers validate the part first.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Placeholder for the 1-based parameter position.
    fn placeholder(&self, position: usize) -> String;

    fn supports_returning(&self) -> bool;

    /// Inserted ids from the driver's insert id and affected count.
    fn inserted_ids_from_driver(&self, last_insert_id: i64, affected: u64) -> Vec<i64>;

    fn isolation_plan(&self, level: IsolationLevel) -> IsolationPlan;

    /// LIMIT clause to pair with a bare OFFSET, for vendors that require one.
    fn limit_for_bare_offset(&self) -> Option<&'static str> {
        None
    }

    fn version_query(&self) -> &'static str {
        "SELECT version()"
    }

    fn begin_statement(&self) -> &'static str {
        "BEGIN"
    }
}

#[derive(Debug)]
pub struct PostgresDialect;

#[derive(Debug)]
pub struct MySqlDialect;

#[derive(Debug)]
pub struct SqliteDialect;

static POSTGRES: PostgresDialect = PostgresDialect;
static MYSQL: MySqlDialect = MySqlDialect;
static SQLITE: SqliteDialect = SqliteDialect;

/// Resolve the dialect for a vendor.
pub fn dialect_for(vendor: Vendor) -> &'static dyn Dialect {
    match vendor {
        Vendor::PostgreSQL => &POSTGRES,
        Vendor::MySQL => &MYSQL,
        Vendor::SQLite => &SQLITE,
    }
}

fn double_quoted(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl Dialect for PostgresDialect {
    fn vendor(&self) -> Vendor {
        Vendor::PostgreSQL
    }

    fn quote_identifier(&self, ident: &str) -> String {
        double_quoted(ident)
    }

    fn placeholder(&self, position: usize) -> String {
        format!("${}", position)
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn inserted_ids_from_driver(&self, _last_insert_id: i64, _affected: u64) -> Vec<i64> {
        // No driver-side insert id; ids come from RETURNING
        Vec::new()
    }

    fn isolation_plan(&self, level: IsolationLevel) -> IsolationPlan {
        IsolationPlan::AfterBegin(format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()))
    }
}

impl Dialect for MySqlDialect {
    fn vendor(&self) -> Vendor {
        Vendor::MySQL
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn placeholder(&self, _position: usize) -> String {
        "?".to_string()
    }

    fn supports_returning(&self) -> bool {
        false
    }

    /// `LAST_INSERT_ID()` is the first id of a multi-row insert; ids ascend from it.
    fn inserted_ids_from_driver(&self, last_insert_id: i64, affected: u64) -> Vec<i64> {
        if last_insert_id <= 0 {
            return Vec::new();
        }
        (0..affected as i64).map(|i| last_insert_id + i).collect()
    }

    fn isolation_plan(&self, level: IsolationLevel) -> IsolationPlan {
        IsolationPlan::BeforeBegin(format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()))
    }

    fn limit_for_bare_offset(&self) -> Option<&'static str> {
        Some("LIMIT 18446744073709551615")
    }

    fn begin_statement(&self) -> &'static str {
        "START TRANSACTION"
    }
}

impl Dialect for SqliteDialect {
    fn vendor(&self) -> Vendor {
        Vendor::SQLite
    }

    fn quote_identifier(&self, ident: &str) -> String {
        double_quoted(ident)
    }

    fn placeholder(&self, _position: usize) -> String {
        "?".to_string()
    }

    fn supports_returning(&self) -> bool {
        true
    }

    /// The last rowid belongs to the final inserted row; ids descend from it.
    fn inserted_ids_from_driver(&self, last_insert_id: i64, affected: u64) -> Vec<i64> {
        if last_insert_id <= 0 {
            return Vec::new();
        }
        let first = last_insert_id - affected as i64 + 1;
        (first..=last_insert_id).collect()
    }

    fn isolation_plan(&self, level: IsolationLevel) -> IsolationPlan {
        match level {
            IsolationLevel::ReadUncommitted => IsolationPlan::SessionFlag {
                pragma: "read_uncommitted",
                value: 1,
            },
            // SQLite transactions are serializable already
            _ => IsolationPlan::Noop,
        }
    }

    fn limit_for_bare_offset(&self) -> Option<&'static str> {
        Some("LIMIT -1")
    }

    fn version_query(&self) -> &'static str {
        "SELECT sqlite_version()"
    }
}

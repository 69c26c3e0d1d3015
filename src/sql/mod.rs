//! SQL text: safety checks and the structured query builder.

pub mod builder;
pub mod condition;
pub mod ident;
pub mod safety;

pub use builder::{
    DeleteQuery, InsertQuery, InsertValues, OptimisticLock, OrderBy, ReturningMode, SelectQuery,
    SoftDelete, SoftDeleteMode, SortDirection, SqlWriter, UpdateQuery, build_delete, build_insert,
    build_select, build_update,
};
pub use condition::{Operator, WhereCondition};
pub use ident::{TableName, validate_identifier, validate_savepoint_name};
pub use safety::{
    check_statement, enforce_parameterized_query_usage, neutralize_sql, statement_is_read_only,
    statement_returns_rows, validate_sql_string,
};

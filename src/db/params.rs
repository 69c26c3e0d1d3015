//! Parameter binding for SQL queries.

use crate::models::QueryParam;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Database, Encode, MySql, Postgres, Sqlite, Type};

/// Query type with the driver's argument buffer.
pub(crate) type BoundQuery<'q, DB> = Query<'q, DB, <DB as Database>::Arguments<'q>>;

/// How a driver binds arrays and objects.
pub(crate) trait BindJson: Database {
    fn bind_json<'q>(query: BoundQuery<'q, Self>, value: &'q JsonValue) -> BoundQuery<'q, Self>;
}

impl BindJson for Postgres {
    fn bind_json<'q>(query: BoundQuery<'q, Self>, value: &'q JsonValue) -> BoundQuery<'q, Self> {
        query.bind(Json(value))
    }
}

impl BindJson for MySql {
    fn bind_json<'q>(query: BoundQuery<'q, Self>, value: &'q JsonValue) -> BoundQuery<'q, Self> {
        query.bind(Json(value))
    }
}

impl BindJson for Sqlite {
    // SQLite stores JSON as TEXT
    fn bind_json<'q>(query: BoundQuery<'q, Self>, value: &'q JsonValue) -> BoundQuery<'q, Self> {
        query.bind(value.to_string())
    }
}

/// Bind every parameter in order.
pub(crate) fn bind_params<'q, DB>(
    mut query: BoundQuery<'q, DB>,
    params: &'q [QueryParam],
) -> BoundQuery<'q, DB>
where
    DB: BindJson,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    &'q str: Encode<'q, DB> + Type<DB>,
    &'q [u8]: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB> + Type<DB>,
{
    for param in params {
        query = match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(b) => query.bind(*b),
            QueryParam::Int(i) => query.bind(*i),
            QueryParam::Float(f) => query.bind(*f),
            QueryParam::String(s) => query.bind(s.as_str()),
            QueryParam::Bytes(bytes) => query.bind(bytes.as_slice()),
            QueryParam::Json(v) => DB::bind_json(query, v),
        };
    }
    query
}

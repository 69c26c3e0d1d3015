//! Statement and result models shared by the builder and the executors.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A decoded row: column name to JSON value.
pub type JsonRow = serde_json::Map<String, JsonValue>;

/// A parameter value bound to a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Arrays and objects, bound as the vendor's JSON type
    Json(JsonValue),
}

impl QueryParam {
    /// Convert a caller-supplied JSON value into a bindable parameter.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    // u64 beyond i64::MAX and fractional values
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => Self::Json(value.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for QueryParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// What a statement does, as far as the executors care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    /// Caller-supplied SQL text
    Raw,
}

/// Where a statement came from. Raw statements get the stricter parameter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementOrigin {
    Builder,
    Raw,
}

/// A single parameterized statement ready for a driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub kind: StatementKind,
    /// Whether the driver should fetch rows rather than just count affected rows
    pub returns_rows: bool,
    pub origin: StatementOrigin,
}

impl Statement {
    /// Wrap caller-supplied SQL. Row-returning is decided from the SQL text.
    pub fn raw(
        sql: impl Into<String>,
        params: Vec<QueryParam>,
        vendor: crate::models::Vendor,
    ) -> Self {
        let sql = sql.into();
        let returns_rows = crate::sql::safety::statement_returns_rows(&sql, vendor);
        Self {
            sql,
            params,
            kind: StatementKind::Raw,
            returns_rows,
            origin: StatementOrigin::Raw,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.origin == StatementOrigin::Raw
    }

    /// Whether running the statement a second time cannot change data.
    pub fn is_replayable(&self, vendor: crate::models::Vendor) -> bool {
        match self.kind {
            StatementKind::Select => true,
            StatementKind::Raw => {
                self.returns_rows && crate::sql::safety::statement_is_read_only(&self.sql, vendor)
            }
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete => false,
        }
    }
}

/// Outcome of executing one statement.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub rows: Vec<JsonRow>,
    pub rows_affected: u64,
    /// Driver-reported insert id (MySQL `LAST_INSERT_ID()`, SQLite last rowid)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Result for a row-returning statement; the affected count is the row count.
    pub fn from_rows(rows: Vec<JsonRow>) -> Self {
        Self {
            rows_affected: rows.len() as u64,
            rows,
            last_insert_id: None,
            execution_time_ms: 0,
        }
    }

    /// Result for write operations (INSERT/UPDATE/DELETE).
    pub fn write_result(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
            last_insert_id,
            execution_time_ms: 0,
        }
    }

    pub fn with_elapsed(mut self, elapsed: std::time::Duration) -> Self {
        self.execution_time_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Vendor;
    use serde_json::json;

    #[test]
    fn test_only_reads_are_replayable() {
        let select = Statement::raw("SELECT * FROM users", Vec::new(), Vendor::MySQL);
        assert!(select.is_replayable(Vendor::MySQL));

        let insert = Statement::raw(
            "INSERT INTO users (name) VALUES (?)",
            vec![QueryParam::String("Ada".into())],
            Vendor::MySQL,
        );
        assert!(!insert.is_replayable(Vendor::MySQL));

        let returning = Statement::raw(
            "UPDATE users SET name = $1 WHERE id = $2 RETURNING *",
            vec![QueryParam::String("Ada".into()), QueryParam::Int(1)],
            Vendor::PostgreSQL,
        );
        assert!(returning.returns_rows);
        assert!(!returning.is_replayable(Vendor::PostgreSQL));

        let built_insert = Statement {
            kind: StatementKind::Insert,
            returns_rows: true,
            origin: StatementOrigin::Builder,
            ..select.clone()
        };
        assert!(!built_insert.is_replayable(Vendor::MySQL));
    }

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
    }

    #[test]
    fn test_query_param_from_json() {
        assert_eq!(QueryParam::from_json(&json!(7)), QueryParam::Int(7));
        assert_eq!(QueryParam::from_json(&json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(QueryParam::from_json(&json!(null)), QueryParam::Null);
        assert_eq!(
            QueryParam::from_json(&json!({"a": 1})),
            QueryParam::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_large_unsigned_becomes_float() {
        let param = QueryParam::from_json(&json!(u64::MAX));
        assert_eq!(param.type_name(), "float");
    }

    #[test]
    fn test_bytes_round_trip_through_base64() {
        let param = QueryParam::Bytes(vec![0, 159, 146, 150]);
        let encoded = serde_json::to_value(&param).unwrap();
        assert_eq!(encoded, json!("AJ+Slg=="));
    }

    #[test]
    fn test_query_result_from_rows_counts_rows() {
        let mut row = JsonRow::new();
        row.insert("id".into(), json!(1));
        let result = QueryResult::from_rows(vec![row]);
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.row_count(), 1);
    }

    #[test]
    fn test_query_result_write() {
        let result = QueryResult::write_result(5, Some(12));
        assert_eq!(result.rows_affected, 5);
        assert_eq!(result.last_insert_id, Some(12));
        assert!(result.rows.is_empty());
    }
}

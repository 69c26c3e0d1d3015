//! Structured query builder.
//!
//! Each operation has an immutable descriptor ([`SelectQuery`], [`InsertQuery`],
//! [`UpdateQuery`], [`DeleteQuery`]) and a constructor function that renders it into
//! exactly one parameterized [`Statement`] for a [`Dialect`]. Every caller value is
//! bound as a parameter; only validated identifiers reach the SQL text.

use super::condition::{WhereCondition, render_where};
use super::ident::{TableName, quote_column, validate_identifier};
use crate::db::dialect::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{JsonRow, QueryParam, QueryResult, Statement, StatementKind, StatementOrigin};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Accumulates SQL text and bound parameters, numbering placeholders per dialect.
pub struct SqlWriter<'d> {
    dialect: &'d dyn Dialect,
    sql: String,
    params: Vec<QueryParam>,
}

impl<'d> SqlWriter<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self {
            dialect,
            sql: String::with_capacity(128),
            params: Vec::new(),
        }
    }

    pub fn dialect(&self) -> &'d dyn Dialect {
        self.dialect
    }

    pub fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Bind a value and append its placeholder.
    pub fn push_param(&mut self, param: QueryParam) {
        self.params.push(param);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }

    pub fn finish(self) -> (String, Vec<QueryParam>) {
        (self.sql, self.params)
    }

    fn into_statement(self, kind: StatementKind, returns_rows: bool) -> Statement {
        let (sql, params) = self.finish();
        Statement {
            sql,
            params,
            kind,
            returns_rows,
            origin: StatementOrigin::Builder,
        }
    }
}

// ============================================================================
// SELECT
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    pub table: String,
    /// Columns to return; all columns when absent or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WhereCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl SelectQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

fn bound_count(value: u64, what: &str) -> DbResult<QueryParam> {
    i64::try_from(value)
        .map(QueryParam::Int)
        .map_err(|_| DbError::invalid_input(format!("{what} is too large")))
}

pub fn build_select(dialect: &dyn Dialect, query: &SelectQuery) -> DbResult<Statement> {
    let table = TableName::parse(&query.table)?;
    let mut w = SqlWriter::new(dialect);

    w.push("SELECT ");
    match query.columns.as_deref() {
        Some(columns) if !columns.is_empty() => {
            let quoted = columns
                .iter()
                .map(|c| quote_column(dialect, c))
                .collect::<DbResult<Vec<_>>>()?;
            w.push(&quoted.join(", "));
        }
        _ => w.push("*"),
    }
    w.push(" FROM ");
    w.push(&table.quoted(dialect));

    render_where(&mut w, &query.conditions)?;

    for (i, order) in query.order_by.iter().enumerate() {
        w.push(if i == 0 { " ORDER BY " } else { ", " });
        w.push(&quote_column(dialect, &order.column)?);
        w.push(match order.direction {
            SortDirection::Asc => " ASC",
            SortDirection::Desc => " DESC",
        });
    }

    match (query.limit, query.offset) {
        (Some(limit), offset) => {
            w.push(" LIMIT ");
            w.push_param(bound_count(limit, "limit")?);
            if let Some(offset) = offset {
                w.push(" OFFSET ");
                w.push_param(bound_count(offset, "offset")?);
            }
        }
        (None, Some(offset)) => {
            if let Some(limit_all) = dialect.limit_for_bare_offset() {
                w.push(" ");
                w.push(limit_all);
            }
            w.push(" OFFSET ");
            w.push_param(bound_count(offset, "offset")?);
        }
        (None, None) => {}
    }

    Ok(w.into_statement(StatementKind::Select, true))
}

// ============================================================================
// INSERT
// ============================================================================

/// What an INSERT hands back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReturningMode {
    #[default]
    None,
    Id,
    Row,
}

/// A single row or a list of uniform rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum InsertValues {
    One(JsonRow),
    Many(Vec<JsonRow>),
}

impl InsertValues {
    pub fn rows(&self) -> &[JsonRow] {
        match self {
            Self::One(row) => std::slice::from_ref(row),
            Self::Many(rows) => rows,
        }
    }
}

fn default_id_column() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InsertQuery {
    pub table: String,
    pub values: InsertValues,
    #[serde(default)]
    pub returning: ReturningMode,
    /// Column holding the generated key (default: `id`)
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

impl InsertQuery {
    pub fn new(table: impl Into<String>, values: InsertValues) -> Self {
        Self {
            table: table.into(),
            values,
            returning: ReturningMode::default(),
            id_column: default_id_column(),
        }
    }

    pub fn returning(mut self, mode: ReturningMode) -> Self {
        self.returning = mode;
        self
    }

    /// Inserted ids: the returned rows' id column, else ids the caller supplied,
    /// else the driver's insert id expanded over the affected count.
    pub fn inserted_ids(&self, dialect: &dyn Dialect, result: &QueryResult) -> Vec<JsonValue> {
        let from_returned: Vec<JsonValue> = result
            .rows
            .iter()
            .filter_map(|row| row.get(&self.id_column).cloned())
            .collect();
        if !from_returned.is_empty() {
            return from_returned;
        }

        let rows = self.values.rows();
        let supplied: Vec<JsonValue> = rows
            .iter()
            .filter_map(|row| row.get(&self.id_column).filter(|v| !v.is_null()).cloned())
            .collect();
        if !supplied.is_empty() && supplied.len() == rows.len() {
            return supplied;
        }

        match result.last_insert_id {
            Some(last_id) => dialect
                .inserted_ids_from_driver(last_id, result.rows_affected)
                .into_iter()
                .map(JsonValue::from)
                .collect(),
            None => Vec::new(),
        }
    }
}

pub fn build_insert(dialect: &dyn Dialect, query: &InsertQuery) -> DbResult<Statement> {
    let table = TableName::parse(&query.table)?;
    let rows = query.values.rows();
    let first = rows
        .first()
        .ok_or_else(|| DbError::invalid_input("INSERT requires at least one row"))?;
    if first.is_empty() {
        return Err(DbError::invalid_input("INSERT rows must have at least one column"));
    }

    let columns: Vec<&String> = first.keys().collect();
    for (i, row) in rows.iter().enumerate().skip(1) {
        if row.len() != columns.len() || !columns.iter().all(|c| row.contains_key(*c)) {
            return Err(DbError::invalid_input(format!(
                "INSERT row {} has different columns than row 1; all rows must share the same columns",
                i + 1
            )));
        }
    }

    let mut w = SqlWriter::new(dialect);
    w.push("INSERT INTO ");
    w.push(&table.quoted(dialect));
    w.push(" (");
    let quoted = columns
        .iter()
        .map(|c| quote_column(dialect, c))
        .collect::<DbResult<Vec<_>>>()?;
    w.push(&quoted.join(", "));
    w.push(") VALUES ");

    for (i, row) in rows.iter().enumerate() {
        w.push(if i == 0 { "(" } else { ", (" });
        for (j, column) in columns.iter().enumerate() {
            if j > 0 {
                w.push(", ");
            }
            let value = row.get(*column).unwrap_or(&JsonValue::Null);
            w.push_param(QueryParam::from_json(value));
        }
        w.push(")");
    }

    let returns_rows = match query.returning {
        ReturningMode::None => false,
        _ if !dialect.supports_returning() => false,
        ReturningMode::Id => {
            w.push(" RETURNING ");
            w.push(&quote_column(dialect, &query.id_column)?);
            true
        }
        ReturningMode::Row => {
            w.push(" RETURNING *");
            true
        }
    };

    Ok(w.into_statement(StatementKind::Insert, returns_rows))
}

// ============================================================================
// UPDATE
// ============================================================================

/// Compare-and-set on a version column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticLock {
    pub version_column: String,
    pub expected_version: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuery {
    pub table: String,
    pub set: JsonRow,
    #[serde(default, rename = "where")]
    pub conditions: Vec<WhereCondition>,
    #[serde(default)]
    pub allow_full_table_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_lock: Option<OptimisticLock>,
}

impl UpdateQuery {
    pub fn new(table: impl Into<String>, set: JsonRow) -> Self {
        Self {
            table: table.into(),
            set,
            conditions: Vec::new(),
            allow_full_table_update: false,
            optimistic_lock: None,
        }
    }

    pub fn filter(mut self, condition: WhereCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Error for an UPDATE that matched nothing under an optimistic lock.
    pub fn stale_version_error(&self) -> Option<DbError> {
        self.optimistic_lock.as_ref().map(|lock| {
            DbError::optimistic_lock(
                &self.table,
                &lock.version_column,
                lock.expected_version.to_string(),
            )
        })
    }
}

pub fn build_update(dialect: &dyn Dialect, query: &UpdateQuery) -> DbResult<Statement> {
    let table = TableName::parse(&query.table)?;
    if query.set.is_empty() {
        return Err(DbError::invalid_input("UPDATE requires at least one column to set"));
    }
    if query.conditions.is_empty() && !query.allow_full_table_update {
        return Err(DbError::invalid_input(format!(
            "WHERE conditions are required for UPDATE on '{}'; set allowFullTableUpdate to update every row",
            query.table
        )));
    }

    let mut w = SqlWriter::new(dialect);
    w.push("UPDATE ");
    w.push(&table.quoted(dialect));
    w.push(" SET ");
    for (i, (column, value)) in query.set.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push(&quote_column(dialect, column)?);
        w.push(" = ");
        w.push_param(QueryParam::from_json(value));
    }

    let mut conditions = query.conditions.clone();
    if let Some(lock) = &query.optimistic_lock {
        validate_identifier(&lock.version_column, "version column")?;
        let version = WhereCondition::eq(&lock.version_column, lock.expected_version.clone())?;
        // Integer versions advance unless the caller sets the new version explicitly
        if lock.expected_version.is_i64() && !query.set.contains_key(&lock.version_column) {
            let column = dialect.quote_identifier(&lock.version_column);
            w.push(", ");
            w.push(&column);
            w.push(" = ");
            w.push(&column);
            w.push(" + 1");
        }
        conditions.push(version);
    }
    render_where(&mut w, &conditions)?;

    Ok(w.into_statement(StatementKind::Update, false))
}

// ============================================================================
// DELETE
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SoftDeleteMode {
    /// Boolean column set to TRUE
    #[default]
    Flag,
    /// Timestamp column set to CURRENT_TIMESTAMP
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SoftDelete {
    pub column: String,
    #[serde(default)]
    pub mode: SoftDeleteMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    pub table: String,
    #[serde(default, rename = "where")]
    pub conditions: Vec<WhereCondition>,
    #[serde(default)]
    pub allow_full_table_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_delete: Option<SoftDelete>,
    /// Explain foreign key failures in terms of ON DELETE CASCADE
    #[serde(default)]
    pub cascade: bool,
}

impl DeleteQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
            allow_full_table_delete: false,
            soft_delete: None,
            cascade: false,
        }
    }

    pub fn filter(mut self, condition: WhereCondition) -> Self {
        self.conditions.push(condition);
        self
    }
}

pub fn build_delete(dialect: &dyn Dialect, query: &DeleteQuery) -> DbResult<Statement> {
    let table = TableName::parse(&query.table)?;
    if query.conditions.is_empty() && !query.allow_full_table_delete {
        return Err(DbError::invalid_input(format!(
            "WHERE conditions are required for DELETE on '{}'; set allowFullTableDelete to delete every row",
            query.table
        )));
    }

    let mut w = SqlWriter::new(dialect);
    let kind = match &query.soft_delete {
        Some(soft) => {
            w.push("UPDATE ");
            w.push(&table.quoted(dialect));
            w.push(" SET ");
            w.push(&quote_column(dialect, &soft.column)?);
            w.push(match soft.mode {
                SoftDeleteMode::Flag => " = TRUE",
                SoftDeleteMode::Timestamp => " = CURRENT_TIMESTAMP",
            });
            StatementKind::Update
        }
        None => {
            w.push("DELETE FROM ");
            w.push(&table.quoted(dialect));
            StatementKind::Delete
        }
    };
    render_where(&mut w, &query.conditions)?;

    Ok(w.into_statement(kind, false))
}

//! Identifier validation and quoting.
//!
//! Table names follow `[A-Za-z_][A-Za-z0-9_]*`, optionally qualified by one schema
//! part (`schema.table`). Column names are a single part. Savepoint names are
//! additionally capped at 63 characters.

use crate::db::dialect::Dialect;
use crate::error::{DbError, DbResult};

/// Longest savepoint name accepted (PostgreSQL's identifier limit).
pub const MAX_SAVEPOINT_NAME_LEN: usize = 63;

fn is_valid_part(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a single identifier part; `what` names it in the error.
pub fn validate_identifier(name: &str, what: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::invalid_input(format!("{what} name cannot be empty")));
    }
    if !is_valid_part(name) {
        return Err(DbError::invalid_input(format!(
            "Invalid {what} name '{name}': use letters, digits and underscores, starting with a letter or underscore"
        )));
    }
    Ok(())
}

/// Validate a column name and quote it for the dialect.
pub fn quote_column(dialect: &dyn Dialect, column: &str) -> DbResult<String> {
    validate_identifier(column, "column")?;
    Ok(dialect.quote_identifier(column))
}

/// A table name, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn parse(raw: &str) -> DbResult<Self> {
        let mut parts = raw.split('.');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(DbError::invalid_input(format!(
                "Invalid table name '{raw}': at most one schema qualifier is allowed"
            )));
        }
        validate_identifier(first, "table")?;
        match second {
            Some(table) => {
                validate_identifier(table, "table")?;
                Ok(Self {
                    schema: Some(first.to_string()),
                    name: table.to_string(),
                })
            }
            None => Ok(Self {
                schema: None,
                name: first.to_string(),
            }),
        }
    }

    pub fn quoted(&self, dialect: &dyn Dialect) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}.{}",
                dialect.quote_identifier(schema),
                dialect.quote_identifier(&self.name)
            ),
            None => dialect.quote_identifier(&self.name),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Savepoint names are `[A-Za-z_][A-Za-z0-9_]{0,62}`.
pub fn validate_savepoint_name(name: &str) -> DbResult<()> {
    if name.len() > MAX_SAVEPOINT_NAME_LEN || !is_valid_part(name) {
        return Err(DbError::invalid_input(format!(
            "Invalid savepoint name '{name}': expected 1-{MAX_SAVEPOINT_NAME_LEN} letters, digits or underscores, not starting with a digit"
        )));
    }
    Ok(())
}

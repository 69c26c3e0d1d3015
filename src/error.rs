//! Error types for dbkit.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors fall into three tiers:
//! - validation errors raised before any network call (safe to surface verbatim)
//! - classified driver errors (unique / foreign-key violations, optimistic lock mismatch)
//!   re-raised with a fixed, friendly message
//! - unclassified driver errors, wrapped in a generic message whose cause is logged
//!   but never displayed

use thiserror::Error;
use tracing::error;

/// Driver error categories recognised from vendor-specific signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    Other,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Connection manager is not initialized. Call initialize() before executing statements.")]
    NotInitialized,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        kind: DriverErrorKind,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Unsafe SQL rejected: {reason}")]
    UnsafeSql { reason: String },

    #[error("unique constraint violation: a row with the same unique value already exists")]
    UniqueViolation,

    #[error("foreign key constraint violation: {detail}")]
    ForeignKeyViolation { detail: String },

    #[error(
        "optimistic lock check failed: row in '{table}' no longer has {column} = {expected}; reload it and retry"
    )]
    OptimisticLock {
        table: String,
        column: String,
        expected: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Transaction cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Batch {batch_index} failed after {attempts} attempt(s): {source}")]
    BatchFailed {
        batch_index: usize,
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("{operation} failed; see logs for details")]
    OperationFailed {
        operation: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        kind: DriverErrorKind,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            kind,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an unsafe SQL error.
    pub fn unsafe_sql(reason: impl Into<String>) -> Self {
        Self::UnsafeSql {
            reason: reason.into(),
        }
    }

    /// Create a foreign key violation error, adding cascade guidance when requested.
    pub fn foreign_key_violation(cascade: bool) -> Self {
        let detail = if cascade {
            "the row is still referenced by dependent rows. Cascading delete requires the \
             referencing foreign key to be declared with ON DELETE CASCADE"
        } else {
            "the row is referenced by, or references, a row in another table"
        };
        Self::ForeignKeyViolation {
            detail: detail.to_string(),
        }
    }

    /// Create an optimistic lock error.
    pub fn optimistic_lock(
        table: impl Into<String>,
        column: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::OptimisticLock {
            table: table.into(),
            column: column.into(),
            expected: expected.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a batch failure error wrapping the underlying cause.
    pub fn batch_failed(batch_index: usize, attempts: u32, source: DbError) -> Self {
        Self::BatchFailed {
            batch_index,
            attempts,
            source: Box::new(source),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::NotInitialized => Some("Call initialize() on the connection manager first"),
            Self::UnsafeSql { .. } => {
                Some("Bind values through parameters and avoid DDL in application queries")
            }
            Self::OptimisticLock { .. } => Some("Reload the row to obtain its current version"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error signals a dropped physical connection.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this error was raised before reaching the driver.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::UnsafeSql { .. } | Self::NotInitialized
        )
    }

    /// Map an error into the form surfaced to callers.
    ///
    /// Unique and foreign-key violations get fixed messages; any other driver error
    /// is logged and replaced by a generic `OperationFailed` so schema details never
    /// leak. Connection failures keep their suggestion but lose the driver text,
    /// which can carry hosts, users or file paths. Validation, transaction and
    /// timeout errors pass through unchanged.
    pub fn classify(self, operation: &str, cascade: bool) -> DbError {
        match self {
            Self::Database {
                kind: DriverErrorKind::UniqueViolation,
                ..
            } => Self::UniqueViolation,
            Self::Database {
                kind: DriverErrorKind::ForeignKeyViolation,
                ..
            } => Self::foreign_key_violation(cascade),
            err @ (Self::Database { .. } | Self::Internal { .. }) => {
                error!(operation = %operation, error = %err, "Database operation failed");
                Self::OperationFailed {
                    operation: operation.to_string(),
                    source: Box::new(err),
                }
            }
            Self::Connection {
                message,
                suggestion,
            } => {
                error!(operation = %operation, error = %message, "Database connection failed");
                Self::Connection {
                    message: format!("{operation} could not reach the database; see logs for details"),
                    suggestion,
                }
            }
            Self::PoolClosed => {
                error!(operation = %operation, "Connection pool is closed");
                Self::Connection {
                    message: format!("{operation} could not reach the database; see logs for details"),
                    suggestion: "Restart the server to open a new connection pool".to_string(),
                }
            }
            Self::BatchFailed {
                batch_index,
                attempts,
                source,
            } => Self::BatchFailed {
                batch_index,
                attempts,
                source: Box::new(source.classify(operation, cascade)),
            },
            other => other,
        }
    }
}

/// Derive the driver error kind from sqlx's classification, falling back to
/// SQLSTATE / vendor error codes.
fn driver_error_kind(db_err: &dyn sqlx::error::DatabaseError) -> DriverErrorKind {
    use sqlx::error::ErrorKind;

    match db_err.kind() {
        ErrorKind::UniqueViolation => return DriverErrorKind::UniqueViolation,
        ErrorKind::ForeignKeyViolation => return DriverErrorKind::ForeignKeyViolation,
        ErrorKind::NotNullViolation => return DriverErrorKind::NotNullViolation,
        ErrorKind::CheckViolation => return DriverErrorKind::CheckViolation,
        _ => {}
    }

    match db_err.code().as_deref() {
        // PostgreSQL SQLSTATE, MySQL error numbers, SQLite extended result codes
        Some("23505" | "1062" | "2067" | "1555") => DriverErrorKind::UniqueViolation,
        Some("23503" | "1451" | "1452" | "787") => DriverErrorKind::ForeignKeyViolation,
        Some("23502" | "1048" | "1299") => DriverErrorKind::NotNullViolation,
        Some("23514" | "3819" | "275") => DriverErrorKind::CheckViolation,
        _ => {
            let message = db_err.message().to_ascii_lowercase();
            if message.contains("foreign key constraint") {
                DriverErrorKind::ForeignKeyViolation
            } else if message.contains("unique constraint") || message.contains("duplicate entry")
            {
                DriverErrorKind::UniqueViolation
            } else {
                DriverErrorKind::Other
            }
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let kind = driver_error_kind(db_err.as_ref());
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(db_err.message(), code, kind)
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                DriverErrorKind::Other,
            ),
            sqlx::Error::PoolTimedOut => DbError::Timeout {
                operation: "connection pool acquire".to_string(),
                timeout_ms: crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS * 1000,
            },
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Build suggestion data as JSON value.
fn suggestion_data(suggestion: Option<&str>) -> Option<serde_json::Value> {
    suggestion.map(|s| serde_json::json!({ "suggestion": s }))
}

/// Convert DbError to MCP ErrorData for semantic error categorization.
impl From<DbError> for rmcp::ErrorData {
    fn from(err: DbError) -> Self {
        let data = suggestion_data(err.suggestion());
        match &err {
            DbError::InvalidInput { .. }
            | DbError::UnsafeSql { .. }
            | DbError::UniqueViolation
            | DbError::ForeignKeyViolation { .. }
            | DbError::OptimisticLock { .. } => {
                rmcp::ErrorData::invalid_params(err.to_string(), data)
            }
            DbError::NotInitialized | DbError::PoolClosed | DbError::Transaction { .. } => {
                rmcp::ErrorData::resource_not_found(err.to_string(), data)
            }
            _ => rmcp::ErrorData::internal_error(err.to_string(), data),
        }
    }
}

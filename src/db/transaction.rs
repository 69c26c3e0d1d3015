//! Transactions on a dedicated pooled connection.
//!
//! A [`Transaction`] holds one connection from BEGIN until COMMIT or ROLLBACK.
//! [`TransactionManager::with_transaction`] wraps a unit of work: it commits when
//! the work succeeds, rolls back when it fails, and enforces a timeout.
//!
//! Lifecycle: `Pending -> Active -> Committed | RolledBack`. A finished
//! transaction rejects further statements and savepoints; calling `commit` or
//! `rollback` on it again is a no-op.

use crate::config::DEFAULT_TRANSACTION_TIMEOUT_SECS;
use crate::db::dialect::{Dialect, IsolationLevel, IsolationPlan};
use crate::db::executor::DbConnection;
use crate::db::pool::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::models::{QueryResult, Statement, TransactionState, Vendor};
use crate::sql::ident::validate_savepoint_name;
use crate::sql::safety::check_statement;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, Span, debug, info, info_span, warn};

/// Options for beginning a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
    /// Limit for `with_transaction`, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TransactionOptions {
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout_ms = Some(limit.as_millis() as u64);
        self
    }
}

/// Shared cancellation cell. The first recorded reason wins.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<OnceLock<String>>);

impl CancelHandle {
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.0.set(reason.into());
    }

    pub fn reason(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get().is_some()
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// A database transaction on a dedicated connection.
pub struct Transaction {
    id: String,
    vendor: Vendor,
    conn: Option<DbConnection>,
    state: TransactionState,
    savepoint_counter: u32,
    cancel: CancelHandle,
    /// Connection flag to restore on completion, with its prior value
    restore_flag: Option<(&'static str, i64)>,
    /// Set while a driver call is awaited. Still set afterwards means the call was
    /// abandoned and the connection's protocol state is unknown.
    driver_busy: bool,
    started_at: DateTime<Utc>,
    query_timeout: Duration,
    span: Span,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("vendor", &self.vendor)
            .field("state", &self.state)
            .field("savepoints", &self.savepoint_counter)
            .field("cancelled", &self.cancel.reason())
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Handle that can cancel this transaction from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel.reason()
    }

    /// Record a cancellation reason. Later statements fail with it and the
    /// transaction can only be rolled back.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(transaction_id = %self.id, reason = %reason, "Transaction cancelled");
        self.cancel.cancel(reason);
    }

    fn ensure_active(&self) -> DbResult<()> {
        if !self.state.is_active() {
            return Err(DbError::transaction(
                format!("transaction is {}", self.state),
                &self.id,
            ));
        }
        Ok(())
    }

    fn ensure_usable(&self) -> DbResult<()> {
        self.ensure_active()?;
        if let Some(reason) = self.cancel.reason() {
            return Err(DbError::cancelled(reason));
        }
        Ok(())
    }

    /// Run one statement inside the transaction.
    ///
    /// A statement that exceeds the query timeout cancels the transaction; it can
    /// then only be rolled back.
    pub async fn execute(&mut self, statement: &Statement) -> DbResult<QueryResult> {
        self.ensure_usable()?;
        check_statement(statement, self.vendor)?;
        let limit = self.query_timeout;
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::transaction("connection already released", &self.id));
        };
        self.driver_busy = true;
        match timeout(limit, conn.run(statement)).await {
            Ok(result) => {
                self.driver_busy = false;
                result
            }
            Err(_) => {
                warn!(transaction_id = %self.id, timeout_ms = limit.as_millis() as u64, "Statement timed out inside transaction");
                self.cancel.cancel(format!(
                    "statement exceeded the {}ms query timeout",
                    limit.as_millis()
                ));
                Err(DbError::timeout("query execution", limit))
            }
        }
    }

    /// Run a control statement, tracking it like any other driver call.
    async fn control(&mut self, sql: &str) -> DbResult<()> {
        if self.driver_busy {
            return Err(DbError::transaction(
                "connection was interrupted mid-statement",
                &self.id,
            ));
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::transaction("connection already released", &self.id));
        };
        self.driver_busy = true;
        let result = conn.run_control(sql).await;
        self.driver_busy = false;
        result
    }

    /// Commit. A no-op once the transaction has finished; rolls back instead when
    /// the transaction was cancelled.
    pub async fn commit(&mut self) -> DbResult<()> {
        if self.state.is_terminal() {
            debug!(transaction_id = %self.id, state = %self.state, "Commit on finished transaction ignored");
            return Ok(());
        }
        if let Some(reason) = self.cancel.reason().map(str::to_string) {
            self.rollback_logged().await;
            return Err(DbError::cancelled(reason));
        }

        let result = self.control("COMMIT").await;
        match result {
            Ok(()) => {
                self.state = TransactionState::Committed;
                self.release().await;
                info!(transaction_id = %self.id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Commit failed; rolling back");
                self.rollback_logged().await;
                Err(e)
            }
        }
    }

    /// Roll back. A no-op once the transaction has finished.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if self.state.is_terminal() {
            debug!(transaction_id = %self.id, state = %self.state, "Rollback on finished transaction ignored");
            return Ok(());
        }

        if self.driver_busy {
            // Closing the connection aborts the transaction on the server
            self.state = TransactionState::RolledBack;
            self.restore_flag = None;
            if let Some(conn) = self.conn.take() {
                conn.discard();
            }
            warn!(transaction_id = %self.id, "Connection interrupted mid-statement; discarded instead of rolled back");
            return Ok(());
        }

        let result = self.control("ROLLBACK").await;
        self.state = TransactionState::RolledBack;
        match result {
            Ok(()) => {
                self.release().await;
                info!(transaction_id = %self.id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                // Connection state unknown; do not return it to the pool
                if let Some(conn) = self.conn.take() {
                    conn.discard();
                }
                Err(e)
            }
        }
    }

    /// Roll back, logging instead of returning a failure.
    pub(crate) async fn rollback_logged(&mut self) {
        if let Err(e) = self.rollback().await {
            warn!(transaction_id = %self.id, error = %e, "Rollback failed");
        }
    }

    /// Restore connection flags and hand the connection back to the pool.
    async fn release(&mut self) {
        if let (Some((pragma, prior)), Some(conn)) = (self.restore_flag.take(), self.conn.as_mut())
        {
            if let Err(e) = conn.run_control(&format!("PRAGMA {pragma} = {prior}")).await {
                warn!(transaction_id = %self.id, error = %e, "Failed to restore {pragma}");
                if let Some(conn) = self.conn.take() {
                    conn.discard();
                }
                return;
            }
        }
        self.conn = None;
    }

    /// Create a savepoint, generating `sp_<n>` when no name is given.
    pub async fn create_savepoint(&mut self, name: Option<&str>) -> DbResult<String> {
        self.ensure_usable()?;
        let name = match name {
            Some(name) => {
                validate_savepoint_name(name)?;
                name.to_string()
            }
            None => {
                self.savepoint_counter += 1;
                format!("sp_{}", self.savepoint_counter)
            }
        };
        self.control(&format!("SAVEPOINT {name}")).await?;
        debug!(transaction_id = %self.id, savepoint = %name, "Savepoint created");
        Ok(name)
    }

    pub async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        validate_savepoint_name(name)?;
        self.control(&format!("ROLLBACK TO SAVEPOINT {name}")).await
    }

    pub async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        validate_savepoint_name(name)?;
        self.control(&format!("RELEASE SAVEPOINT {name}")).await
    }

    /// Run `op` inside a fresh savepoint.
    ///
    /// On success the savepoint is released. On failure the work is rolled back to
    /// the savepoint, the savepoint is released if possible, and the original
    /// error is returned.
    pub async fn with_savepoint<T, F>(&mut self, op: F) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        let name = self.create_savepoint(None).await?;
        match op(&mut *self).await {
            Ok(value) => {
                self.release_savepoint(&name).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self.rollback_to_savepoint(&name).await {
                    warn!(transaction_id = %self.id, savepoint = %name, error = %rb, "Rollback to savepoint failed");
                } else if let Err(rel) = self.release_savepoint(&name).await {
                    debug!(transaction_id = %self.id, savepoint = %name, error = %rel, "Release after rollback failed");
                }
                Err(e)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let id = self.id.clone();
        if self.driver_busy {
            warn!(transaction_id = %id, "Transaction dropped mid-statement; discarding connection");
            conn.discard();
            return;
        }
        let restore = self.restore_flag.take();
        warn!(transaction_id = %id, "Transaction dropped while active; rolling back");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.run_control("ROLLBACK").await {
                        warn!(transaction_id = %id, error = %e, "Rollback of dropped transaction failed");
                        conn.discard();
                        return;
                    }
                    if let Some((pragma, prior)) = restore {
                        if conn
                            .run_control(&format!("PRAGMA {pragma} = {prior}"))
                            .await
                            .is_err()
                        {
                            conn.discard();
                        }
                    }
                });
            }
            // No runtime to roll back on; closing the connection aborts the transaction
            Err(_) => conn.discard(),
        }
    }
}

/// Issue BEGIN and apply the isolation plan. Returns the flag to restore, if any.
async fn open_transaction(
    conn: &mut DbConnection,
    dialect: &dyn Dialect,
    level: Option<IsolationLevel>,
) -> DbResult<Option<(&'static str, i64)>> {
    let plan = level.map(|l| dialect.isolation_plan(l));

    if let Some(IsolationPlan::BeforeBegin(sql)) = &plan {
        conn.run_control(sql).await?;
    }
    conn.run_control(dialect.begin_statement()).await?;

    match plan {
        Some(IsolationPlan::AfterBegin(sql)) => {
            conn.run_control(&sql).await?;
            Ok(None)
        }
        Some(IsolationPlan::SessionFlag { pragma, value }) => {
            let prior = conn
                .fetch_i64(&format!("PRAGMA {pragma}"))
                .await?
                .unwrap_or(0);
            conn.run_control(&format!("PRAGMA {pragma} = {value}")).await?;
            Ok(Some((pragma, prior)))
        }
        _ => Ok(None),
    }
}

enum WorkOutcome<T> {
    Finished(DbResult<T>),
    TimedOut,
}

/// Begins transactions on a connection manager's pool.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    manager: Arc<ConnectionManager>,
    default_timeout: Duration,
    span: Span,
}

impl TransactionManager {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let span = manager.span().clone();
        Self {
            manager,
            default_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Timeout for `with_transaction` when the options carry none.
    pub fn with_default_timeout(mut self, limit: Duration) -> Self {
        self.default_timeout = limit;
        self
    }

    /// Check out a connection and begin a transaction on it.
    ///
    /// The returned transaction is not subject to a timeout; use
    /// [`with_transaction`](Self::with_transaction) for that.
    pub async fn begin(&self, options: TransactionOptions) -> DbResult<Transaction> {
        let mut conn = self.manager.acquire().await?;
        let id = generate_transaction_id();
        let span = info_span!(parent: &self.span, "transaction", transaction_id = %id);

        let opened = open_transaction(&mut conn, self.manager.dialect(), options.isolation_level)
            .instrument(span.clone())
            .await;
        let restore_flag = match opened {
            Ok(flag) => flag,
            Err(e) => {
                warn!(transaction_id = %id, error = %e, "Failed to begin transaction");
                if conn.run_control("ROLLBACK").await.is_err() {
                    conn.discard();
                }
                return Err(e);
            }
        };

        info!(
            transaction_id = %id,
            vendor = %self.manager.vendor(),
            isolation = ?options.isolation_level,
            "Transaction started"
        );

        Ok(Transaction {
            id,
            vendor: self.manager.vendor(),
            conn: Some(conn),
            state: TransactionState::Active,
            savepoint_counter: 0,
            cancel: CancelHandle::default(),
            restore_flag,
            driver_busy: false,
            started_at: Utc::now(),
            query_timeout: self.manager.query_timeout(),
            span,
        })
    }

    /// Run `op` in a transaction.
    ///
    /// Commits when `op` succeeds and the transaction is still active; rolls back
    /// when it fails or was cancelled. If `op` outlives the timeout it is dropped
    /// at once and the transaction is cancelled and rolled back before a `Timeout`
    /// error is returned. A connection abandoned mid-statement is discarded rather
    /// than reused.
    pub async fn with_transaction<T, F>(&self, options: TransactionOptions, op: F) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        let limit = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let mut tx = self.begin(options).await?;
        let span = tx.span.clone();

        let outcome = {
            let work = op(&mut tx).instrument(span);
            tokio::select! {
                result = work => WorkOutcome::Finished(result),
                _ = sleep(limit) => WorkOutcome::TimedOut,
            }
        };

        match outcome {
            WorkOutcome::Finished(Ok(value)) => {
                if let Some(reason) = tx.cancel_reason().map(str::to_string) {
                    tx.rollback_logged().await;
                    return Err(DbError::cancelled(reason));
                }
                if tx.is_active() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            WorkOutcome::Finished(Err(e)) => {
                debug!(transaction_id = %tx.id, error = %e, "Unit of work failed; rolling back");
                tx.rollback_logged().await;
                Err(e)
            }
            WorkOutcome::TimedOut => {
                warn!(transaction_id = %tx.id, timeout_ms = limit.as_millis() as u64, "Transaction timed out; rolling back");
                tx.cancel(format!("transaction exceeded its {}ms timeout", limit.as_millis()));
                tx.rollback_logged().await;
                Err(DbError::timeout("transaction", limit))
            }
        }
    }
}

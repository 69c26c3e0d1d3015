//! Configuration handling for dbkit.
//!
//! CLI arguments and environment variables are parsed by [`Config`]; per-connection
//! pool and reconnection settings are resolved once into [`ResolvedPoolOptions`] and
//! [`ResolvedReconnectOptions`] before any connection is opened.

use crate::db::batch::{BatchOptions, DEFAULT_BATCH_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};
use crate::db::stream::{DEFAULT_CHUNK_SIZE, DEFAULT_SAMPLE_SIZE, StreamOptions};
use crate::models::{ConnectionConfig, Vendor};
use clap::Parser;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// Reconnection defaults
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Connection pool tuning. Every field is optional; see [`PoolOptions::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10 for MySQL/PostgreSQL, 1 for SQLite)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_before_acquire: Option<bool>,
}

/// Pool options with every default applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    /// `None` keeps idle connections forever (required for in-memory SQLite)
    pub idle_timeout: Option<Duration>,
    pub acquire_timeout: Duration,
    pub test_before_acquire: bool,
}

impl PoolOptions {
    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        if self.acquire_timeout_secs == Some(0) {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Fill unset fields of `self` from `fallback`.
    pub fn merged_over(&self, fallback: &PoolOptions) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections.or(fallback.max_connections),
            min_connections: self.min_connections.or(fallback.min_connections),
            idle_timeout_secs: self.idle_timeout_secs.or(fallback.idle_timeout_secs),
            acquire_timeout_secs: self.acquire_timeout_secs.or(fallback.acquire_timeout_secs),
            test_before_acquire: self.test_before_acquire.or(fallback.test_before_acquire),
        }
    }

    /// Apply vendor defaults.
    ///
    /// SQLite is capped at a single connection. A private in-memory database exists
    /// only inside its connection, so it is pinned open: one connection, no idle
    /// timeout.
    pub fn resolve(&self, vendor: Vendor, in_memory: bool) -> Result<ResolvedPoolOptions, String> {
        self.validate()?;

        let default_max = if vendor == Vendor::SQLite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        };
        let mut max_connections = self.max_connections.unwrap_or(default_max);
        let mut min_connections = self
            .min_connections
            .unwrap_or(DEFAULT_MIN_CONNECTIONS)
            .min(max_connections);
        let mut idle_timeout = Some(Duration::from_secs(
            self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
        ));

        if vendor == Vendor::SQLite {
            max_connections = max_connections.min(DEFAULT_MAX_CONNECTIONS_SQLITE);
            min_connections = min_connections.min(max_connections);
        }
        if in_memory {
            max_connections = 1;
            min_connections = 1;
            idle_timeout = None;
        }

        Ok(ResolvedPoolOptions {
            max_connections,
            min_connections,
            idle_timeout,
            acquire_timeout: Duration::from_secs(
                self.acquire_timeout_secs
                    .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            ),
            test_before_acquire: self.test_before_acquire.unwrap_or(true),
        })
    }
}

/// Reconnection policy for dropped connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectOptions {
    /// First retry delay in milliseconds (default: 500)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    /// Upper bound on the delay between retries in milliseconds (default: 30000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Attempts before giving up; 0 retries forever (default: 5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Reconnection policy with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedReconnectOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0 means unlimited
    pub max_attempts: u32,
}

impl ReconnectOptions {
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(base), Some(max)) = (self.base_delay_ms, self.max_delay_ms) {
            if base > max {
                return Err(format!(
                    "base_delay_ms ({}) cannot exceed max_delay_ms ({})",
                    base, max
                ));
            }
        }
        Ok(())
    }

    pub fn resolve(&self) -> Result<ResolvedReconnectOptions, String> {
        self.validate()?;
        let base_delay = self.base_delay_ms.unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS);
        let max_delay = self
            .max_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS)
            .max(base_delay);
        Ok(ResolvedReconnectOptions {
            base_delay: Duration::from_millis(base_delay),
            max_delay: Duration::from_millis(max_delay),
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS),
        })
    }
}

impl ResolvedReconnectOptions {
    /// Delay before the given 1-based attempt: `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether the given 1-based attempt is within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Defaults applied by the operation handlers, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct OperationDefaults {
    /// Used when an operation does not name a connection
    pub default_connection: Option<ConnectionConfig>,
    pub query_timeout: Duration,
    pub transaction_timeout: Duration,
    pub batch: BatchOptions,
    pub stream: StreamOptions,
}

impl Default for OperationDefaults {
    fn default() -> Self {
        Self {
            default_connection: None,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            transaction_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            batch: BatchOptions::default(),
            stream: StreamOptions::default(),
        }
    }
}

/// Configuration for the dbkit server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbkit",
    about = "MCP server for vendor-agnostic relational database access",
    version,
    author
)]
pub struct Config {
    /// Default database connection string used when a tool call names no connection.
    #[arg(short = 'd', long = "database", value_name = "URL", env = "DBKIT_DATABASE")]
    pub database: Option<String>,

    /// Query timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "DBKIT_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Transaction timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_TRANSACTION_TIMEOUT_SECS,
        env = "DBKIT_TRANSACTION_TIMEOUT"
    )]
    pub transaction_timeout: u64,

    /// Items per batch for batch writes
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, env = "DBKIT_BATCH_SIZE")]
    pub batch_size: usize,

    /// Extra attempts for a failed batch
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "DBKIT_BATCH_MAX_RETRIES")]
    pub batch_max_retries: u32,

    /// Delay between batch retries in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS, env = "DBKIT_BATCH_RETRY_DELAY_MS")]
    pub batch_retry_delay_ms: u64,

    /// Rows fetched per chunk by streaming selects
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "DBKIT_STREAM_CHUNK_SIZE")]
    pub stream_chunk_size: usize,

    /// Rows kept as a sample by streaming selects
    #[arg(long, default_value_t = DEFAULT_SAMPLE_SIZE, env = "DBKIT_STREAM_SAMPLE_SIZE")]
    pub stream_sample_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBKIT_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBKIT_JSON_LOGS")]
    pub json_logs: bool,

    /// Enable logging output (disabled by default to avoid interfering with stdio transport)
    #[arg(long, env = "DBKIT_ENABLE_LOGS")]
    pub enable_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            database: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_max_retries: DEFAULT_MAX_RETRIES,
            batch_retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
            stream_sample_size: DEFAULT_SAMPLE_SIZE,
            log_level: "info".to_string(),
            json_logs: false,
            enable_logs: false,
        }
    }

    /// Get the query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Get the transaction timeout as a Duration.
    pub fn transaction_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout)
    }

    /// Resolve the defaults used by the operation handlers.
    pub fn operation_defaults(&self) -> Result<OperationDefaults, String> {
        let default_connection = self
            .database
            .as_deref()
            .map(ConnectionConfig::from_url)
            .transpose()
            .map_err(|e| e.to_string())?;

        Ok(OperationDefaults {
            default_connection,
            query_timeout: self.query_timeout_duration(),
            transaction_timeout: self.transaction_timeout_duration(),
            batch: BatchOptions {
                batch_size: self.batch_size,
                max_retries: self.batch_max_retries,
                retry_delay: Duration::from_millis(self.batch_retry_delay_ms),
                continue_on_error: false,
            },
            stream: StreamOptions {
                chunk_size: self.stream_chunk_size,
                sample_size: self.stream_sample_size,
                ..StreamOptions::default()
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

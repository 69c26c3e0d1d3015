//! Connection-related data models.
//!
//! A [`ConnectionConfig`] names the vendor and either a connection string or a
//! structured descriptor, plus optional pool tuning and reconnection policy.

use crate::config::{PoolOptions, ReconnectOptions};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Supported database vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    #[serde(alias = "postgres")]
    PostgreSQL,
    /// Includes MariaDB
    #[serde(alias = "mariadb")]
    MySQL,
    SQLite,
}

impl Vendor {
    /// Detect the vendor from a connection string scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Default port for network vendors.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, Self::SQLite)
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Structured descriptor for PostgreSQL and MySQL servers.
#[derive(Clone, Serialize, Deserialize, JsonSchema)]
pub struct NetworkDescriptor {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Never serialized back out
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// `true` requires TLS, `false` disables it, absent lets the driver decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
}

impl fmt::Debug for NetworkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("ssl", &self.ssl)
            .finish()
    }
}

/// File path (or `:memory:`) for SQLite.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmbeddedDescriptor {
    pub path: String,
}

impl EmbeddedDescriptor {
    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

/// Where to connect: a connection string or a structured descriptor.
#[derive(Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ConnectionTarget {
    /// Contains sensitive data - never log unmasked
    Url(String),
    Network(NetworkDescriptor),
    Embedded(EmbeddedDescriptor),
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(&mask_connection_string(url)).finish(),
            Self::Network(desc) => f.debug_tuple("Network").field(desc).finish(),
            Self::Embedded(desc) => f.debug_tuple("Embedded").field(desc).finish(),
        }
    }
}

/// Configuration for a database connection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub vendor: Vendor,
    pub connection: ConnectionTarget,
    #[serde(default)]
    pub pool: PoolOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectOptions>,
}

/// Pool option keys accepted as connection string query parameters.
const POOL_OPTION_KEYS: &[&str] = &[
    "max_connections",
    "min_connections",
    "idle_timeout",
    "acquire_timeout",
    "test_before_acquire",
];

impl ConnectionConfig {
    /// Build a configuration from a connection string, detecting the vendor from its scheme.
    pub fn from_url(connection_string: impl Into<String>) -> Result<Self, ConnectionConfigError> {
        let connection_string = connection_string.into();
        let vendor = Vendor::from_connection_string(&connection_string).ok_or_else(|| {
            ConnectionConfigError::UnknownVendor(mask_connection_string(&connection_string))
        })?;
        let config = Self {
            vendor,
            connection: ConnectionTarget::Url(connection_string),
            pool: PoolOptions::default(),
            reconnect: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// SQLite database stored in a file.
    pub fn sqlite_file(path: impl Into<String>) -> Self {
        Self {
            vendor: Vendor::SQLite,
            connection: ConnectionTarget::Embedded(EmbeddedDescriptor { path: path.into() }),
            pool: PoolOptions::default(),
            reconnect: None,
        }
    }

    /// Private in-memory SQLite database.
    pub fn sqlite_memory() -> Self {
        Self::sqlite_file(":memory:")
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Check that the target matches the vendor and the pool options are coherent.
    pub fn validate(&self) -> Result<(), ConnectionConfigError> {
        match (&self.connection, self.vendor) {
            (ConnectionTarget::Url(url), vendor) => {
                let detected = Vendor::from_connection_string(url).ok_or_else(|| {
                    ConnectionConfigError::UnknownVendor(mask_connection_string(url))
                })?;
                if detected != vendor {
                    return Err(ConnectionConfigError::VendorMismatch {
                        declared: vendor,
                        detected,
                    });
                }
                if vendor != Vendor::SQLite {
                    Url::parse(url)
                        .map_err(|e| ConnectionConfigError::InvalidUrl(e.to_string()))?;
                }
            }
            (ConnectionTarget::Network(_), Vendor::SQLite) => {
                return Err(ConnectionConfigError::UnsupportedTarget {
                    vendor: Vendor::SQLite,
                    expected: "a file path or :memory:",
                });
            }
            (ConnectionTarget::Embedded(_), vendor) if vendor != Vendor::SQLite => {
                return Err(ConnectionConfigError::UnsupportedTarget {
                    vendor,
                    expected: "host, database and credentials",
                });
            }
            (ConnectionTarget::Embedded(desc), _) if desc.path.trim().is_empty() => {
                return Err(ConnectionConfigError::EmptyPath);
            }
            (ConnectionTarget::Network(desc), _) if desc.host.trim().is_empty() => {
                return Err(ConnectionConfigError::EmptyHost);
            }
            _ => {}
        }
        self.pool
            .validate()
            .map_err(ConnectionConfigError::InvalidPoolOptions)?;
        if let Some(reconnect) = &self.reconnect {
            reconnect
                .validate()
                .map_err(ConnectionConfigError::InvalidReconnectOptions)?;
        }
        Ok(())
    }

    /// True for a private in-memory SQLite database.
    pub fn is_in_memory(&self) -> bool {
        match &self.connection {
            ConnectionTarget::Embedded(desc) => desc.is_memory(),
            ConnectionTarget::Url(url) => {
                let lower = url.to_lowercase();
                lower.starts_with("sqlite::memory:") || lower.contains("mode=memory")
            }
            ConnectionTarget::Network(_) => false,
        }
    }

    /// Display-safe description of the target (credentials masked).
    pub fn masked_target(&self) -> String {
        match &self.connection {
            ConnectionTarget::Url(url) => mask_connection_string(url),
            ConnectionTarget::Network(desc) => {
                let port = desc.port.or(self.vendor.default_port()).unwrap_or_default();
                format!("{}:{}/{}", desc.host, port, desc.database)
            }
            ConnectionTarget::Embedded(desc) => desc.path.clone(),
        }
    }

    /// Split pool options out of a connection string's query parameters.
    ///
    /// Returns the connection string with those keys removed (all other
    /// parameters are kept for the driver) and the options found, merged
    /// underneath the explicitly configured ones.
    pub fn url_with_pool_options(&self) -> Result<Option<(String, PoolOptions)>, ConnectionConfigError> {
        let ConnectionTarget::Url(raw) = &self.connection else {
            return Ok(None);
        };
        // `sqlite::memory:` and bare `sqlite:file.db` are not hierarchical URLs
        let Ok(mut url) = Url::parse(raw) else {
            return Ok(Some((raw.clone(), self.pool.clone())));
        };
        if url.query().is_none() {
            return Ok(Some((raw.clone(), self.pool.clone())));
        }
        let mut opts = extract_options(&mut url, POOL_OPTION_KEYS);
        let parsed = PoolOptions {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            min_connections: opts.remove("min_connections").and_then(|v| v.parse().ok()),
            idle_timeout_secs: opts.remove("idle_timeout").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: opts.remove("acquire_timeout").and_then(|v| v.parse().ok()),
            test_before_acquire: opts
                .remove("test_before_acquire")
                .and_then(|v| v.parse::<bool>().ok()),
        };
        let merged = self.pool.merged_over(&parsed);
        merged
            .validate()
            .map_err(ConnectionConfigError::InvalidPoolOptions)?;
        Ok(Some((url.to_string(), merged)))
    }
}

/// Extract our option keys from URL query params, keeping others for the driver.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

/// Replace the password of a connection string with `****`.
pub fn mask_connection_string(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("****")).is_err() {
                return "<connection string>".to_string();
            }
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<connection string>".to_string(),
    }
}

/// Errors that can occur when validating a connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Unknown database type in connection string: {0}")]
    UnknownVendor(String),

    #[error("Connection string is for {detected} but vendor is declared as {declared}")]
    VendorMismatch { declared: Vendor, detected: Vendor },

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("{vendor} connections require {expected}")]
    UnsupportedTarget {
        vendor: Vendor,
        expected: &'static str,
    },

    #[error("SQLite database path cannot be empty")]
    EmptyPath,

    #[error("Database host cannot be empty")]
    EmptyHost,

    #[error("Invalid pool options: {0}")]
    InvalidPoolOptions(String),

    #[error("Invalid reconnect options: {0}")]
    InvalidReconnectOptions(String),
}

impl From<ConnectionConfigError> for crate::error::DbError {
    fn from(err: ConnectionConfigError) -> Self {
        crate::error::DbError::invalid_input(err.to_string())
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Connection acquired, BEGIN not yet confirmed
    Pending,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Committed or rolled back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

//! Database Engine Contract and Core Types
//!
//! This module defines the operation set every engine adapter implements
//! ([`DatabaseAdapter`]) and the types that cross the adapter boundary.
//! Each engine (`PostgreSQL`, `MySQL`/`MariaDB`, `SQLite`) lives in its own
//! feature-gated submodule.
//!
//! # Adapter Lifecycle
//! An adapter is built from an immutable [`DatabaseConfig`], then
//! `connect()` opens its pool (or, for `SQLite`, its single connection).
//! Switching engines is destroy-then-recreate: the owner disconnects the old
//! adapter and builds a new one, it never mutates an existing instance.
//!
//! # Engine Isolation
//! Engine-specific catalog rows are decoded into private per-engine structs
//! and folded into the canonical [`model`] types before they leave the
//! adapter. The only code shared between engines is in [`shared`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DatabaseConfig;
use crate::error::{DbLensError, Result};
use crate::plan::ExplainReport;

pub mod model;
pub mod shared;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

pub use model::{SchemaSnapshot, TableStatistics};

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = DbLensError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "sqlite" | "sqlite3" => Ok(Self::SQLite),
            other => Err(DbLensError::configuration(format!(
                "Unknown engine '{other}' (expected postgres, mysql or sqlite)"
            ))),
        }
    }
}

/// Positional statement parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl QueryParam {
    /// Convert a JSON value; arrays and objects are bound as their JSON text
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                n.as_i64().map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int)
            }
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

/// Per-call execution options
///
/// `timeout_ms` and `max_rows` are clamped by [`shared::normalize_timeout`]
/// and [`shared::normalize_max_rows`]; `None` selects the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Refuse statements the safety analyzer classifies as mutations
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
    /// Attach an estimated plan to the result
    pub explain: bool,
    /// Attach an executed plan (read statements only)
    pub analyze: bool,
}

impl QueryOptions {
    #[must_use]
    pub fn read_only() -> Self {
        Self { read_only: true, ..Self::default() }
    }
}

/// Result column descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    /// Engine-native type name
    pub native_type: String,
}

/// One result row; keys follow result column order
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Query execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column descriptors, present even when no rows came back
    pub fields: Vec<FieldInfo>,

    /// At most `max_rows` rows
    pub rows: Vec<Row>,

    /// Rows the engine produced, before truncation
    pub row_count: u64,

    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// True when `rows` was cut at `max_rows`
    pub truncated: bool,

    pub execution_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExplainReport>,
}

/// Database adapter contract
///
/// Implemented once per engine and used through `Box<dyn DatabaseAdapter>`.
/// Every data operation fails with a connection error before `connect()`.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Engine this adapter talks to
    fn engine(&self) -> DatabaseType;

    /// Configuration the adapter was built from
    fn config(&self) -> &DatabaseConfig;

    /// Open the pool / connection; a no-op when already connected
    ///
    /// # Errors
    /// `Connection` on authentication, network or file-access failure
    async fn connect(&mut self) -> Result<()>;

    /// Release every underlying resource; safe when not connected
    async fn disconnect(&mut self) -> Result<()>;

    /// Execute one statement with positional parameters
    ///
    /// # Errors
    /// `QueryExecution` carrying the engine's message. Timeouts and
    /// read-only refusals use their own failure kinds.
    async fn query(&self, sql: &str, params: &[QueryParam], options: &QueryOptions)
        -> Result<QueryResult>;

    /// Capture a fresh snapshot of the live catalog
    ///
    /// # Errors
    /// `Introspection` when a catalog query fails
    async fn introspect(&self) -> Result<SchemaSnapshot>;

    /// Normalized plan plus recommendations. The statement is only executed
    /// when `analyze` is true.
    async fn explain(&self, sql: &str, analyze: bool) -> Result<ExplainReport>;

    /// Size, row and maintenance figures for one table (`name` or `schema.name`)
    ///
    /// # Errors
    /// `NotFound` when the table does not exist
    async fn table_statistics(&self, table: &str) -> Result<TableStatistics>;

    /// Pure state query
    fn is_connected(&self) -> bool;
}

/// Build the adapter matching `config.engine`
///
/// The adapter is returned unconnected; call [`DatabaseAdapter::connect`].
///
/// # Errors
/// `Configuration` when parameters are missing or the engine was not compiled in
pub fn create_adapter(config: DatabaseConfig) -> Result<Box<dyn DatabaseAdapter>> {
    config.validate()?;

    match config.engine {
        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => Ok(Box::new(postgres::PostgresAdapter::new(config))),
        #[cfg(not(feature = "postgres"))]
        DatabaseType::Postgres => Err(DbLensError::configuration(
            "PostgreSQL support not compiled in (enable the 'postgres' feature)",
        )),
        #[cfg(feature = "mysql")]
        DatabaseType::MySQL => Ok(Box::new(mysql::MySqlAdapter::new(config))),
        #[cfg(not(feature = "mysql"))]
        DatabaseType::MySQL => Err(DbLensError::configuration(
            "MySQL support not compiled in (enable the 'mysql' feature)",
        )),
        #[cfg(feature = "sqlite")]
        DatabaseType::SQLite => Ok(Box::new(sqlite::SqliteAdapter::new(config))),
        #[cfg(not(feature = "sqlite"))]
        DatabaseType::SQLite => Err(DbLensError::configuration(
            "SQLite support not compiled in (enable the 'sqlite' feature)",
        )),
    }
}

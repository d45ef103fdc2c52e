//! dblens - one normalized view over PostgreSQL, MySQL/MariaDB and SQLite
//!
//! Every engine is reached through the same [`DatabaseAdapter`] contract and
//! answers with the same canonical types: schema snapshots, query results,
//! table statistics and normalized execution plans.
//!
//! # Module Organization
//! - [`engine`] - the adapter contract, canonical schema model and the three adapters
//! - [`safety`] - lexical query safety analyzer (findings, complexity, confirmation)
//! - [`plan`] - tagged plan tree, visitor and recommendation engine
//! - [`config`] - adapter configuration and named connection profiles
//! - [`error`] - [`DbLensError`] and its stable codes
//! - [`output`] - JSON envelopes for the CLI and the MCP dispatcher
//! - [`mcp`] - JSON-RPC tool dispatcher over stdio
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod output;
pub mod plan;
pub mod safety;

pub use config::{
    list_connections, resolve_connection, save_connection, ConfigLocation, ConnectionParams,
    ConnectionRegistry, DatabaseConfig, PoolSettings, StoredConnection,
};
pub use engine::model::{Column, ForeignKey, Index, LogicalType, SchemaSnapshot, Table, TableStatistics};
pub use engine::{
    create_adapter, DatabaseAdapter, DatabaseType, FieldInfo, QueryOptions, QueryParam, QueryResult,
};
pub use error::{DbLensError, Result};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use plan::{ExplainReport, Plan, PlanNode, PlanNodeKind, Recommendation};
pub use safety::{analyze, Finding, FindingCode, QueryVerdict, Severity};

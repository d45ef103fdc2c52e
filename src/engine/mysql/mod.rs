//! `MySQL` / `MariaDB` Adapter
//!
//! Implements [`DatabaseAdapter`] on a `mysql_async` pool.
//!
//! # Implementation Notes
//! - The server flavor is detected once at connect (`VERSION()` contains
//!   "MariaDB") and selects the timeout variable and the analyze syntax
//! - `MySQL` enforces `MAX_EXECUTION_TIME` for reads only; every statement is
//!   also bounded by a runtime deadline that issues `KILL QUERY`
//! - Statements without parameters use the text protocol so that anything
//!   the server accepts (multi-result `SHOW`, admin commands) also works here
//! - The catalog is `information_schema`, scoped to `DATABASE()`

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use mysql_async::prelude::{Protocol, Queryable};
use mysql_async::{Column, Conn, Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Row, SslOpts};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::engine::model::{
    CheckConstraint, Column as SchemaColumn, ForeignKey, Function, Index, IndexColumn,
    LogicalType, MaintenanceStats, PrimaryKey, ReferentialAction, SchemaSnapshot, SnapshotMetadata,
    SortDirection, Table, TableStatistics, Trigger, UniqueConstraint, View,
};
use crate::engine::shared::{
    check_statement, elapsed_ms, embedded_plan_mode, group_by_key, normalize_max_rows,
    normalize_timeout, parse_enum_values, parse_qualified_name, quote_ident, strip_outer_parens,
    wants_exact_count, with_deadline, QuoteStyle, RowCollector, DEFAULT_TIMEOUT_MS,
};
use crate::engine::{
    DatabaseAdapter, DatabaseType, FieldInfo, QueryOptions, QueryParam, QueryResult,
    Row as JsonRow,
};
use crate::error::{DbLensError, Result};
use crate::plan::{ExplainReport, Plan};

pub mod plan;
pub mod types;
mod values;

use values::{to_mysql_value, value_to_json};

/// `ER_QUERY_TIMEOUT` (`MySQL` `MAX_EXECUTION_TIME`)
const ER_QUERY_TIMEOUT: u16 = 3024;
/// `ER_STATEMENT_TIMEOUT` (`MariaDB` `max_statement_time`)
const ER_STATEMENT_TIMEOUT: u16 = 1969;
/// `ER_CANT_EXECUTE_IN_READ_ONLY_TRANSACTION`
const ER_READ_ONLY_TRANSACTION: u16 = 1792;

/// Server identity captured at connect
#[derive(Debug, Clone)]
struct ServerInfo {
    version: String,
    mariadb: bool,
}

/// `MySQL`/`MariaDB` adapter backed by a connection pool
pub struct MySqlAdapter {
    config: DatabaseConfig,
    pool: Option<Pool>,
    server: Option<ServerInfo>,
}

impl MySqlAdapter {
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config, pool: None, server: None }
    }

    fn pool(&self) -> Result<&Pool> {
        self.pool.as_ref().ok_or_else(|| DbLensError::not_connected("mysql"))
    }

    fn is_mariadb(&self) -> bool {
        self.server.as_ref().is_some_and(|s| s.mariadb)
    }

    async fn acquire(&self) -> Result<Conn> {
        acquire(self.pool()?, &self.config).await
    }

    /// Best-effort cancellation of a statement that outlived its deadline
    async fn kill_query(&self, connection_id: u32) {
        let Ok(mut conn) = self.acquire().await else { return };
        if let Err(e) = conn.query_drop(format!("KILL QUERY {connection_id}")).await {
            warn!("Failed to cancel statement on connection {connection_id}: {e}");
        }
    }

    /// Session statements bounding one query: `(setup, teardown)`
    fn session_guards(&self, timeout_ms: u64, read_only: bool) -> (Vec<String>, Vec<String>) {
        let mut setup = Vec::new();
        let mut teardown = Vec::new();

        if self.is_mariadb() {
            #[allow(clippy::cast_precision_loss)]
            let seconds = timeout_ms as f64 / 1000.0;
            setup.push(format!("SET SESSION max_statement_time = {seconds:.3}"));
            teardown.push("SET SESSION max_statement_time = DEFAULT".to_string());
        } else {
            setup.push(format!("SET SESSION MAX_EXECUTION_TIME = {timeout_ms}"));
            teardown.push("SET SESSION MAX_EXECUTION_TIME = DEFAULT".to_string());
        }
        if read_only {
            setup.push("START TRANSACTION READ ONLY".to_string());
            teardown.insert(0, "ROLLBACK".to_string());
        }
        (setup, teardown)
    }

    /// [`DatabaseAdapter::explain`] with positional parameters and a
    /// statement timeout, used for plans embedded in query results
    ///
    /// # Errors
    /// `QueryExecution` when the statement cannot be planned
    pub async fn explain_with(
        &self,
        sql: &str,
        params: &[QueryParam],
        analyze: bool,
        timeout_ms: u64,
    ) -> Result<ExplainReport> {
        let mariadb = self.is_mariadb();
        let mut conn = self.acquire().await?;
        let statement = sql.trim().trim_end_matches(';');

        let (plan, analyzed) = with_deadline(timeout_ms, async {
            if !analyze {
                let plan = json_explain(&mut conn, &format!("EXPLAIN FORMAT=JSON {statement}"), params).await?;
                return Ok((plan, false));
            }

            conn.query_drop("START TRANSACTION").await.map_err(|e| statement_error(&e, timeout_ms))?;
            let outcome = if mariadb {
                json_explain(&mut conn, &format!("ANALYZE FORMAT=JSON {statement}"), params)
                    .await
                    .map(|plan| (plan, true))
            } else {
                match tree_explain(&mut conn, &format!("EXPLAIN ANALYZE {statement}"), params).await {
                    Ok(plan) => Ok((plan, true)),
                    // EXPLAIN ANALYZE needs MySQL 8.0.18+
                    Err(e) => {
                        warn!("EXPLAIN ANALYZE unavailable, using estimated plan: {e}");
                        json_explain(&mut conn, &format!("EXPLAIN FORMAT=JSON {statement}"), params)
                            .await
                            .map(|plan| (plan, false))
                    }
                }
            };
            if let Err(e) = conn.query_drop("ROLLBACK").await {
                warn!("Failed to roll back EXPLAIN transaction: {e}");
            }
            outcome
        })
        .await?;

        Ok(ExplainReport::build(DatabaseType::MySQL, analyzed, plan))
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn engine(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn connect(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Ok(());
        }

        let pool = Pool::new(build_opts(&self.config)?);
        let mut conn = acquire(&pool, &self.config).await?;
        let version: String = conn
            .query_first("SELECT VERSION()")
            .await
            .map_err(|e| DbLensError::connection(format!("Failed to query server version: {e}")))?
            .unwrap_or_default();
        drop(conn);

        let server = ServerInfo { mariadb: version.to_ascii_lowercase().contains("mariadb"), version };
        info!(
            "Connected to {} {} at {}",
            if server.mariadb { "MariaDB" } else { "MySQL" },
            server.version,
            self.config.describe()
        );

        self.server = Some(server);
        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.server = None;
        if let Some(pool) = self.pool.take() {
            pool.disconnect()
                .await
                .map_err(|e| DbLensError::connection(format!("Failed to close MySQL pool: {e}")))?;
            info!("Disconnected from {}", self.config.describe());
        }
        Ok(())
    }

    async fn query(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let kind = check_statement(sql, options)?;
        let timeout_ms = normalize_timeout(options.timeout_ms);
        let max_rows = normalize_max_rows(options.max_rows);
        let (setup, teardown) = self.session_guards(timeout_ms, options.read_only);

        let mut conn = self.acquire().await?;
        let connection_id = conn.id();
        let start = Instant::now();

        let outcome = with_deadline(timeout_ms, async {
            for statement in &setup {
                conn.query_drop(statement).await.map_err(|e| statement_error(&e, timeout_ms))?;
            }
            let outcome = run_statement(&mut conn, sql, params, max_rows, timeout_ms, kind.is_mutation()).await;
            for statement in &teardown {
                if let Err(e) = conn.query_drop(statement).await {
                    warn!("Failed to restore session after query: {e}");
                }
            }
            outcome
        })
        .await;

        let mut result = match outcome {
            Err(e) if e.is_timeout() => {
                self.kill_query(connection_id).await;
                return Err(e);
            }
            other => other?,
        };

        result.execution_ms = elapsed_ms(start);
        debug!(
            "Query returned {} row(s) in {}ms (truncated: {})",
            result.row_count, result.execution_ms, result.truncated
        );

        if let Some(analyze) = embedded_plan_mode(options, kind) {
            match self.explain_with(sql, params, analyze, timeout_ms).await {
                Ok(report) => result.plan = Some(report),
                Err(e) => warn!("Could not attach plan to query result: {e}"),
            }
        }

        Ok(result)
    }

    async fn introspect(&self) -> Result<SchemaSnapshot> {
        let mut conn = self.acquire().await?;
        let start = Instant::now();
        let captured_at = Utc::now();

        let meta: Option<Row> = conn.query_first(METADATA_SQL).await.map_err(|e| catalog_error("server metadata", &e))?;
        let meta = meta.ok_or_else(|| DbLensError::introspection("Server returned no metadata"))?;
        let version: String = cell(&meta, 0)?;
        let database: Option<String> = cell(&meta, 1)?;
        let Some(database) = database else {
            return Err(DbLensError::introspection("No database selected on this connection"));
        };

        let relations = load_relations(&mut conn).await?;
        let mut columns = load_columns(&mut conn).await?;
        let mut key_constraints = load_key_constraints(&mut conn).await?;
        let mut checks = optional("check constraints", load_check_constraints(&mut conn).await);
        let mut indexes = load_indexes(&mut conn).await?;
        let mut view_definitions = load_view_definitions(&mut conn).await?;

        let mut tables = Vec::new();
        let mut views = Vec::new();
        for relation in relations {
            let table_columns = columns.remove(&relation.name).unwrap_or_default();

            if relation.is_view {
                views.push(View {
                    definition: view_definitions.remove(&relation.name).flatten(),
                    name: relation.name,
                    schema: Some(database.clone()),
                    columns: table_columns,
                    materialized: false,
                });
                continue;
            }

            let mut table = Table::new(relation.name.clone(), Some(database.clone()));
            table.columns = table_columns;
            apply_key_constraints(&mut table, key_constraints.remove(&relation.name).unwrap_or_default());
            table.check_constraints = checks.remove(&relation.name).unwrap_or_default();
            table.indexes = indexes.remove(&relation.name).unwrap_or_default();
            table.size_bytes = relation.size_bytes;
            table.comment = relation.comment.filter(|c| !c.is_empty());
            table.row_count = relation.estimated_rows;

            if wants_exact_count(relation.estimated_rows) {
                match exact_count(&mut conn, &relation.name).await {
                    Ok(count) => table.row_count = Some(count),
                    Err(e) => warn!("Exact count for {} failed: {e}", relation.name),
                }
            }
            tables.push(table);
        }

        let functions = optional("routines", load_functions(&mut conn, &database).await);
        let triggers = optional("triggers", load_triggers(&mut conn, &database).await);
        let charset: Option<String> = cell(&meta, 2)?;
        let collation: Option<String> = cell(&meta, 3)?;

        let duration_ms = elapsed_ms(start);
        info!("Introspected {} table(s) in {duration_ms}ms", tables.len());

        Ok(SchemaSnapshot {
            tables,
            views,
            sequences: Vec::new(),
            functions,
            triggers,
            metadata: SnapshotMetadata {
                engine: DatabaseType::MySQL,
                version,
                database: Some(database),
                charset,
                collation,
                captured_at,
                duration_ms,
            },
        })
    }

    async fn explain(&self, sql: &str, analyze: bool) -> Result<ExplainReport> {
        self.explain_with(sql, &[], analyze, DEFAULT_TIMEOUT_MS).await
    }

    async fn table_statistics(&self, table: &str) -> Result<TableStatistics> {
        let name = parse_qualified_name(table)?;
        let mut conn = self.acquire().await?;

        let row: Option<Row> = conn
            .exec_first(TABLE_STATISTICS_SQL, (name.name.clone(), name.schema.clone()))
            .await
            .map_err(|e| catalog_error("table statistics", &e))?;
        let row = row.ok_or_else(|| DbLensError::not_found(format!("Table '{table}' does not exist")))?;

        let schema: String = cell(&row, 0)?;
        let relname: String = cell(&row, 1)?;
        let estimated: Option<u64> = cell(&row, 2)?;

        let (row_count, row_count_exact) = if wants_exact_count(estimated) {
            let qualified = format!(
                "{}.{}",
                quote_ident(&schema, QuoteStyle::Backtick),
                quote_ident(&relname, QuoteStyle::Backtick)
            );
            match count_rows(&mut conn, &qualified).await {
                Ok(count) => (Some(count), true),
                Err(e) => {
                    warn!("Exact count for {schema}.{relname} failed: {e}");
                    (estimated, false)
                }
            }
        } else {
            (estimated, false)
        };

        let data: Option<u64> = cell(&row, 3)?;
        let index: Option<u64> = cell(&row, 4)?;
        let index_count: Option<u64> = cell(&row, 6)?;

        Ok(TableStatistics {
            table: relname,
            schema: Some(schema),
            row_count,
            row_count_exact,
            table_size_bytes: data,
            index_size_bytes: index,
            total_size_bytes: match (data, index) {
                (Some(d), Some(i)) => Some(d + i),
                _ => None,
            },
            index_count: index_count.and_then(|c| u32::try_from(c).ok()),
            maintenance: MaintenanceStats {
                reclaimable_bytes: cell(&row, 5)?,
                last_modified: cell(&row, 7)?,
                storage_engine: cell(&row, 8)?,
                ..MaintenanceStats::default()
            },
        })
    }

    fn is_connected(&self) -> bool {
        self.pool.is_some()
    }
}

// ---------------------------------------------------------------------------
// Connection management
// ---------------------------------------------------------------------------

/// Build `MySQL` connection options from a connection string or parameters
fn build_opts(config: &DatabaseConfig) -> Result<Opts> {
    let builder = if let Some(url) = &config.connection_string {
        let opts = Opts::from_url(url).map_err(|e| {
            DbLensError::configuration(format!("Invalid MySQL connection string: {e}"))
        })?;
        OptsBuilder::from_opts(opts)
    } else {
        OptsBuilder::default()
            .ip_or_hostname(config.host.clone().unwrap_or_else(|| "localhost".to_string()))
            .tcp_port(config.port_or_default())
            .user(config.user.clone())
            .pass(config.password.clone())
            .db_name(config.database.clone())
    };

    let settings = &config.pool;
    let constraints = PoolConstraints::new(settings.min_size as usize, settings.max_size as usize)
        .ok_or_else(|| DbLensError::configuration("Pool min_size exceeds max_size"))?;
    let mut pool_opts = PoolOpts::default().with_constraints(constraints);
    if settings.idle_timeout_ms > 0 {
        pool_opts = pool_opts.with_inactive_connection_ttl(settings.idle_timeout());
    }

    let mut builder = builder.pool_opts(pool_opts);
    if config.ssl {
        builder = builder.ssl_opts(SslOpts::default());
    }
    Ok(builder.into())
}

async fn acquire(pool: &Pool, config: &DatabaseConfig) -> Result<Conn> {
    match tokio::time::timeout(config.pool.acquire_timeout(), pool.get_conn()).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(DbLensError::connection(format!("Failed to connect to MySQL: {e}"))),
        Err(_) => Err(DbLensError::connection(format!(
            "Timed out after {}ms acquiring a MySQL connection",
            config.pool.acquire_timeout_ms
        ))),
    }
}

fn statement_error(e: &mysql_async::Error, timeout_ms: u64) -> DbLensError {
    match e {
        mysql_async::Error::Server(server) => match server.code {
            ER_QUERY_TIMEOUT | ER_STATEMENT_TIMEOUT => {
                DbLensError::timeout(format!("Query exceeded timeout of {timeout_ms}ms"))
            }
            ER_READ_ONLY_TRANSACTION => DbLensError::read_only(server.message.clone()),
            _ => DbLensError::query(server.message.clone()),
        },
        other => DbLensError::query(other.to_string()),
    }
}

fn catalog_error(what: &str, e: &mysql_async::Error) -> DbLensError {
    DbLensError::introspection(format!("Failed to read {what}: {e}"))
}

// ---------------------------------------------------------------------------
// Query execution
// ---------------------------------------------------------------------------

async fn run_statement(
    conn: &mut Conn,
    sql: &str,
    params: &[QueryParam],
    max_rows: usize,
    timeout_ms: u64,
    mutation: bool,
) -> Result<QueryResult> {
    if params.is_empty() {
        let result = conn.query_iter(sql).await.map_err(|e| statement_error(&e, timeout_ms))?;
        collect(result, max_rows, timeout_ms, mutation).await
    } else {
        let values = Params::Positional(params.iter().map(to_mysql_value).collect());
        let result = conn.exec_iter(sql, values).await.map_err(|e| statement_error(&e, timeout_ms))?;
        collect(result, max_rows, timeout_ms, mutation).await
    }
}

/// Drain the first result set, then discard any that follow
async fn collect<P: Protocol>(
    mut result: mysql_async::QueryResult<'_, 'static, P>,
    max_rows: usize,
    timeout_ms: u64,
    mutation: bool,
) -> Result<QueryResult> {
    let columns: Vec<Column> = result.columns().map(|c| c.to_vec()).unwrap_or_default();
    let fields: Vec<FieldInfo> = columns
        .iter()
        .map(|c| FieldInfo {
            name: c.name_str().to_string(),
            native_type: types::column_type_name(c).to_string(),
        })
        .collect();

    if fields.is_empty() {
        let affected = result.affected_rows();
        result.drop_result().await.map_err(|e| statement_error(&e, timeout_ms))?;
        return Ok(QueryResult {
            fields,
            rows: Vec::new(),
            row_count: 0,
            rows_affected: Some(affected),
            truncated: false,
            execution_ms: 0,
            plan: None,
        });
    }

    let mut collector = RowCollector::new(max_rows);
    while let Some(row) = result.next().await.map_err(|e| statement_error(&e, timeout_ms))? {
        if !collector.accept() {
            continue;
        }
        let mut out = JsonRow::new();
        for (idx, column) in columns.iter().enumerate() {
            let value = row.as_ref(idx).map_or(serde_json::Value::Null, |v| value_to_json(v, column));
            out.insert(column.name_str().to_string(), value);
        }
        collector.push(out);
    }
    result.drop_result().await.map_err(|e| statement_error(&e, timeout_ms))?;

    let (rows, row_count, truncated) = collector.finish();
    Ok(QueryResult {
        fields,
        rows,
        row_count,
        rows_affected: mutation.then_some(row_count),
        truncated,
        execution_ms: 0,
        plan: None,
    })
}

async fn first_text(conn: &mut Conn, sql: &str, params: &[QueryParam]) -> Result<String> {
    let fetched = if params.is_empty() {
        conn.query_first::<String, _>(sql).await
    } else {
        let values = Params::Positional(params.iter().map(to_mysql_value).collect());
        conn.exec_first::<String, _, _>(sql, values).await
    };
    let text = fetched.map_err(|e| statement_error(&e, DEFAULT_TIMEOUT_MS))?;
    text.ok_or_else(|| DbLensError::query("EXPLAIN returned no output"))
}

async fn json_explain(conn: &mut Conn, sql: &str, params: &[QueryParam]) -> Result<Plan> {
    plan::parse_json_plan(&first_text(conn, sql, params).await?)
}

async fn tree_explain(conn: &mut Conn, sql: &str, params: &[QueryParam]) -> Result<Plan> {
    plan::parse_tree_plan(&first_text(conn, sql, params).await?)
}

// ---------------------------------------------------------------------------
// Catalog decoding
// ---------------------------------------------------------------------------

const METADATA_SQL: &str =
    "SELECT VERSION(), DATABASE(), @@character_set_database, @@collation_database";

const RELATIONS_SQL: &str = "
SELECT TABLE_NAME, TABLE_TYPE, TABLE_ROWS, DATA_LENGTH + INDEX_LENGTH, TABLE_COMMENT
FROM information_schema.TABLES
WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE IN ('BASE TABLE', 'VIEW', 'SYSTEM VERSIONED')
ORDER BY TABLE_NAME";

const COLUMNS_SQL: &str = "
SELECT TABLE_NAME, COLUMN_NAME, ORDINAL_POSITION, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE,
       COLUMN_DEFAULT, EXTRA, CHARACTER_MAXIMUM_LENGTH, NUMERIC_PRECISION, NUMERIC_SCALE,
       DATETIME_PRECISION, COLUMN_COMMENT
FROM information_schema.COLUMNS
WHERE TABLE_SCHEMA = DATABASE()
ORDER BY TABLE_NAME, ORDINAL_POSITION";

// One row per constrained column
const KEY_CONSTRAINTS_SQL: &str = "
SELECT kcu.TABLE_NAME, kcu.CONSTRAINT_NAME, tc.CONSTRAINT_TYPE, kcu.COLUMN_NAME,
       kcu.ORDINAL_POSITION, kcu.REFERENCED_TABLE_SCHEMA, kcu.REFERENCED_TABLE_NAME,
       kcu.REFERENCED_COLUMN_NAME, rc.UPDATE_RULE, rc.DELETE_RULE
FROM information_schema.KEY_COLUMN_USAGE kcu
JOIN information_schema.TABLE_CONSTRAINTS tc
  ON tc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
 AND tc.TABLE_NAME = kcu.TABLE_NAME
 AND tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
LEFT JOIN information_schema.REFERENTIAL_CONSTRAINTS rc
  ON rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
 AND rc.TABLE_NAME = kcu.TABLE_NAME
 AND rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
WHERE kcu.TABLE_SCHEMA = DATABASE()
  AND tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'UNIQUE', 'FOREIGN KEY')
ORDER BY kcu.TABLE_NAME, kcu.CONSTRAINT_NAME, kcu.ORDINAL_POSITION";

const CHECK_CONSTRAINTS_SQL: &str = "
SELECT tc.TABLE_NAME, cc.CONSTRAINT_NAME, cc.CHECK_CLAUSE
FROM information_schema.CHECK_CONSTRAINTS cc
JOIN information_schema.TABLE_CONSTRAINTS tc
  ON tc.CONSTRAINT_SCHEMA = cc.CONSTRAINT_SCHEMA
 AND tc.CONSTRAINT_NAME = cc.CONSTRAINT_NAME
 AND tc.CONSTRAINT_TYPE = 'CHECK'
WHERE cc.CONSTRAINT_SCHEMA = DATABASE()
ORDER BY tc.TABLE_NAME, cc.CONSTRAINT_NAME";

// One row per index column
const INDEXES_SQL: &str = "
SELECT TABLE_NAME, INDEX_NAME, NON_UNIQUE, SEQ_IN_INDEX, COLUMN_NAME, COLLATION, INDEX_TYPE
FROM information_schema.STATISTICS
WHERE TABLE_SCHEMA = DATABASE()
ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX";

const VIEWS_SQL: &str = "
SELECT TABLE_NAME, VIEW_DEFINITION
FROM information_schema.VIEWS
WHERE TABLE_SCHEMA = DATABASE()";

const ROUTINES_SQL: &str = "
SELECT r.ROUTINE_NAME, r.ROUTINE_TYPE, r.DTD_IDENTIFIER, r.ROUTINE_BODY,
       (SELECT GROUP_CONCAT(CONCAT_WS(' ', p.PARAMETER_MODE, p.PARAMETER_NAME, p.DTD_IDENTIFIER)
                            ORDER BY p.ORDINAL_POSITION SEPARATOR ', ')
        FROM information_schema.PARAMETERS p
        WHERE p.SPECIFIC_SCHEMA = r.ROUTINE_SCHEMA
          AND p.SPECIFIC_NAME = r.SPECIFIC_NAME
          AND p.ORDINAL_POSITION > 0)
FROM information_schema.ROUTINES r
WHERE r.ROUTINE_SCHEMA = DATABASE()
ORDER BY r.ROUTINE_NAME";

const TRIGGERS_SQL: &str = "
SELECT TRIGGER_NAME, EVENT_OBJECT_TABLE, ACTION_TIMING, EVENT_MANIPULATION, ACTION_STATEMENT
FROM information_schema.TRIGGERS
WHERE TRIGGER_SCHEMA = DATABASE()
ORDER BY EVENT_OBJECT_TABLE, TRIGGER_NAME";

const TABLE_STATISTICS_SQL: &str = "
SELECT t.TABLE_SCHEMA, t.TABLE_NAME, t.TABLE_ROWS, t.DATA_LENGTH, t.INDEX_LENGTH, t.DATA_FREE,
       (SELECT COUNT(DISTINCT s.INDEX_NAME) FROM information_schema.STATISTICS s
        WHERE s.TABLE_SCHEMA = t.TABLE_SCHEMA AND s.TABLE_NAME = t.TABLE_NAME),
       DATE_FORMAT(t.UPDATE_TIME, '%Y-%m-%dT%H:%i:%s'), t.ENGINE
FROM information_schema.TABLES t
WHERE t.TABLE_NAME = ?
  AND t.TABLE_SCHEMA = COALESCE(?, DATABASE())
  AND t.TABLE_TYPE = 'BASE TABLE'";

fn cell<T: mysql_async::prelude::FromValue>(row: &Row, idx: usize) -> Result<T> {
    match row.get_opt::<T, usize>(idx) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(DbLensError::introspection(format!(
            "Unexpected catalog value in column {idx}: {e}"
        ))),
        None => Err(DbLensError::introspection(format!("Catalog row has no column {idx}"))),
    }
}

fn optional<T: Default>(what: &str, loaded: Result<T>) -> T {
    loaded.unwrap_or_else(|e| {
        warn!("Skipping {what}: {e}");
        T::default()
    })
}

async fn count_rows(conn: &mut Conn, qualified: &str) -> Result<u64> {
    let count: Option<u64> = conn
        .query_first(format!("SELECT COUNT(*) FROM {qualified}"))
        .await
        .map_err(|e| DbLensError::query(e.to_string()))?;
    Ok(count.unwrap_or(0))
}

async fn exact_count(conn: &mut Conn, table: &str) -> Result<u64> {
    count_rows(conn, &quote_ident(table, QuoteStyle::Backtick)).await
}

struct RelationRow {
    name: String,
    is_view: bool,
    estimated_rows: Option<u64>,
    size_bytes: Option<u64>,
    comment: Option<String>,
}

async fn load_relations(conn: &mut Conn) -> Result<Vec<RelationRow>> {
    let rows: Vec<Row> = conn.query(RELATIONS_SQL).await.map_err(|e| catalog_error("tables", &e))?;
    rows.iter()
        .map(|row| {
            let table_type: String = cell(row, 1)?;
            let is_view = table_type == "VIEW";
            Ok(RelationRow {
                name: cell(row, 0)?,
                is_view,
                estimated_rows: if is_view { None } else { cell(row, 2)? },
                size_bytes: cell(row, 3)?,
                comment: cell(row, 4)?,
            })
        })
        .collect()
}

async fn load_columns(conn: &mut Conn) -> Result<BTreeMap<String, Vec<SchemaColumn>>> {
    let rows: Vec<Row> = conn.query(COLUMNS_SQL).await.map_err(|e| catalog_error("columns", &e))?;

    let clamp = |v: Option<u64>| v.map(|n| u32::try_from(n).unwrap_or(u32::MAX));

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let table: String = cell(row, 0)?;
        let data_type: String = cell(row, 3)?;
        let native_type: String = cell(row, 4)?;
        let nullable: String = cell(row, 5)?;
        let extra: Option<String> = cell(row, 7)?;
        let logical_type = types::map_type(&data_type, &native_type);

        let (length, precision, scale) = match logical_type {
            LogicalType::Text | LogicalType::Blob => {
                (clamp(cell(row, 8)?), None, None)
            }
            LogicalType::Decimal | LogicalType::Real => {
                (None, clamp(cell(row, 9)?), clamp(cell(row, 10)?))
            }
            LogicalType::Datetime | LogicalType::Time => {
                (None, clamp(cell(row, 11)?), None)
            }
            _ => (None, None, None),
        };

        let lowered = data_type.to_ascii_lowercase();
        let enum_values = if lowered == "enum" || lowered == "set" {
            parse_enum_values(&native_type)
        } else {
            None
        };

        decoded.push((
            table,
            SchemaColumn {
                name: cell(row, 1)?,
                ordinal: clamp(cell(row, 2)?).unwrap_or(0),
                logical_type,
                native_type,
                nullable: nullable.eq_ignore_ascii_case("YES"),
                default: cell(row, 6)?,
                auto_increment: extra.as_deref().is_some_and(|e| e.to_ascii_lowercase().contains("auto_increment")),
                length,
                precision,
                scale,
                enum_values,
                comment: cell::<Option<String>>(row, 12)?.filter(|c| !c.is_empty()),
            },
        ));
    }

    Ok(group_by_key(decoded, |(table, _)| table.clone())
        .into_iter()
        .map(|(table, mut cols)| {
            cols.sort_by_key(|(_, c)| c.ordinal);
            (table, cols.into_iter().map(|(_, c)| c).collect())
        })
        .collect())
}

struct KeyColumnRow {
    constraint: String,
    kind: String,
    column: String,
    position: u64,
    referenced_schema: Option<String>,
    referenced_table: Option<String>,
    referenced_column: Option<String>,
    on_update: Option<String>,
    on_delete: Option<String>,
}

async fn load_key_constraints(
    conn: &mut Conn,
) -> Result<BTreeMap<String, Vec<KeyColumnRow>>> {
    let rows: Vec<Row> =
        conn.query(KEY_CONSTRAINTS_SQL).await.map_err(|e| catalog_error("key constraints", &e))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let table: String = cell(row, 0)?;
        decoded.push((
            table,
            KeyColumnRow {
                constraint: cell(row, 1)?,
                kind: cell(row, 2)?,
                column: cell(row, 3)?,
                position: cell(row, 4)?,
                referenced_schema: cell(row, 5)?,
                referenced_table: cell(row, 6)?,
                referenced_column: cell(row, 7)?,
                on_update: cell(row, 8)?,
                on_delete: cell(row, 9)?,
            },
        ));
    }

    Ok(group_by_key(decoded, |(table, _)| table.clone())
        .into_iter()
        .map(|(table, group)| (table, group.into_iter().map(|(_, r)| r).collect()))
        .collect())
}

/// Fold per-column key rows into primary, unique and foreign keys
fn apply_key_constraints(table: &mut Table, rows: Vec<KeyColumnRow>) {
    for (name, mut parts) in group_by_key(rows, |r| r.constraint.clone()) {
        parts.sort_by_key(|p| p.position);
        let Some(head) = parts.first() else { continue };
        let columns: Vec<String> = parts.iter().map(|p| p.column.clone()).collect();

        match head.kind.as_str() {
            "PRIMARY KEY" => table.primary_key = Some(PrimaryKey { name: Some(name), columns }),
            "UNIQUE" => table.unique_constraints.push(UniqueConstraint { name, columns }),
            "FOREIGN KEY" => {
                let referenced_schema = head.referenced_schema.clone();
                let referenced_table = head.referenced_table.clone().unwrap_or_default();
                let on_update = ReferentialAction::parse(head.on_update.as_deref().unwrap_or_default());
                let on_delete = ReferentialAction::parse(head.on_delete.as_deref().unwrap_or_default());
                table.foreign_keys.push(ForeignKey {
                    name,
                    columns,
                    referenced_schema,
                    referenced_table,
                    referenced_columns: parts
                        .iter()
                        .map(|p| p.referenced_column.clone().unwrap_or_default())
                        .collect(),
                    on_delete,
                    on_update,
                });
            }
            _ => {}
        }
    }
}

async fn load_check_constraints(
    conn: &mut Conn,
) -> Result<BTreeMap<String, Vec<CheckConstraint>>> {
    let rows: Vec<Row> =
        conn.query(CHECK_CONSTRAINTS_SQL).await.map_err(|e| catalog_error("check constraints", &e))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let table: String = cell(row, 0)?;
        let clause: String = cell(row, 2)?;
        decoded.push((
            table,
            CheckConstraint { name: cell(row, 1)?, expression: strip_outer_parens(&clause).to_string() },
        ));
    }

    Ok(group_by_key(decoded, |(table, _)| table.clone())
        .into_iter()
        .map(|(table, group)| (table, group.into_iter().map(|(_, c)| c).collect()))
        .collect())
}

struct IndexColumnRow {
    non_unique: i64,
    position: u64,
    column: Option<String>,
    collation: Option<String>,
    method: String,
}

async fn load_indexes(conn: &mut Conn) -> Result<BTreeMap<String, Vec<Index>>> {
    let rows: Vec<Row> = conn.query(INDEXES_SQL).await.map_err(|e| catalog_error("indexes", &e))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let key: (String, String) = (cell(row, 0)?, cell(row, 1)?);
        decoded.push((
            key,
            IndexColumnRow {
                non_unique: cell(row, 2)?,
                position: cell(row, 3)?,
                column: cell(row, 4)?,
                collation: cell(row, 5)?,
                method: cell(row, 6)?,
            },
        ));
    }

    let mut by_table: BTreeMap<String, Vec<Index>> = BTreeMap::new();
    for ((table, name), mut parts) in group_by_key(decoded, |(key, _)| key.clone()) {
        parts.sort_by_key(|(_, p)| p.position);
        let Some((_, head)) = parts.first() else { continue };
        let index = Index {
            primary: name == "PRIMARY",
            unique: head.non_unique == 0,
            kind: head.method.clone(),
            predicate: None,
            columns: parts
                .iter()
                .map(|(_, p)| IndexColumn {
                    // Functional key parts have no column name
                    name: p.column.clone().unwrap_or_else(|| "<expression>".to_string()),
                    direction: if p.collation.as_deref() == Some("D") {
                        SortDirection::Desc
                    } else {
                        SortDirection::Asc
                    },
                })
                .collect(),
            name,
        };
        by_table.entry(table).or_default().push(index);
    }
    Ok(by_table)
}

async fn load_view_definitions(
    conn: &mut Conn,
) -> Result<BTreeMap<String, Option<String>>> {
    let rows: Vec<Row> = conn.query(VIEWS_SQL).await.map_err(|e| catalog_error("views", &e))?;
    rows.iter().map(|row| Ok((cell(row, 0)?, cell(row, 1)?))).collect()
}

async fn load_functions(conn: &mut Conn, database: &str) -> Result<Vec<Function>> {
    let rows: Vec<Row> = conn.query(ROUTINES_SQL).await.map_err(|e| catalog_error("routines", &e))?;
    rows.iter()
        .map(|row| {
            let kind: String = cell(row, 1)?;
            let arguments: Option<String> = cell(row, 4)?;
            Ok(Function {
                name: cell(row, 0)?,
                schema: Some(database.to_string()),
                kind: kind.to_ascii_uppercase(),
                arguments: Some(arguments.unwrap_or_default()),
                return_type: cell(row, 2)?,
                language: cell(row, 3)?,
            })
        })
        .collect()
}

async fn load_triggers(conn: &mut Conn, database: &str) -> Result<Vec<Trigger>> {
    let rows: Vec<Row> = conn.query(TRIGGERS_SQL).await.map_err(|e| catalog_error("triggers", &e))?;
    rows.iter()
        .map(|row| {
            let event: String = cell(row, 3)?;
            Ok(Trigger {
                name: cell(row, 0)?,
                schema: Some(database.to_string()),
                table: cell(row, 1)?,
                timing: cell(row, 2)?,
                events: vec![event],
                statement: cell(row, 4)?,
            })
        })
        .collect()
}

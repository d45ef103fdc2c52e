//! `SQLite` Adapter
//!
//! Implements [`DatabaseAdapter`] on one persistent `rusqlite` connection.
//!
//! # Features
//! - File databases and `:memory:`
//! - Catalog from `sqlite_master` and the `pragma_*` table-valued functions
//! - CHECK constraints, view bodies and trigger headers recovered from the
//!   stored DDL ([`ddl`])
//! - Sizes from the `dbstat` virtual table when it is compiled in
//!
//! # Implementation Notes
//! - `rusqlite` is synchronous: the connection sits behind `Arc<Mutex<_>>`
//!   and every call runs on the blocking pool
//! - Statement timeouts interrupt the connection from a timer task
//!   (`sqlite3_interrupt`). The timer starts once the call holds the
//!   connection and never fires into another call's statement;
//!   `busy_timeout` is the pool acquisition timeout
//! - `read_only` queries run with `PRAGMA query_only` switched on
//! - `EXPLAIN QUERY PLAN` has no estimates. `analyze` runs the statement
//!   inside a savepoint that is rolled back and reports the elapsed time
//! - BLOB data is Base64-encoded for JSON safety

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{
    params_from_iter, Connection, ErrorCode, InterruptHandle, OpenFlags, OptionalExtension,
    Statement,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::engine::model::{
    Column, ForeignKey, Index, IndexColumn, MaintenanceStats, PrimaryKey, ReferentialAction,
    SchemaSnapshot, SnapshotMetadata, SortDirection, Table, TableStatistics, Trigger,
    UniqueConstraint, View,
};
use crate::engine::shared::{
    blob_to_json, check_statement, column_dimensions, elapsed_ms, embedded_plan_mode,
    float_to_json, group_by_key, normalize_max_rows, normalize_timeout, parse_qualified_name,
    quote_ident, with_deadline, QuoteStyle, RowCollector, DEFAULT_TIMEOUT_MS,
    EXACT_COUNT_MAX_BYTES,
};
use crate::engine::{
    DatabaseAdapter, DatabaseType, FieldInfo, QueryOptions, QueryParam, QueryResult,
    Row as JsonRow,
};
use crate::error::{DbLensError, Result};
use crate::plan::ExplainReport;

pub mod ddl;
pub mod plan;
pub mod types;

use plan::PlanRow;

const MEMORY: &str = ":memory:";

/// `SQLite` adapter holding a single persistent connection
pub struct SqliteAdapter {
    config: DatabaseConfig,
    conn: Option<Arc<Mutex<Connection>>>,
    interrupt: Option<Arc<InterruptHandle>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
    Done,
}

/// Ownership of the connection by one timed call, shared with its timer
#[derive(Debug)]
struct StatementWatch {
    phase: Mutex<Phase>,
}

impl Default for StatementWatch {
    fn default() -> Self {
        Self { phase: Mutex::new(Phase::Waiting) }
    }
}

impl StatementWatch {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called with the connection held; false if the caller already gave up
    fn begin(&self) -> bool {
        let mut phase = self.phase();
        if *phase == Phase::Waiting {
            *phase = Phase::Running;
            true
        } else {
            false
        }
    }

    /// Called before the connection is released
    fn finish(&self) {
        *self.phase() = Phase::Done;
    }

    fn abandon(&self) {
        let mut phase = self.phase();
        if *phase == Phase::Waiting {
            *phase = Phase::Done;
        }
    }

    /// Holding the phase lock keeps `finish` (and so the connection release)
    /// from slipping in between the check and the interrupt
    fn interrupt_if_running(&self, handle: &InterruptHandle) {
        let phase = self.phase();
        if *phase == Phase::Running {
            handle.interrupt();
        }
    }
}

impl SqliteAdapter {
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config, conn: None, interrupt: None }
    }

    /// Run `task` against the connection on the blocking pool
    async fn run<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(self.conn.as_ref().ok_or_else(|| DbLensError::not_connected("sqlite"))?);
        tokio::task::spawn_blocking(move || {
            let mut guard =
                conn.lock().map_err(|_| DbLensError::connection("SQLite connection lock poisoned"))?;
            task(&mut guard)
        })
        .await
        .map_err(|e| DbLensError::query(format!("SQLite worker task failed: {e}")))?
    }

    /// Run `task` with the statement timer armed and the runtime deadline around it.
    ///
    /// The timer starts only once `task` holds the connection, and fires only
    /// while it still does. A call abandoned by the deadline before it got the
    /// connection never runs.
    async fn run_with_timeout<T, F>(&self, timeout_ms: u64, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let handle = Arc::clone(
            self.interrupt.as_ref().ok_or_else(|| DbLensError::not_connected("sqlite"))?,
        );
        let watch = Arc::new(StatementWatch::default());
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let timer = {
            let watch = Arc::clone(&watch);
            tokio::spawn(async move {
                if started_rx.await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                watch.interrupt_if_running(&handle);
            })
        };

        let task_watch = Arc::clone(&watch);
        let outcome = with_deadline(
            timeout_ms,
            self.run(move |conn| {
                if !task_watch.begin() {
                    return Err(DbLensError::timeout(format!(
                        "Query exceeded timeout of {timeout_ms}ms waiting for the connection"
                    )));
                }
                let _ = started_tx.send(());
                let outcome = task(conn);
                task_watch.finish();
                outcome
            }),
        )
        .await;

        match &outcome {
            // Still running past the deadline: leave the timer to interrupt it
            Err(e) if e.is_timeout() => watch.abandon(),
            _ => timer.abort(),
        }
        outcome
    }

    fn database_name(&self) -> String {
        self.config.file.as_deref().and_then(Path::file_name).map_or_else(
            || MEMORY.to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }

    /// Backing file, when the database is not in memory
    fn backing_file(&self) -> Option<PathBuf> {
        self.config.file.clone().filter(|f| f.as_os_str() != MEMORY && !is_uri(f))
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
        let statement = sql.trim().trim_end_matches(';').to_string();
        let values: Vec<SqlValue> = params.iter().map(to_sql_value).collect();

        let plan = self
            .run_with_timeout(timeout_ms, move |conn| {
                let rows = explain_rows(conn, &statement, &values, timeout_ms)?;
                debug!("EXPLAIN QUERY PLAN returned {} row(s)", rows.len());
                let mut plan = plan::build_plan(&rows)?;
                if analyze {
                    plan.execution_time_ms = Some(measure(conn, &statement, &values, timeout_ms)?);
                }
                Ok(plan)
            })
            .await?;

        Ok(ExplainReport::build(DatabaseType::SQLite, analyze, plan))
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn engine(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        let path = self
            .config
            .file
            .clone()
            .ok_or_else(|| DbLensError::configuration("SQLite requires 'file' parameter"))?;
        let busy_timeout = self.config.pool.acquire_timeout();

        let (conn, version) = tokio::task::spawn_blocking(move || open_connection(&path, busy_timeout))
            .await
            .map_err(|e| DbLensError::connection(format!("SQLite worker task failed: {e}")))??;

        info!("Opened SQLite {version} database {}", self.config.describe());
        self.interrupt = Some(Arc::new(conn.get_interrupt_handle()));
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.interrupt = None;
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        // A worker still holding the connection closes it when it finishes
        if let Ok(mutex) = Arc::try_unwrap(conn) {
            let conn = mutex
                .into_inner()
                .map_err(|_| DbLensError::connection("SQLite connection lock poisoned"))?;
            conn.close().map_err(|(_, e)| {
                DbLensError::connection(format!("Failed to close SQLite database: {e}"))
            })?;
        }
        info!("Closed SQLite database {}", self.config.describe());
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
        let read_only = options.read_only;
        let mutation = kind.is_mutation();
        let statement = sql.to_string();
        let values: Vec<SqlValue> = params.iter().map(to_sql_value).collect();

        let start = Instant::now();
        let mut result = self
            .run_with_timeout(timeout_ms, move |conn| {
                if read_only {
                    set_query_only(conn, true)?;
                }
                let outcome = execute(conn, &statement, &values, max_rows, timeout_ms, mutation);
                if read_only {
                    if let Err(e) = set_query_only(conn, false) {
                        warn!("Failed to restore connection after read-only query: {e}");
                    }
                }
                outcome
            })
            .await?;

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
        let database = self.database_name();
        let start = Instant::now();
        let captured_at = Utc::now();

        let mut snapshot = self.run(move |conn| introspect_schema(conn, database, captured_at)).await?;

        snapshot.metadata.duration_ms = elapsed_ms(start);
        info!(
            "Introspected {} table(s) in {}ms",
            snapshot.tables.len(),
            snapshot.metadata.duration_ms
        );
        Ok(snapshot)
    }

    async fn explain(&self, sql: &str, analyze: bool) -> Result<ExplainReport> {
        self.explain_with(sql, &[], analyze, DEFAULT_TIMEOUT_MS).await
    }

    async fn table_statistics(&self, table: &str) -> Result<TableStatistics> {
        let name = parse_qualified_name(table)?;
        let schema = name.schema.unwrap_or_else(|| "main".to_string());
        let file = if schema == "main" { self.backing_file() } else { None };

        self.run(move |conn| table_statistics(conn, &schema, &name.name, file.as_deref())).await
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

// ---------------------------------------------------------------------------
// Connection management
// ---------------------------------------------------------------------------

fn is_uri(path: &Path) -> bool {
    path.to_str().is_some_and(|p| p.starts_with("file:"))
}

/// Open an existing database file (or `:memory:`) and read the library version
fn open_connection(path: &Path, busy_timeout: Duration) -> Result<(Connection, String)> {
    let conn = if path.as_os_str() == MEMORY {
        Connection::open_in_memory()
    } else {
        if !is_uri(path) && !path.exists() {
            return Err(DbLensError::connection(format!(
                "SQLite database file not found: {}",
                path.display()
            )));
        }
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }
    .map_err(|e| DbLensError::connection(format!("Failed to open SQLite database: {e}")))?;

    conn.busy_timeout(busy_timeout)
        .map_err(|e| DbLensError::connection(format!("Failed to set busy timeout: {e}")))?;

    let version: String = conn
        .query_row("SELECT sqlite_version()", [], |row| row.get(0))
        .map_err(|e| DbLensError::connection(format!("Failed to query SQLite version: {e}")))?;

    Ok((conn, version))
}

fn statement_error(e: &rusqlite::Error, timeout_ms: u64) -> DbLensError {
    match e.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => {
            DbLensError::timeout(format!("Query exceeded timeout of {timeout_ms}ms"))
        }
        Some(ErrorCode::ReadOnly) => DbLensError::read_only(e.to_string()),
        _ => DbLensError::query(e.to_string()),
    }
}

fn catalog_error(what: &str, e: &rusqlite::Error) -> DbLensError {
    DbLensError::introspection(format!("Failed to read {what}: {e}"))
}

fn set_query_only(conn: &Connection, on: bool) -> Result<()> {
    conn.pragma_update(None, "query_only", on)
        .map_err(|e| DbLensError::query(format!("Failed to set query_only: {e}")))
}

// ---------------------------------------------------------------------------
// Query execution
// ---------------------------------------------------------------------------

fn to_sql_value(param: &QueryParam) -> SqlValue {
    match param {
        QueryParam::Null => SqlValue::Null,
        QueryParam::Bool(b) => SqlValue::Integer(i64::from(*b)),
        QueryParam::Int(i) => SqlValue::Integer(*i),
        QueryParam::Float(f) => SqlValue::Real(*f),
        QueryParam::Text(t) => SqlValue::Text(t.clone()),
    }
}

/// Convert `SQLite` value to JSON value
fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => float_to_json(f),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => blob_to_json(bytes),
        },
        ValueRef::Blob(bytes) => blob_to_json(bytes),
    }
}

fn check_arity(stmt: &Statement<'_>, given: usize) -> Result<()> {
    let expected = stmt.parameter_count();
    if expected == given {
        Ok(())
    } else {
        Err(DbLensError::query(format!(
            "Statement expects {expected} parameter(s), {given} given"
        )))
    }
}

fn execute(
    conn: &Connection,
    sql: &str,
    values: &[SqlValue],
    max_rows: usize,
    timeout_ms: u64,
    mutation: bool,
) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(|e| statement_error(&e, timeout_ms))?;
    check_arity(&stmt, values.len())?;

    let mut fields: Vec<FieldInfo> = stmt
        .columns()
        .iter()
        .map(|c| FieldInfo {
            name: c.name().to_string(),
            native_type: c.decl_type().unwrap_or_default().to_string(),
        })
        .collect();

    if fields.is_empty() {
        let changed = stmt
            .execute(params_from_iter(values.iter()))
            .map_err(|e| statement_error(&e, timeout_ms))?;
        return Ok(QueryResult {
            fields,
            rows: Vec::new(),
            row_count: 0,
            rows_affected: Some(u64::try_from(changed).unwrap_or(u64::MAX)),
            truncated: false,
            execution_ms: 0,
            plan: None,
        });
    }

    let mut rows = stmt
        .query(params_from_iter(values.iter()))
        .map_err(|e| statement_error(&e, timeout_ms))?;
    let mut collector = RowCollector::new(max_rows);

    while let Some(row) = rows.next().map_err(|e| statement_error(&e, timeout_ms))? {
        if !collector.accept() {
            continue;
        }
        let mut out = JsonRow::new();
        for (idx, field) in fields.iter_mut().enumerate() {
            let value = row.get_ref(idx).map_err(|e| statement_error(&e, timeout_ms))?;
            // Expression columns have no declared type
            if field.native_type.is_empty() && value != ValueRef::Null {
                field.native_type = types::storage_class(value).to_string();
            }
            out.insert(field.name.clone(), value_to_json(value));
        }
        collector.push(out);
    }

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

fn explain_rows(
    conn: &Connection,
    sql: &str,
    values: &[SqlValue],
    timeout_ms: u64,
) -> Result<Vec<PlanRow>> {
    let mut stmt = conn
        .prepare(&format!("EXPLAIN QUERY PLAN {sql}"))
        .map_err(|e| statement_error(&e, timeout_ms))?;

    // Unbound parameters plan as NULL
    let mut rows = if values.is_empty() {
        stmt.raw_query()
    } else {
        check_arity(&stmt, values.len())?;
        stmt.query(params_from_iter(values.iter())).map_err(|e| statement_error(&e, timeout_ms))?
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| statement_error(&e, timeout_ms))? {
        out.push(plan_row(row).map_err(|e| statement_error(&e, timeout_ms))?);
    }
    Ok(out)
}

/// `EXPLAIN QUERY PLAN` columns: id, parent, notused, detail
fn plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRow> {
    Ok(PlanRow::new(row.get(0)?, row.get(1)?, row.get::<_, String>(3)?))
}

/// Step a statement to completion without keeping rows
fn drain(conn: &Connection, sql: &str, values: &[SqlValue]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = if values.is_empty() { stmt.raw_query() } else { stmt.query(params_from_iter(values.iter()))? };
    while rows.next()?.is_some() {}
    Ok(())
}

/// Execute `sql` inside a savepoint that is always rolled back; elapsed ms
fn measure(conn: &Connection, sql: &str, values: &[SqlValue], timeout_ms: u64) -> Result<f64> {
    conn.execute_batch("SAVEPOINT dblens_analyze").map_err(|e| statement_error(&e, timeout_ms))?;

    let start = Instant::now();
    let outcome = drain(conn, sql, values);
    let elapsed = start.elapsed().as_secs_f64() * 1000.0;

    if let Err(e) = conn.execute_batch("ROLLBACK TO dblens_analyze; RELEASE dblens_analyze") {
        warn!("Failed to roll back analyzed statement: {e}");
    }
    outcome.map_err(|e| statement_error(&e, timeout_ms))?;
    Ok(elapsed)
}

// ---------------------------------------------------------------------------
// Catalog decoding
// ---------------------------------------------------------------------------

const MASTER_SQL: &str = r"
SELECT type, name, tbl_name, sql
FROM sqlite_master
WHERE type IN ('table', 'view', 'index', 'trigger') AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
ORDER BY type, name";

const COLUMNS_SQL: &str = r#"
SELECT cid, name, type, "notnull", dflt_value, pk, hidden
FROM pragma_table_xinfo(?1)
ORDER BY cid"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT id, seq, "table", "from", "to", on_update, on_delete
FROM pragma_foreign_key_list(?1)
ORDER BY id, seq"#;

const PRIMARY_KEY_SQL: &str = "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk";

const INDEX_LIST_SQL: &str = r#"
SELECT name, "unique", origin, partial
FROM pragma_index_list(?1)
ORDER BY name"#;

const INDEX_COLUMNS_SQL: &str = r#"
SELECT cid, name, "desc"
FROM pragma_index_xinfo(?1)
WHERE key = 1
ORDER BY seqno"#;

const SIZES_SQL: &str = "
SELECT m.tbl_name, SUM(d.pgsize)
FROM dbstat d JOIN sqlite_master m ON m.name = d.name
GROUP BY m.tbl_name";

/// One `sqlite_master` row
struct MasterRow {
    kind: String,
    name: String,
    table: String,
    sql: Option<String>,
}

fn load_master(conn: &Connection) -> Result<Vec<MasterRow>> {
    let mut stmt = conn.prepare(MASTER_SQL).map_err(|e| catalog_error("sqlite_master", &e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(MasterRow { kind: row.get(0)?, name: row.get(1)?, table: row.get(2)?, sql: row.get(3)? })
        })
        .map_err(|e| catalog_error("sqlite_master", &e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|e| catalog_error("sqlite_master", &e))
}

/// Pages used per table including its indexes; `None` without `dbstat`
fn load_sizes(conn: &Connection) -> Option<BTreeMap<String, u64>> {
    let loaded = conn.prepare(SIZES_SQL).and_then(|mut stmt| {
        stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
    });
    match loaded {
        Ok(rows) => Some(rows.into_iter().map(|(name, size)| (name, u64::try_from(size).unwrap_or(0))).collect()),
        Err(e) => {
            warn!("Table sizes unavailable (dbstat): {e}");
            None
        }
    }
}

/// `page_count * page_size` of one attached database
fn database_size(conn: &Connection, schema: &str) -> Option<u64> {
    let schema = quote_ident(schema, QuoteStyle::Double);
    let pages: i64 = conn.query_row(&format!("PRAGMA {schema}.page_count"), [], |row| row.get(0)).ok()?;
    let page_size: i64 = conn.query_row(&format!("PRAGMA {schema}.page_size"), [], |row| row.get(0)).ok()?;
    u64::try_from(pages.saturating_mul(page_size)).ok()
}

/// Row count from `sqlite_stat1`, when `ANALYZE` has been run
fn stat1_estimate(conn: &Connection, schema: &str, table: &str) -> Option<u64> {
    let sql = format!(
        "SELECT stat FROM {}.sqlite_stat1 WHERE tbl = ?1",
        quote_ident(schema, QuoteStyle::Double)
    );
    let mut stmt = conn.prepare(&sql).ok()?;
    let stats = stmt.query_map([table], |row| row.get::<_, String>(0)).ok()?;
    stats
        .filter_map(std::result::Result::ok)
        .filter_map(|stat| stat.split_whitespace().next().and_then(|n| n.parse::<u64>().ok()))
        .max()
}

fn exact_count(conn: &Connection, schema: &str, table: &str) -> rusqlite::Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.{}",
        quote_ident(schema, QuoteStyle::Double),
        quote_ident(table, QuoteStyle::Double)
    );
    conn.query_row(&sql, [], |row| row.get::<_, i64>(0)).map(|n| u64::try_from(n).unwrap_or(0))
}

/// Row count: exact when the table (or the whole file) is small enough,
/// otherwise the `sqlite_stat1` estimate
fn row_count(conn: &Connection, schema: &str, table: &str, size: Option<u64>, db_size: Option<u64>) -> (Option<u64>, bool) {
    let cheap = size.or(db_size).is_some_and(|bytes| bytes < EXACT_COUNT_MAX_BYTES);
    if cheap {
        match exact_count(conn, schema, table) {
            Ok(count) => return (Some(count), true),
            Err(e) => warn!("Exact count for {table} failed: {e}"),
        }
    }
    (stat1_estimate(conn, schema, table), false)
}

fn load_columns(conn: &Connection, table: &str, rowid_table: bool) -> Result<Vec<Column>> {
    struct ColumnRow {
        name: String,
        declared: String,
        not_null: bool,
        default: Option<String>,
        pk: i64,
        hidden: i64,
    }

    let mut stmt = conn.prepare(COLUMNS_SQL).map_err(|e| catalog_error("columns", &e))?;
    let rows = stmt
        .query_map([table], |row| {
            Ok(ColumnRow {
                name: row.get(1)?,
                declared: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(3)? != 0,
                default: row.get(4)?,
                pk: row.get(5)?,
                hidden: row.get(6)?,
            })
        })
        .map_err(|e| catalog_error("columns", &e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| catalog_error("columns", &e))?;

    let pk_columns = rows.iter().filter(|r| r.pk > 0).count();
    // Hidden columns of virtual tables are not part of the declared shape
    let visible = rows.into_iter().filter(|r| r.hidden != 1);

    Ok(visible
        .enumerate()
        .map(|(position, row)| {
            let rowid_alias =
                rowid_table && pk_columns == 1 && row.pk == 1 && row.declared.eq_ignore_ascii_case("INTEGER");
            let logical_type = types::map_type(&row.declared);
            let (length, precision, scale) = column_dimensions(logical_type, &row.declared);
            Column {
                name: row.name,
                ordinal: u32::try_from(position + 1).unwrap_or(u32::MAX),
                logical_type,
                native_type: row.declared,
                nullable: !row.not_null && !rowid_alias,
                default: row.default,
                auto_increment: rowid_alias,
                length,
                precision,
                scale,
                enum_values: None,
                comment: None,
            }
        })
        .collect())
}

fn primary_key_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(PRIMARY_KEY_SQL)?;
    let names = stmt.query_map([table], |row| row.get(0))?;
    names.collect()
}

fn load_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>> {
    struct ForeignKeyRow {
        id: i64,
        seq: i64,
        target: String,
        from: String,
        to: Option<String>,
        on_update: String,
        on_delete: String,
    }

    let mut stmt = conn.prepare(FOREIGN_KEYS_SQL).map_err(|e| catalog_error("foreign keys", &e))?;
    let rows = stmt
        .query_map([table], |row| {
            Ok(ForeignKeyRow {
                id: row.get(0)?,
                seq: row.get(1)?,
                target: row.get(2)?,
                from: row.get(3)?,
                to: row.get(4)?,
                on_update: row.get(5)?,
                on_delete: row.get(6)?,
            })
        })
        .map_err(|e| catalog_error("foreign keys", &e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| catalog_error("foreign keys", &e))?;

    let mut foreign_keys = Vec::new();
    for (id, mut parts) in group_by_key(rows, |r| r.id) {
        parts.sort_by_key(|p| p.seq);
        let Some(head) = parts.first() else { continue };

        // A reference without columns points at the parent's primary key
        let implicit = if parts.iter().any(|p| p.to.is_none()) {
            primary_key_columns(conn, &head.target).unwrap_or_else(|e| {
                warn!("Could not resolve primary key of {}: {e}", head.target);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let referenced_columns = parts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                p.to.clone()
                    .or_else(|| implicit.get(i).cloned())
                    .unwrap_or_else(|| "rowid".to_string())
            })
            .collect();

        foreign_keys.push(ForeignKey {
            name: format!("fk_{table}_{id}"),
            columns: parts.iter().map(|p| p.from.clone()).collect(),
            referenced_schema: None,
            referenced_table: head.target.clone(),
            referenced_columns,
            on_delete: ReferentialAction::parse(&head.on_delete),
            on_update: ReferentialAction::parse(&head.on_update),
        });
    }
    Ok(foreign_keys)
}

fn load_indexes(
    conn: &Connection,
    table: &str,
    definitions: &BTreeMap<&str, &str>,
) -> Result<(Vec<Index>, Vec<UniqueConstraint>)> {
    let mut list = conn.prepare(INDEX_LIST_SQL).map_err(|e| catalog_error("indexes", &e))?;
    let entries = list
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? != 0,
            ))
        })
        .map_err(|e| catalog_error("indexes", &e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| catalog_error("indexes", &e))?;

    let mut columns_stmt = conn.prepare(INDEX_COLUMNS_SQL).map_err(|e| catalog_error("index columns", &e))?;
    let mut indexes = Vec::with_capacity(entries.len());
    let mut unique_constraints = Vec::new();

    for (name, unique, origin, partial) in entries {
        let columns = columns_stmt
            .query_map([&name], |row| {
                let cid: i64 = row.get(0)?;
                let column: Option<String> = row.get(1)?;
                let descending: i64 = row.get(2)?;
                Ok(IndexColumn {
                    name: column.unwrap_or_else(|| {
                        if cid == -1 { "rowid".to_string() } else { "<expression>".to_string() }
                    }),
                    direction: if descending != 0 { SortDirection::Desc } else { SortDirection::Asc },
                })
            })
            .map_err(|e| catalog_error("index columns", &e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| catalog_error("index columns", &e))?;

        if origin == "u" {
            unique_constraints.push(UniqueConstraint {
                name: name.clone(),
                columns: columns.iter().map(|c| c.name.clone()).collect(),
            });
        }

        let predicate = if partial {
            definitions.get(name.as_str()).and_then(|sql| ddl::index_predicate(sql))
        } else {
            None
        };

        indexes.push(Index {
            primary: origin == "pk",
            unique,
            kind: "btree".to_string(),
            predicate,
            columns,
            name,
        });
    }
    Ok((indexes, unique_constraints))
}

fn introspect_schema(
    conn: &Connection,
    database: String,
    captured_at: DateTime<Utc>,
) -> Result<SchemaSnapshot> {
    let version: String = conn
        .query_row("SELECT sqlite_version()", [], |row| row.get(0))
        .map_err(|e| catalog_error("server metadata", &e))?;
    let charset: Option<String> = conn.query_row("PRAGMA encoding", [], |row| row.get(0)).optional().ok().flatten();

    let master = load_master(conn)?;
    let sizes = load_sizes(conn);
    let db_size = database_size(conn, "main");
    let index_sql: BTreeMap<&str, &str> = master
        .iter()
        .filter(|m| m.kind == "index")
        .filter_map(|m| Some((m.name.as_str(), m.sql.as_deref()?)))
        .collect();

    let mut tables = Vec::new();
    let mut views = Vec::new();
    let mut triggers = Vec::new();

    for entry in &master {
        let create_sql = entry.sql.as_deref().unwrap_or_default();
        match entry.kind.as_str() {
            "table" => {
                let mut table = Table::new(entry.name.clone(), Some("main".to_string()));
                table.columns = load_columns(conn, &entry.name, !ddl::without_rowid(create_sql))?;

                let pk_columns = primary_key_columns(conn, &entry.name)
                    .map_err(|e| catalog_error("primary key", &e))?;
                if !pk_columns.is_empty() {
                    table.primary_key = Some(PrimaryKey { name: None, columns: pk_columns });
                }

                table.foreign_keys = load_foreign_keys(conn, &entry.name)?;
                let (indexes, unique_constraints) = load_indexes(conn, &entry.name, &index_sql)?;
                table.indexes = indexes;
                table.unique_constraints = unique_constraints;
                table.check_constraints = ddl::check_constraints(create_sql);

                table.size_bytes = sizes.as_ref().and_then(|s| s.get(&entry.name).copied());
                table.row_count = row_count(conn, "main", &entry.name, table.size_bytes, db_size).0;
                tables.push(table);
            }
            "view" => {
                let columns = load_columns(conn, &entry.name, false).unwrap_or_else(|e| {
                    warn!("Columns of view {} unavailable: {e}", entry.name);
                    Vec::new()
                });
                views.push(View {
                    name: entry.name.clone(),
                    schema: Some("main".to_string()),
                    definition: entry.sql.as_deref().map(ddl::view_body),
                    columns,
                    materialized: false,
                });
            }
            "trigger" => {
                let (timing, events) = ddl::trigger_header(create_sql);
                triggers.push(Trigger {
                    name: entry.name.clone(),
                    schema: Some("main".to_string()),
                    table: entry.table.clone(),
                    timing,
                    events,
                    statement: entry.sql.clone(),
                });
            }
            _ => {}
        }
    }

    Ok(SchemaSnapshot {
        tables,
        views,
        sequences: Vec::new(),
        functions: Vec::new(),
        triggers,
        metadata: SnapshotMetadata {
            engine: DatabaseType::SQLite,
            version,
            database: Some(database),
            charset,
            collation: Some("BINARY".to_string()),
            captured_at,
            duration_ms: 0,
        },
    })
}

// ---------------------------------------------------------------------------
// Table statistics
// ---------------------------------------------------------------------------

fn table_statistics(
    conn: &Connection,
    schema: &str,
    table: &str,
    file: Option<&Path>,
) -> Result<TableStatistics> {
    let attached: Option<String> = conn
        .query_row("SELECT name FROM pragma_database_list WHERE name = ?1", [schema], |row| row.get(0))
        .optional()
        .map_err(|e| catalog_error("database list", &e))?;
    if attached.is_none() {
        return Err(DbLensError::not_found(format!("Schema '{schema}' does not exist")));
    }

    let schema_q = quote_ident(schema, QuoteStyle::Double);
    let relname: String = conn
        .query_row(
            &format!("SELECT name FROM {schema_q}.sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE"),
            [table],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| catalog_error("sqlite_master", &e))?
        .ok_or_else(|| DbLensError::not_found(format!("Table '{table}' does not exist")))?;

    let table_size = conn
        .query_row("SELECT SUM(pgsize) FROM dbstat(?2) WHERE name = ?1", [relname.as_str(), schema], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .inspect_err(|e| warn!("Table size unavailable (dbstat): {e}"))
        .ok()
        .flatten()
        .and_then(|n| u64::try_from(n).ok());

    let index_size = if table_size.is_some() {
        conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(d.pgsize), 0) FROM dbstat(?2) d
                 JOIN {schema_q}.sqlite_master m ON m.name = d.name
                 WHERE m.type = 'index' AND m.tbl_name = ?1"
            ),
            [relname.as_str(), schema],
            |row| row.get::<_, i64>(0),
        )
        .ok()
        .and_then(|n| u64::try_from(n).ok())
    } else {
        None
    };

    let index_count: Option<u32> = conn
        .query_row("SELECT COUNT(*) FROM pragma_index_list(?1, ?2)", [relname.as_str(), schema], |row| row.get(0))
        .ok();

    let page_size: Option<i64> =
        conn.query_row(&format!("PRAGMA {schema_q}.page_size"), [], |row| row.get(0)).ok();
    let free_pages: Option<i64> =
        conn.query_row(&format!("PRAGMA {schema_q}.freelist_count"), [], |row| row.get(0)).ok();
    let reclaimable_bytes = match (page_size, free_pages) {
        (Some(size), Some(pages)) => u64::try_from(size.saturating_mul(pages)).ok(),
        _ => None,
    };

    let (row_count, row_count_exact) =
        row_count(conn, schema, &relname, table_size, database_size(conn, schema));

    let last_modified = file
        .and_then(|f| std::fs::metadata(f).ok())
        .and_then(|m| m.modified().ok())
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

    Ok(TableStatistics {
        table: relname,
        schema: Some(schema.to_string()),
        row_count,
        row_count_exact,
        table_size_bytes: table_size,
        index_size_bytes: index_size,
        total_size_bytes: match (table_size, index_size) {
            (Some(t), Some(i)) => Some(t + i),
            _ => None,
        },
        index_count,
        maintenance: MaintenanceStats { reclaimable_bytes, last_modified, ..MaintenanceStats::default() },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_adapter() -> SqliteAdapter {
        let mut adapter = SqliteAdapter::new(DatabaseConfig::sqlite(MEMORY));
        adapter.connect().await.unwrap();
        adapter
    }

    async fn exec(adapter: &SqliteAdapter, sql: &str) {
        adapter.query(sql, &[], &QueryOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let mut adapter = memory_adapter().await;
        assert!(adapter.is_connected());
        // Idempotent
        adapter.connect().await.unwrap();
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_file() {
        let missing = std::env::temp_dir().join("dblens_missing_dir").join("nope.db");
        let mut adapter = SqliteAdapter::new(DatabaseConfig::sqlite(missing));
        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_ERROR");
        assert!(err.message().contains("not found"));
    }

    #[tokio::test]
    async fn test_query_before_connect() {
        let adapter = SqliteAdapter::new(DatabaseConfig::sqlite(MEMORY));
        let err = adapter.query("SELECT 1", &[], &QueryOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_ERROR");
    }

    #[tokio::test]
    async fn test_query_values_and_params() {
        let adapter = memory_adapter().await;
        exec(&adapter, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB)").await;

        let inserted = adapter
            .query(
                "INSERT INTO t (name, score, data) VALUES (?1, ?2, x'0102')",
                &[QueryParam::Text("ada".into()), QueryParam::Float(1.5)],
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, Some(1));

        let result = adapter
            .query("SELECT id, name, score, data, 1 + 1 AS two FROM t", &[], &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0]["name"], Value::from("ada"));
        assert_eq!(result.rows[0]["score"], Value::from(1.5));
        assert_eq!(result.rows[0]["data"], Value::from("AQI="));
        assert_eq!(result.fields[0].native_type, "INTEGER");
        assert_eq!(result.fields[4].native_type, "INTEGER");
    }

    #[tokio::test]
    async fn test_parameter_arity() {
        let adapter = memory_adapter().await;
        let err = adapter.query("SELECT ?1 + ?2", &[QueryParam::Int(1)], &QueryOptions::default()).await.unwrap_err();
        assert!(err.message().contains("expects 2 parameter(s), 1 given"));
    }

    #[tokio::test]
    async fn test_read_only_refuses_mutation() {
        let adapter = memory_adapter().await;
        exec(&adapter, "CREATE TABLE t (id INTEGER)").await;
        let err = adapter.query("INSERT INTO t VALUES (1)", &[], &QueryOptions::read_only()).await.unwrap_err();
        assert_eq!(err.error_code(), "READ_ONLY_VIOLATION");

        // Connection is writable again afterwards
        exec(&adapter, "INSERT INTO t VALUES (1)").await;
    }

    #[tokio::test]
    async fn test_timeout_interrupts_statement() {
        let adapter = memory_adapter().await;
        let options = QueryOptions { timeout_ms: Some(50), ..QueryOptions::default() };
        let err = adapter
            .query(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c",
                &[],
                &options,
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");

        // The connection stays usable
        exec(&adapter, "SELECT 1").await;
    }

    const COUNT_TO_5M: &str =
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5000000) SELECT count(*) AS n FROM c";

    #[tokio::test]
    async fn test_short_timeout_does_not_interrupt_other_call() {
        let adapter = memory_adapter().await;
        let long = QueryOptions { timeout_ms: Some(60_000), ..QueryOptions::default() };
        let short = QueryOptions { timeout_ms: Some(50), ..QueryOptions::default() };

        let (slow, quick) = tokio::join!(adapter.query(COUNT_TO_5M, &[], &long), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            adapter.query("SELECT 1 AS one", &[], &short).await
        });

        let slow = slow.unwrap();
        assert_eq!(slow.rows[0]["n"], Value::from(5_000_000));
        // Waiting for the connection may exhaust the short call's own deadline
        if let Err(e) = quick {
            assert!(e.is_timeout(), "{e}");
        }
    }

    #[tokio::test]
    async fn test_call_abandoned_while_waiting_never_runs() {
        let adapter = memory_adapter().await;
        exec(&adapter, "CREATE TABLE t (id INTEGER)").await;
        let short = QueryOptions { timeout_ms: Some(50), ..QueryOptions::default() };

        let (held, inserted) = tokio::join!(
            adapter.run(|_conn| {
                std::thread::sleep(Duration::from_millis(1_500));
                Ok(())
            }),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                adapter.query("INSERT INTO t VALUES (1)", &[], &short).await
            }
        );
        held.unwrap();
        assert!(inserted.unwrap_err().is_timeout());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let count = adapter.query("SELECT count(*) AS n FROM t", &[], &QueryOptions::default()).await.unwrap();
        assert_eq!(count.rows[0]["n"], Value::from(0));
    }

    #[tokio::test]
    async fn test_embedded_plan_uses_caller_timeout() {
        let adapter = memory_adapter().await;
        let err = adapter
            .explain_with(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c",
                &[],
                true,
                50,
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn test_explain_analyze_leaves_no_trace() {
        let adapter = memory_adapter().await;
        exec(&adapter, "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").await;

        let report = adapter.explain_with("DELETE FROM t WHERE v = 'x'", &[], true, 5_000).await.unwrap();
        assert!(report.analyzed);
        assert!(report.plan.execution_time_ms.is_some());

        exec(&adapter, "INSERT INTO t (v) VALUES ('x')").await;
        adapter.explain("DELETE FROM t", true).await.unwrap();
        let count = adapter.query("SELECT count(*) AS n FROM t", &[], &QueryOptions::default()).await.unwrap();
        assert_eq!(count.rows[0]["n"], Value::from(1));
    }

    #[tokio::test]
    async fn test_implicit_foreign_key_target() {
        let adapter = memory_adapter().await;
        exec(&adapter, "CREATE TABLE parent (a INTEGER, b INTEGER, PRIMARY KEY (a, b))").await;
        exec(
            &adapter,
            "CREATE TABLE child (id INTEGER PRIMARY KEY, pa INTEGER, pb INTEGER, FOREIGN KEY (pa, pb) REFERENCES parent ON DELETE CASCADE)",
        )
        .await;

        let snapshot = adapter.introspect().await.unwrap();
        let child = snapshot.table("child").unwrap();
        let fk = &child.foreign_keys[0];
        assert_eq!(fk.columns, vec!["pa", "pb"]);
        assert_eq!(fk.referenced_columns, vec!["a", "b"]);
        assert_eq!(fk.on_delete, ReferentialAction::Cascade);
        assert!(child.columns[0].auto_increment);
        assert!(!child.columns[0].nullable);
    }
}

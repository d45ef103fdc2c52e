//! `PostgreSQL` Adapter
//!
//! Implements [`DatabaseAdapter`] on a `deadpool-postgres` pool.
//!
//! # Implementation Notes
//! - Statement timeouts are pushed to the server (`statement_timeout`);
//!   SQLSTATE 57014 surfaces as a timeout, a runtime deadline backs it up
//! - `read_only` queries additionally run inside `BEGIN READ ONLY`
//! - The catalog is read from `pg_catalog` so that expression indexes,
//!   partial-index predicates and enum labels are available
//! - `EXPLAIN ANALYZE` always runs inside a transaction that is rolled back
//! - A connection whose session could not be restored (teardown failed or
//!   the runtime deadline fired) is closed instead of returned to the pool
//! - Result rows are streamed; rows past `max_rows` are counted, not kept
//! - Values are converted in [`values`]; numerics become exact strings

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime};
use futures::TryStreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, PoolSettings};
use crate::engine::model::{
    CheckConstraint, Column, ForeignKey, Function, Index, IndexColumn, MaintenanceStats,
    PrimaryKey, ReferentialAction, SchemaSnapshot, Sequence, SnapshotMetadata, SortDirection,
    Table, TableStatistics, Trigger, UniqueConstraint, View,
};
use crate::engine::shared::{
    check_statement, column_dimensions, elapsed_ms, embedded_plan_mode, group_by_key,
    normalize_max_rows, normalize_timeout, parse_qualified_name, quote_ident, strip_outer_parens,
    wants_exact_count, with_deadline, QuoteStyle, RowCollector, DEFAULT_TIMEOUT_MS,
};
use crate::engine::{
    DatabaseAdapter, DatabaseType, FieldInfo, QueryOptions, QueryParam, QueryResult,
    Row as JsonRow,
};
use crate::error::{DbLensError, Result};
use crate::plan::ExplainReport;

pub mod plan;
pub mod types;
mod values;

use values::{as_refs, bind_params, value_to_json};

/// `PostgreSQL` adapter backed by a connection pool
pub struct PostgresAdapter {
    config: DatabaseConfig,
    pool: Option<Pool>,
    reaper: Option<JoinHandle<()>>,
}

impl PostgresAdapter {
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config, pool: None, reaper: None }
    }

    async fn acquire(&self) -> Result<Object> {
        let pool = self.pool.as_ref().ok_or_else(|| DbLensError::not_connected("postgres"))?;
        acquire(pool).await
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
        let client = self.acquire().await?;
        let options = if analyze { "ANALYZE, BUFFERS, FORMAT JSON" } else { "FORMAT JSON" };
        let explain_sql = format!("EXPLAIN ({options}) {}", sql.trim().trim_end_matches(';'));

        let body = async {
            let statement =
                client.prepare(&explain_sql).await.map_err(|e| statement_error(&e, timeout_ms))?;
            let bound = bind_params(params, statement.params())?;
            let row = client
                .query_one(&statement, &as_refs(&bound))
                .await
                .map_err(|e| statement_error(&e, timeout_ms))?;
            row.try_get::<_, Value>(0)
                .map_err(|e| DbLensError::query(format!("Unexpected EXPLAIN output: {e}")))
        };
        // ROLLBACK discards any effect of ANALYZE
        let setup = format!("BEGIN; SET LOCAL statement_timeout = {timeout_ms}");
        let Scoped { outcome, restored } = scoped(&client, &setup, "ROLLBACK", timeout_ms, body).await;
        if !restored {
            discard(client);
        }
        let document = outcome?;

        let plan = plan::parse_plan(&document)?;
        Ok(ExplainReport::build(DatabaseType::Postgres, analyze, plan))
    }
}

impl Drop for PostgresAdapter {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn connect(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Ok(());
        }

        let pool = build_pool(&self.config)?;

        // Open min_size connections up front; this also validates credentials
        let mut warm = Vec::new();
        for _ in 0..self.config.pool.min_size.max(1) {
            warm.push(acquire(&pool).await?);
        }
        let version = match warm.first() {
            Some(client) => client
                .query_one("SHOW server_version", &[])
                .await
                .and_then(|row| row.try_get::<_, String>(0))
                .map_err(|e| DbLensError::connection(format!("Failed to query server version: {}", describe(&e))))?,
            None => String::from("unknown"),
        };
        drop(warm);

        info!("Connected to PostgreSQL {version} at {}", self.config.describe());

        self.reaper = spawn_idle_reaper(pool.clone(), &self.config.pool);
        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        if let Some(pool) = self.pool.take() {
            pool.close();
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

        let client = self.acquire().await?;
        let start = Instant::now();

        let (setup, teardown) = if options.read_only {
            (format!("BEGIN READ ONLY; SET LOCAL statement_timeout = {timeout_ms}"), "ROLLBACK")
        } else {
            (format!("SET statement_timeout = {timeout_ms}"), "RESET statement_timeout")
        };

        let body = run_statement(&client, sql, params, max_rows, timeout_ms, kind.is_mutation());
        let Scoped { outcome, restored } = scoped(&client, &setup, teardown, timeout_ms, body).await;
        if !restored {
            discard(client);
        }
        let mut result = outcome?;

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
        let client = self.acquire().await?;
        let start = Instant::now();
        let captured_at = Utc::now();

        let meta = client.query_one(METADATA_SQL, &[]).await.map_err(|e| catalog_error("server metadata", &e))?;
        let version: String = cell(&meta, 0)?;
        let database: String = cell(&meta, 1)?;
        let charset: Option<String> = cell(&meta, 2)?;
        let collation: Option<String> = cell(&meta, 3)?;

        let relations = load_relations(&client).await?;
        let enum_labels = load_enum_labels(&client).await?;
        let mut columns = load_columns(&client, &enum_labels).await?;
        let mut constraints = load_constraints(&client).await?;
        let mut indexes = load_indexes(&client).await?;

        let mut tables = Vec::with_capacity(relations.len());
        for relation in relations {
            let key = (relation.schema.clone(), relation.name.clone());
            let mut table = Table::new(relation.name.clone(), Some(relation.schema.clone()));
            table.columns = columns.remove(&key).unwrap_or_default();
            apply_constraints(&mut table, constraints.remove(&key).unwrap_or_default());
            table.indexes = indexes.remove(&key).unwrap_or_default();
            table.size_bytes = relation.size_bytes;
            table.comment = relation.comment;
            table.row_count = relation.estimated_rows;

            if wants_exact_count(relation.estimated_rows) {
                match exact_count(&client, &relation.schema, &relation.name).await {
                    Ok(count) => table.row_count = Some(count),
                    Err(e) => warn!("Exact count for {}.{} failed: {e}", relation.schema, relation.name),
                }
            }
            tables.push(table);
        }

        let views = load_views(&client)
            .await?
            .into_iter()
            .map(|mut view| {
                let key = (view.schema.clone().unwrap_or_default(), view.name.clone());
                view.columns = columns.remove(&key).unwrap_or_default();
                view
            })
            .collect();

        let sequences = optional("sequences", load_sequences(&client).await);
        let functions = optional("functions", load_functions(&client).await);
        let triggers = optional("triggers", load_triggers(&client).await);

        let duration_ms = elapsed_ms(start);
        info!("Introspected {} table(s) in {duration_ms}ms", tables.len());

        Ok(SchemaSnapshot {
            tables,
            views,
            sequences,
            functions,
            triggers,
            metadata: SnapshotMetadata {
                engine: DatabaseType::Postgres,
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
        let client = self.acquire().await?;

        let row = client
            .query_opt(TABLE_STATISTICS_SQL, &[&name.name, &name.schema])
            .await
            .map_err(|e| catalog_error("table statistics", &e))?
            .ok_or_else(|| DbLensError::not_found(format!("Table '{table}' does not exist")))?;

        let schema: String = cell(&row, 0)?;
        let relname: String = cell(&row, 1)?;
        let estimated = estimate(cell(&row, 2)?);

        let (row_count, row_count_exact) = if wants_exact_count(estimated) {
            match exact_count(&client, &schema, &relname).await {
                Ok(count) => (Some(count), true),
                Err(e) => {
                    warn!("Exact count for {schema}.{relname} failed: {e}");
                    (estimated, false)
                }
            }
        } else {
            (estimated, false)
        };

        let timestamp = |idx: usize| -> Result<Option<String>> {
            Ok(cell::<Option<DateTime<Utc>>>(&row, idx)?.map(|t| t.to_rfc3339()))
        };
        let counter = |idx: usize| -> Result<Option<u64>> {
            Ok(cell::<Option<i64>>(&row, idx)?.and_then(|v| u64::try_from(v).ok()))
        };

        Ok(TableStatistics {
            table: relname,
            schema: Some(schema),
            row_count,
            row_count_exact,
            table_size_bytes: counter(3)?,
            index_size_bytes: counter(4)?,
            total_size_bytes: counter(5)?,
            index_count: cell::<i32>(&row, 6).ok().and_then(|v| u32::try_from(v).ok()),
            maintenance: MaintenanceStats {
                dead_rows: counter(7)?,
                modifications_since_analyze: counter(8)?,
                sequential_scans: counter(9)?,
                index_scans: counter(10)?,
                last_vacuum: timestamp(11)?,
                last_autovacuum: timestamp(12)?,
                last_analyze: timestamp(13)?,
                last_autoanalyze: timestamp(14)?,
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

/// Driver configuration from a connection string or discrete parameters
fn build_pg_config(config: &DatabaseConfig) -> Result<tokio_postgres::Config> {
    let mut pg_config = if let Some(url) = &config.connection_string {
        url.parse::<tokio_postgres::Config>().map_err(|e| {
            DbLensError::configuration(format!("Invalid PostgreSQL connection string: {e}"))
        })?
    } else {
        let mut pg_config = tokio_postgres::Config::new();
        if let Some(host) = &config.host {
            pg_config.host(host);
        }
        pg_config.port(config.port_or_default());
        if let Some(user) = &config.user {
            pg_config.user(user);
        }
        if let Some(password) = &config.password {
            pg_config.password(password);
        }
        if let Some(database) = &config.database {
            pg_config.dbname(database);
        }
        pg_config
    };

    pg_config.application_name("dblens");
    pg_config.connect_timeout(config.pool.acquire_timeout());
    if config.ssl {
        pg_config.ssl_mode(SslMode::Require);
    }
    Ok(pg_config)
}

fn build_pool(config: &DatabaseConfig) -> Result<Pool> {
    let pg_config = build_pg_config(config)?;
    let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };

    let manager = if config.ssl {
        let connector = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| DbLensError::connection(format!("Failed to initialize TLS: {e}")))?;
        Manager::from_config(pg_config, postgres_native_tls::MakeTlsConnector::new(connector), manager_config)
    } else {
        Manager::from_config(pg_config, NoTls, manager_config)
    };

    let timeout = config.pool.acquire_timeout();
    Pool::builder(manager)
        .max_size(config.pool.max_size as usize)
        .wait_timeout(Some(timeout))
        .create_timeout(Some(timeout))
        .recycle_timeout(Some(timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| DbLensError::configuration(format!("Failed to build connection pool: {e}")))
}

async fn acquire(pool: &Pool) -> Result<Object> {
    pool.get().await.map_err(|e| match e {
        PoolError::Timeout(_) => {
            DbLensError::connection("Timed out acquiring a PostgreSQL connection from the pool")
        }
        PoolError::Backend(e) => {
            DbLensError::connection(format!("Failed to connect to PostgreSQL: {}", describe(&e)))
        }
        other => DbLensError::connection(format!("PostgreSQL pool error: {other}")),
    })
}

/// Close connections idle for longer than `idle_timeout`, keeping `min_size`
fn spawn_idle_reaper(pool: Pool, settings: &PoolSettings) -> Option<JoinHandle<()>> {
    if settings.idle_timeout_ms == 0 {
        return None;
    }
    let idle = settings.idle_timeout();
    let keep = settings.min_size as usize;
    let period = idle.max(Duration::from_secs(1)) / 2;

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let mut kept = 0usize;
            pool.retain(|_, metrics| {
                kept += 1;
                kept <= keep || metrics.last_used() < idle
            });
        }
    }))
}

/// Outcome of a statement run between session setup and teardown
struct Scoped<T> {
    outcome: Result<T>,
    /// False when teardown failed or never ran
    restored: bool,
}

/// Run `body` between `setup` and `teardown` under the runtime deadline.
/// Teardown runs whatever `setup` or `body` return.
async fn scoped<T>(
    client: &Client,
    setup: &str,
    teardown: &str,
    timeout_ms: u64,
    body: impl Future<Output = Result<T>>,
) -> Scoped<T> {
    let run = async {
        let outcome = match client.batch_execute(setup).await {
            Ok(()) => body.await,
            Err(e) => Err(statement_error(&e, timeout_ms)),
        };
        let restored = match client.batch_execute(teardown).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to restore session after query: {}", describe(&e));
                false
            }
        };
        Ok(Scoped { outcome, restored })
    };
    with_deadline(timeout_ms, run)
        .await
        .unwrap_or_else(|e| Scoped { outcome: Err(e), restored: false })
}

/// Close a connection whose session state is unknown instead of returning
/// it to the pool
fn discard(client: Object) {
    drop(Object::take(client));
    debug!("Discarded PostgreSQL connection with unrestored session state");
}

/// Server message without the driver's "db error:" prefix
fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => {
            let mut message = db.message().to_string();
            if let Some(detail) = db.detail() {
                message.push_str(&format!(" ({detail})"));
            }
            message
        }
        None => e.to_string(),
    }
}

fn statement_error(e: &tokio_postgres::Error, timeout_ms: u64) -> DbLensError {
    match e.code() {
        Some(code) if *code == SqlState::QUERY_CANCELED => {
            DbLensError::timeout(format!("Query exceeded timeout of {timeout_ms}ms"))
        }
        Some(code) if *code == SqlState::READ_ONLY_SQL_TRANSACTION => {
            DbLensError::read_only(describe(e))
        }
        _ => DbLensError::query(describe(e)),
    }
}

fn catalog_error(what: &str, e: &tokio_postgres::Error) -> DbLensError {
    DbLensError::introspection(format!("Failed to read {what}: {}", describe(e)))
}

// ---------------------------------------------------------------------------
// Query execution
// ---------------------------------------------------------------------------

async fn run_statement(
    client: &Client,
    sql: &str,
    params: &[QueryParam],
    max_rows: usize,
    timeout_ms: u64,
    mutation: bool,
) -> Result<QueryResult> {
    let statement = client.prepare(sql).await.map_err(|e| statement_error(&e, timeout_ms))?;
    let bound = bind_params(params, statement.params())?;
    let refs = as_refs(&bound);

    let fields: Vec<FieldInfo> = statement
        .columns()
        .iter()
        .map(|c| FieldInfo { name: c.name().to_string(), native_type: c.type_().name().to_string() })
        .collect();

    if fields.is_empty() {
        let affected = client.execute(&statement, &refs).await.map_err(|e| statement_error(&e, timeout_ms))?;
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

    // Streamed so rows past the cap are counted without being kept
    let stream = client
        .query_raw(&statement, refs.iter().map(|p| *p as &dyn ToSql))
        .await
        .map_err(|e| statement_error(&e, timeout_ms))?;
    let mut stream = pin!(stream);

    let mut collector = RowCollector::new(max_rows);
    while let Some(row) = stream.try_next().await.map_err(|e| statement_error(&e, timeout_ms))? {
        if !collector.accept() {
            continue;
        }
        let mut out = JsonRow::new();
        for (idx, column) in row.columns().iter().enumerate() {
            out.insert(column.name().to_string(), value_to_json(&row, idx)?);
        }
        collector.push(out);
    }
    let (rows, row_count, truncated) = collector.finish();

    Ok(QueryResult {
        fields,
        rows,
        row_count,
        // INSERT/UPDATE/DELETE ... RETURNING
        rows_affected: mutation.then_some(row_count),
        truncated,
        execution_ms: 0,
        plan: None,
    })
}

// ---------------------------------------------------------------------------
// Catalog decoding
// ---------------------------------------------------------------------------

type RelationKey = (String, String);

const METADATA_SQL: &str = "
SELECT current_setting('server_version'), current_database(),
       pg_encoding_to_char(d.encoding)::text, d.datcollate::text
FROM pg_database d
WHERE d.datname = current_database()";

const RELATIONS_SQL: &str = "
SELECT n.nspname::text, c.relname::text, c.reltuples::float8,
       pg_total_relation_size(c.oid)::int8, obj_description(c.oid, 'pg_class')
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'p')
  AND NOT c.relispartition
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_(toast|temp)'
ORDER BY 1, 2";

const COLUMNS_SQL: &str = "
SELECT n.nspname::text, c.relname::text, a.attnum::int4, a.attname::text,
       format_type(a.atttypid, a.atttypmod), NOT a.attnotnull,
       pg_get_expr(d.adbin, d.adrelid), a.attidentity::text,
       CASE WHEN t.typtype = 'e' THEN a.atttypid::int8 END,
       col_description(c.oid, a.attnum)
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_type t ON t.oid = a.atttypid
LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE c.relkind IN ('r', 'p', 'v', 'm')
  AND a.attnum > 0 AND NOT a.attisdropped
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_(toast|temp)'
ORDER BY 1, 2, 3";

const ENUM_LABELS_SQL: &str = "
SELECT e.enumtypid::int8, e.enumlabel::text
FROM pg_enum e
ORDER BY e.enumtypid, e.enumsortorder";

const CONSTRAINTS_SQL: &str = "
SELECT n.nspname::text, c.relname::text, con.conname::text, con.contype::text,
       ARRAY(SELECT a.attname::text
             FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
             ORDER BY k.ord),
       fn.nspname::text, fc.relname::text,
       ARRAY(SELECT a.attname::text
             FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
             ORDER BY k.ord),
       con.confdeltype::text, con.confupdtype::text,
       CASE WHEN con.contype = 'c' THEN pg_get_constraintdef(con.oid) END
FROM pg_constraint con
JOIN pg_class c ON c.oid = con.conrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_class fc ON fc.oid = con.confrelid
LEFT JOIN pg_namespace fn ON fn.oid = fc.relnamespace
WHERE con.contype IN ('p', 'u', 'f', 'c')
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_(toast|temp)'
ORDER BY 1, 2, 3";

// One row per index key column
const INDEXES_SQL: &str = "
SELECT n.nspname::text, t.relname::text, i.relname::text, ix.indisunique, ix.indisprimary,
       am.amname::text, pg_get_expr(ix.indpred, ix.indrelid),
       k.ord::int4, pg_get_indexdef(ix.indexrelid, k.ord::int4, true),
       (ix.indoption[(k.ord - 1)::int4] & 1) = 1
FROM pg_index ix
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
JOIN pg_am am ON am.oid = i.relam
CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
WHERE k.ord <= ix.indnkeyatts
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_(toast|temp)'
ORDER BY 1, 2, 3, 8";

const VIEWS_SQL: &str = "
SELECT schemaname::text, viewname::text, definition, false FROM pg_views
WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
UNION ALL
SELECT schemaname::text, matviewname::text, definition, true FROM pg_matviews
ORDER BY 1, 2";

const SEQUENCES_SQL: &str = "
SELECT schemaname::text, sequencename::text, data_type::text,
       start_value, increment_by, min_value, max_value, cycle
FROM pg_sequences
ORDER BY 1, 2";

const FUNCTIONS_SQL: &str = "
SELECT n.nspname::text, p.proname::text, p.prokind::text,
       pg_get_function_arguments(p.oid),
       CASE WHEN p.prokind = 'p' THEN NULL ELSE pg_get_function_result(p.oid) END,
       l.lanname::text
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
JOIN pg_language l ON l.oid = p.prolang
WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname !~ '^pg_(toast|temp)'
  AND NOT EXISTS (SELECT 1 FROM pg_depend dep WHERE dep.objid = p.oid AND dep.deptype = 'e')
ORDER BY 1, 2";

// One row per event
const TRIGGERS_SQL: &str = "
SELECT trigger_schema::text, event_object_table::text, trigger_name::text,
       action_timing::text, event_manipulation::text, action_statement::text
FROM information_schema.triggers
ORDER BY 1, 2, 3, action_order";

const TABLE_STATISTICS_SQL: &str = "
SELECT n.nspname::text, c.relname::text, c.reltuples::float8,
       pg_table_size(c.oid)::int8, pg_indexes_size(c.oid)::int8,
       pg_total_relation_size(c.oid)::int8,
       (SELECT count(*) FROM pg_index i WHERE i.indrelid = c.oid)::int4,
       s.n_dead_tup, s.n_mod_since_analyze, s.seq_scan, s.idx_scan,
       s.last_vacuum, s.last_autovacuum, s.last_analyze, s.last_autoanalyze
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_stat_user_tables s ON s.relid = c.oid
WHERE c.relkind IN ('r', 'p', 'm')
  AND c.relname = $1::text
  AND n.nspname = COALESCE($2::text, current_schema())";

fn cell<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<T> {
    row.try_get(idx)
        .map_err(|e| DbLensError::introspection(format!("Unexpected catalog row (column {idx}): {e}")))
}

/// `reltuples` is -1 for tables never vacuumed or analyzed
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn estimate(reltuples: Option<f64>) -> Option<u64> {
    reltuples.filter(|r| *r >= 0.0).map(|r| r.round() as u64)
}

/// Optional catalogs degrade to empty lists instead of failing the snapshot
fn optional<T>(what: &str, loaded: Result<Vec<T>>) -> Vec<T> {
    loaded.unwrap_or_else(|e| {
        warn!("Skipping {what}: {e}");
        Vec::new()
    })
}

async fn exact_count(client: &Client, schema: &str, name: &str) -> Result<u64> {
    let sql = format!(
        "SELECT count(*) FROM {}.{}",
        quote_ident(schema, QuoteStyle::Double),
        quote_ident(name, QuoteStyle::Double)
    );
    let row = client.query_one(&sql, &[]).await.map_err(|e| DbLensError::query(describe(&e)))?;
    let count: i64 = row.try_get(0).map_err(|e| DbLensError::query(e.to_string()))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

struct RelationRow {
    schema: String,
    name: String,
    estimated_rows: Option<u64>,
    size_bytes: Option<u64>,
    comment: Option<String>,
}

async fn load_relations(client: &Client) -> Result<Vec<RelationRow>> {
    let rows = client.query(RELATIONS_SQL, &[]).await.map_err(|e| catalog_error("tables", &e))?;
    rows.iter()
        .map(|row| {
            Ok(RelationRow {
                schema: cell(row, 0)?,
                name: cell(row, 1)?,
                estimated_rows: estimate(cell(row, 2)?),
                size_bytes: cell::<Option<i64>>(row, 3)?.and_then(|v| u64::try_from(v).ok()),
                comment: cell(row, 4)?,
            })
        })
        .collect()
}

async fn load_enum_labels(client: &Client) -> Result<BTreeMap<i64, Vec<String>>> {
    let rows = client.query(ENUM_LABELS_SQL, &[]).await.map_err(|e| catalog_error("enum types", &e))?;
    let mut labels: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for row in &rows {
        labels.entry(cell(row, 0)?).or_default().push(cell(row, 1)?);
    }
    Ok(labels)
}

async fn load_columns(
    client: &Client,
    enum_labels: &BTreeMap<i64, Vec<String>>,
) -> Result<BTreeMap<RelationKey, Vec<Column>>> {
    let rows = client.query(COLUMNS_SQL, &[]).await.map_err(|e| catalog_error("columns", &e))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let schema: String = cell(row, 0)?;
        let relation: String = cell(row, 1)?;
        let native_type: String = cell(row, 4)?;
        let default: Option<String> = cell(row, 6)?;
        let identity: Option<String> = cell(row, 7)?;
        let enum_oid: Option<i64> = cell(row, 8)?;

        let logical_type = types::map_type(&native_type, enum_oid.is_some());
        let (length, precision, scale) = column_dimensions(logical_type, &native_type);
        let auto_increment = identity.is_some_and(|i| !i.is_empty())
            || default.as_deref().is_some_and(|d| d.starts_with("nextval("));

        decoded.push((
            (schema, relation),
            Column {
                name: cell(row, 3)?,
                ordinal: u32::try_from(cell::<i32>(row, 2)?).unwrap_or(0),
                logical_type,
                native_type,
                nullable: cell(row, 5)?,
                default,
                auto_increment,
                length,
                precision,
                scale,
                enum_values: enum_oid.and_then(|oid| enum_labels.get(&oid).cloned()),
                comment: cell(row, 9)?,
            },
        ));
    }

    Ok(group_by_key(decoded, |(key, _)| key.clone())
        .into_iter()
        .map(|(key, mut cols)| {
            cols.sort_by_key(|(_, c)| c.ordinal);
            (key, cols.into_iter().map(|(_, c)| c).collect())
        })
        .collect())
}

struct ConstraintRow {
    name: String,
    kind: char,
    columns: Vec<String>,
    referenced_schema: Option<String>,
    referenced_table: Option<String>,
    referenced_columns: Vec<String>,
    on_delete: ReferentialAction,
    on_update: ReferentialAction,
    definition: Option<String>,
}

fn first_char(code: Option<String>) -> char {
    code.and_then(|c| c.chars().next()).unwrap_or(' ')
}

async fn load_constraints(client: &Client) -> Result<BTreeMap<RelationKey, Vec<ConstraintRow>>> {
    let rows = client.query(CONSTRAINTS_SQL, &[]).await.map_err(|e| catalog_error("constraints", &e))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let key: RelationKey = (cell(row, 0)?, cell(row, 1)?);
        decoded.push((
            key,
            ConstraintRow {
                name: cell(row, 2)?,
                kind: first_char(cell(row, 3)?),
                columns: cell::<Option<Vec<String>>>(row, 4)?.unwrap_or_default(),
                referenced_schema: cell(row, 5)?,
                referenced_table: cell(row, 6)?,
                referenced_columns: cell::<Option<Vec<String>>>(row, 7)?.unwrap_or_default(),
                on_delete: ReferentialAction::from_pg_code(first_char(cell(row, 8)?)),
                on_update: ReferentialAction::from_pg_code(first_char(cell(row, 9)?)),
                definition: cell(row, 10)?,
            },
        ));
    }

    Ok(group_by_key(decoded, |(key, _)| key.clone())
        .into_iter()
        .map(|(key, group)| (key, group.into_iter().map(|(_, c)| c).collect()))
        .collect())
}

/// `CHECK ((price > 0)) NOT VALID` → `price > 0`
fn check_expression(definition: &str) -> String {
    let body = definition.trim();
    let body = body.strip_prefix("CHECK").unwrap_or(body).trim();
    let body = body.strip_suffix("NOT VALID").unwrap_or(body).trim();
    strip_outer_parens(body).to_string()
}

fn apply_constraints(table: &mut Table, constraints: Vec<ConstraintRow>) {
    for constraint in constraints {
        match constraint.kind {
            'p' => {
                table.primary_key =
                    Some(PrimaryKey { name: Some(constraint.name), columns: constraint.columns });
            }
            'u' => table
                .unique_constraints
                .push(UniqueConstraint { name: constraint.name, columns: constraint.columns }),
            'f' => table.foreign_keys.push(ForeignKey {
                name: constraint.name,
                columns: constraint.columns,
                referenced_schema: constraint.referenced_schema,
                referenced_table: constraint.referenced_table.unwrap_or_default(),
                referenced_columns: constraint.referenced_columns,
                on_delete: constraint.on_delete,
                on_update: constraint.on_update,
            }),
            'c' => table.check_constraints.push(CheckConstraint {
                name: Some(constraint.name),
                expression: check_expression(constraint.definition.as_deref().unwrap_or_default()),
            }),
            _ => {}
        }
    }
}

struct IndexColumnRow {
    unique: bool,
    primary: bool,
    method: String,
    predicate: Option<String>,
    position: i32,
    expression: String,
    descending: bool,
}

async fn load_indexes(client: &Client) -> Result<BTreeMap<RelationKey, Vec<Index>>> {
    let rows = client.query(INDEXES_SQL, &[]).await.map_err(|e| catalog_error("indexes", &e))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let key: (String, String, String) = (cell(row, 0)?, cell(row, 1)?, cell(row, 2)?);
        decoded.push((
            key,
            IndexColumnRow {
                unique: cell(row, 3)?,
                primary: cell(row, 4)?,
                method: cell(row, 5)?,
                predicate: cell(row, 6)?,
                position: cell(row, 7)?,
                expression: cell(row, 8)?,
                descending: cell::<Option<bool>>(row, 9)?.unwrap_or(false),
            },
        ));
    }

    let mut by_table: BTreeMap<RelationKey, Vec<Index>> = BTreeMap::new();
    for ((schema, table, name), mut parts) in group_by_key(decoded, |(key, _)| key.clone()) {
        parts.sort_by_key(|(_, part)| part.position);
        let Some((_, head)) = parts.first() else { continue };
        let index = Index {
            name,
            unique: head.unique,
            primary: head.primary,
            kind: head.method.clone(),
            predicate: head.predicate.clone(),
            columns: parts
                .iter()
                .map(|(_, part)| IndexColumn {
                    name: part.expression.clone(),
                    direction: if part.descending { SortDirection::Desc } else { SortDirection::Asc },
                })
                .collect(),
        };
        by_table.entry((schema, table)).or_default().push(index);
    }
    Ok(by_table)
}

async fn load_views(client: &Client) -> Result<Vec<View>> {
    let rows = client.query(VIEWS_SQL, &[]).await.map_err(|e| catalog_error("views", &e))?;
    rows.iter()
        .map(|row| {
            Ok(View {
                schema: Some(cell(row, 0)?),
                name: cell(row, 1)?,
                definition: cell::<Option<String>>(row, 2)?.map(|d| d.trim().to_string()),
                columns: Vec::new(),
                materialized: cell(row, 3)?,
            })
        })
        .collect()
}

async fn load_sequences(client: &Client) -> Result<Vec<Sequence>> {
    let rows = client.query(SEQUENCES_SQL, &[]).await.map_err(|e| catalog_error("sequences", &e))?;
    rows.iter()
        .map(|row| {
            Ok(Sequence {
                schema: Some(cell(row, 0)?),
                name: cell(row, 1)?,
                data_type: cell(row, 2)?,
                start: cell::<Option<i64>>(row, 3)?.unwrap_or(1),
                increment: cell::<Option<i64>>(row, 4)?.unwrap_or(1),
                min_value: cell::<Option<i64>>(row, 5)?.unwrap_or(1),
                max_value: cell::<Option<i64>>(row, 6)?.unwrap_or(i64::MAX),
                cycle: cell(row, 7)?,
            })
        })
        .collect()
}

async fn load_functions(client: &Client) -> Result<Vec<Function>> {
    let rows = client.query(FUNCTIONS_SQL, &[]).await.map_err(|e| catalog_error("functions", &e))?;
    rows.iter()
        .map(|row| {
            let kind = match first_char(cell(row, 2)?) {
                'p' => "PROCEDURE",
                'a' => "AGGREGATE",
                'w' => "WINDOW",
                _ => "FUNCTION",
            };
            Ok(Function {
                schema: Some(cell(row, 0)?),
                name: cell(row, 1)?,
                kind: kind.to_string(),
                arguments: cell(row, 3)?,
                return_type: cell(row, 4)?,
                language: cell(row, 5)?,
            })
        })
        .collect()
}

async fn load_triggers(client: &Client) -> Result<Vec<Trigger>> {
    let rows = client.query(TRIGGERS_SQL, &[]).await.map_err(|e| catalog_error("triggers", &e))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let key: (String, String, String) = (cell(row, 0)?, cell(row, 1)?, cell(row, 2)?);
        let timing: String = cell(row, 3)?;
        let event: String = cell(row, 4)?;
        let statement: Option<String> = cell(row, 5)?;
        decoded.push((key, timing, event, statement));
    }

    Ok(group_by_key(decoded, |(key, ..)| key.clone())
        .into_iter()
        .filter_map(|((schema, table, name), events)| {
            let (_, timing, _, statement) = events.first()?.clone();
            Some(Trigger {
                name,
                schema: Some(schema),
                table,
                timing,
                events: events.into_iter().map(|(_, _, event, _)| event).collect(),
                statement,
            })
        })
        .collect())
}

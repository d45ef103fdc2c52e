//! Edge Case Testing
//!
//! Boundary conditions for the `SQLite` adapter:
//! - Large result sets and the row cap
//! - Special characters and Unicode
//! - Binary data (BLOBs)
//! - Numeric extremes
//! - Empty strings vs NULL
//! - Very long queries
//! - SQL-looking data and literals under read-only mode
//! - Identifier case handling

#![cfg(feature = "sqlite")]

use dblens::engine::shared::MAX_ROWS_LIMIT;
use dblens::{create_adapter, DatabaseAdapter, DatabaseConfig, QueryOptions, QueryParam};
use serde_json::Value;

// ============================================================================
// Test Helpers
// ============================================================================

fn create_test_db(label: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("dblens_edge_{}_{label}_{id}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);

    rusqlite::Connection::open(&path).expect("Failed to create temp database");
    path
}

fn cleanup(path: &std::path::Path) {
    let _ = std::fs::remove_file(path);
}

async fn open(path: &std::path::Path) -> Box<dyn DatabaseAdapter> {
    let mut adapter = create_adapter(DatabaseConfig::sqlite(path)).expect("valid config");
    adapter.connect().await.expect("connect");
    adapter
}

async fn exec(adapter: &dyn DatabaseAdapter, sql: &str, params: &[QueryParam]) {
    adapter
        .query(sql, params, &QueryOptions::default())
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"));
}

fn text(value: &str) -> QueryParam {
    QueryParam::Text(value.to_string())
}

// ============================================================================
// Large Dataset Tests
// ============================================================================

#[tokio::test]
async fn test_result_larger_than_row_cap() {
    let path = create_test_db("large");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE big (id INTEGER PRIMARY KEY, payload TEXT)", &[]).await;
    exec(
        adapter.as_ref(),
        "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 12000) \
         INSERT INTO big (id, payload) SELECT i, 'row ' || i FROM n",
        &[],
    )
    .await;

    // Requests above the hard limit are clamped
    let options = QueryOptions { max_rows: Some(50_000), ..QueryOptions::read_only() };
    let result = adapter.query("SELECT id, payload FROM big ORDER BY id", &[], &options).await.unwrap();

    assert_eq!(result.rows.len(), MAX_ROWS_LIMIT);
    assert_eq!(result.row_count, 12_000);
    assert!(result.truncated);
    assert_eq!(result.rows[0]["id"], 1);
    assert_eq!(result.rows[MAX_ROWS_LIMIT - 1]["payload"], "row 10000");

    cleanup(&path);
}

#[tokio::test]
async fn test_default_row_cap() {
    let path = create_test_db("default_cap");
    let adapter = open(&path).await;

    let result = adapter
        .query(
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 1500) SELECT i FROM n",
            &[],
            &QueryOptions::read_only(),
        )
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 1000);
    assert_eq!(result.row_count, 1500);
    assert!(result.truncated);

    cleanup(&path);
}

// ============================================================================
// Unicode and Special Character Tests
// ============================================================================

#[tokio::test]
async fn test_unicode_characters() {
    let path = create_test_db("unicode");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE unicode_test (id INTEGER PRIMARY KEY, body TEXT)", &[]).await;

    let samples = [
        "Hello 世界 🌍 Здравствуй мир",
        "Emoji test: 🚀🔥💯✨🎉",
        "Arabic: مرحبا بالعالم Hebrew: שלום עולם",
    ];
    for sample in samples {
        exec(adapter.as_ref(), "INSERT INTO unicode_test (body) VALUES (?)", &[text(sample)]).await;
    }

    let result = adapter
        .query("SELECT body FROM unicode_test ORDER BY id", &[], &QueryOptions::read_only())
        .await
        .unwrap();
    let bodies: Vec<&str> = result.rows.iter().filter_map(|r| r["body"].as_str()).collect();
    assert_eq!(bodies, samples);

    // Multibyte text as a bound parameter in a filter
    let result = adapter
        .query(
            "SELECT id FROM unicode_test WHERE body LIKE ?",
            &[text("%🚀%")],
            &QueryOptions::read_only(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["id"], 2);

    cleanup(&path);
}

#[tokio::test]
async fn test_unicode_identifiers() {
    let path = create_test_db("unicode_ident");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), r#"CREATE TABLE "données" ("clé" INTEGER PRIMARY KEY, "valeur" TEXT)"#, &[]).await;
    exec(adapter.as_ref(), r#"INSERT INTO "données" ("valeur") VALUES ('été')"#, &[]).await;

    let snapshot = adapter.introspect().await.unwrap();
    let table = snapshot.table("données").expect("table with unicode name");
    assert_eq!(table.columns[0].name, "clé");

    let result = adapter
        .query(r#"SELECT "valeur" FROM "données""#, &[], &QueryOptions::read_only())
        .await
        .unwrap();
    assert_eq!(result.fields[0].name, "valeur");
    assert_eq!(result.rows[0]["valeur"], "été");

    let stats = adapter.table_statistics("données").await.unwrap();
    assert_eq!(stats.row_count, Some(1));

    cleanup(&path);
}

#[tokio::test]
async fn test_special_sql_characters() {
    let path = create_test_db("special");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE special_chars (id INTEGER PRIMARY KEY, body TEXT)", &[]).await;

    let samples = [
        "Text with 'single quotes' and \"double quotes\"",
        "Text with; semicolons; and -- comments",
        "Text with\nnewlines\nand\ttabs",
        "/* not a comment */ \\ backslash",
    ];
    for sample in samples {
        exec(adapter.as_ref(), "INSERT INTO special_chars (body) VALUES (?)", &[text(sample)]).await;
    }

    let result = adapter
        .query("SELECT body FROM special_chars ORDER BY id", &[], &QueryOptions::read_only())
        .await
        .unwrap();
    let bodies: Vec<&str> = result.rows.iter().filter_map(|r| r["body"].as_str()).collect();
    assert_eq!(bodies, samples);

    cleanup(&path);
}

#[tokio::test]
async fn test_injection_payload_is_stored_as_data() {
    let path = create_test_db("payload");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE students (id INTEGER PRIMARY KEY, name TEXT)", &[]).await;

    let payload = "Robert'); DROP TABLE students;--";
    exec(adapter.as_ref(), "INSERT INTO students (name) VALUES (?)", &[text(payload)]).await;

    let result = adapter
        .query("SELECT name FROM students WHERE name = ?", &[text(payload)], &QueryOptions::read_only())
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["name"], payload);

    // The table is still there
    let snapshot = adapter.introspect().await.unwrap();
    assert!(snapshot.table("students").is_some());

    cleanup(&path);
}

#[tokio::test]
async fn test_read_only_allows_keywords_inside_literals() {
    let path = create_test_db("literal_keywords");
    let adapter = open(&path).await;

    let result = adapter
        .query(
            "SELECT 'DROP TABLE users; DELETE FROM users' AS s -- UPDATE users SET x = 1",
            &[],
            &QueryOptions::read_only(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0]["s"], "DROP TABLE users; DELETE FROM users");

    cleanup(&path);
}

#[tokio::test]
async fn test_read_only_refuses_second_statement() {
    let path = create_test_db("stacked");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE t (id INTEGER)", &[]).await;

    let err = adapter
        .query("SELECT 1; SELECT 2", &[], &QueryOptions::read_only())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "READ_ONLY_VIOLATION");

    let err = adapter
        .query("SELECT 1; DELETE FROM t", &[], &QueryOptions::read_only())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "READ_ONLY_VIOLATION");

    cleanup(&path);
}

#[tokio::test]
async fn test_second_statement_never_runs() {
    let path = create_test_db("multi");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE t (id INTEGER)", &[]).await;
    exec(adapter.as_ref(), "INSERT INTO t VALUES (1), (2)", &[]).await;

    let err = adapter
        .query("UPDATE t SET id = 10 WHERE id = 1; DELETE FROM t", &[], &QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "QUERY_EXECUTION_ERROR");

    let result = adapter
        .query("SELECT id FROM t ORDER BY id", &[], &QueryOptions::read_only())
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0]["id"], 1);

    cleanup(&path);
}

#[tokio::test]
async fn test_read_only_refuses_data_modifying_cte() {
    let path = create_test_db("cte");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE t (id INTEGER)", &[]).await;

    let err = adapter
        .query(
            "WITH gone AS (DELETE FROM t RETURNING id) SELECT id FROM gone",
            &[],
            &QueryOptions::read_only(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "READ_ONLY_VIOLATION");

    cleanup(&path);
}

// ============================================================================
// Binary Data (BLOB) Tests
// ============================================================================

#[tokio::test]
async fn test_binary_blob_data() {
    let path = create_test_db("blob");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE blob_test (id INTEGER PRIMARY KEY, data BLOB)", []).unwrap();
        let binary: Vec<u8> = vec![0, 1, 2, 255, 128, 64, 32, 16];
        conn.execute("INSERT INTO blob_test (data) VALUES (?)", [&binary]).unwrap();
        conn.execute("INSERT INTO blob_test (data) VALUES (zeroblob(0))", []).unwrap();
    }

    let adapter = open(&path).await;
    let result = adapter
        .query("SELECT data, typeof(data) AS kind FROM blob_test ORDER BY id", &[], &QueryOptions::read_only())
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 2);
    // base64 of the raw bytes
    assert_eq!(result.rows[0]["data"], "AAEC/4BAIBA=");
    assert_eq!(result.rows[0]["kind"], "blob");
    assert_eq!(result.rows[1]["data"], "");
    assert_eq!(result.fields[0].native_type, "BLOB");

    cleanup(&path);
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[tokio::test]
async fn test_numeric_extremes() {
    let path = create_test_db("numeric");
    let adapter = open(&path).await;
    exec(
        adapter.as_ref(),
        "CREATE TABLE numeric_test (
            id INTEGER PRIMARY KEY,
            max_int INTEGER,
            min_int INTEGER,
            zero INTEGER,
            large_real REAL,
            small_real REAL
        )",
        &[],
    )
    .await;
    exec(
        adapter.as_ref(),
        "INSERT INTO numeric_test (max_int, min_int, zero, large_real, small_real) VALUES (?, ?, ?, ?, ?)",
        &[
            QueryParam::Int(i64::MAX),
            QueryParam::Int(i64::MIN),
            QueryParam::Int(0),
            QueryParam::Float(1.797_693_134_862_315_7e308),
            QueryParam::Float(2.225_073_858_507_201_4e-308),
        ],
    )
    .await;

    let result = adapter
        .query("SELECT max_int, min_int, zero, large_real, small_real FROM numeric_test", &[], &QueryOptions::read_only())
        .await
        .unwrap();

    let row = &result.rows[0];
    assert_eq!(row["max_int"].as_i64(), Some(i64::MAX));
    assert_eq!(row["min_int"].as_i64(), Some(i64::MIN));
    assert_eq!(row["zero"].as_i64(), Some(0));
    assert_eq!(row["large_real"].as_f64(), Some(f64::MAX));
    assert!(row["small_real"].as_f64().is_some_and(|v| v > 0.0));

    cleanup(&path);
}

#[tokio::test]
async fn test_non_finite_reals_become_null() {
    let path = create_test_db("non_finite");
    let adapter = open(&path).await;

    // 9e999 overflows to +Inf in SQLite
    let result = adapter
        .query("SELECT 9e999 AS inf, -9e999 AS neg_inf", &[], &QueryOptions::read_only())
        .await
        .unwrap();
    assert_eq!(result.rows[0]["inf"], Value::Null);
    assert_eq!(result.rows[0]["neg_inf"], Value::Null);

    cleanup(&path);
}

#[tokio::test]
async fn test_boolean_and_json_parameters() {
    let path = create_test_db("param_kinds");
    let adapter = open(&path).await;

    let params = [
        QueryParam::Bool(true),
        QueryParam::from_json(&serde_json::json!({"a": [1, 2]})),
        QueryParam::from_json(&serde_json::json!(2.5)),
        QueryParam::Null,
    ];
    let result = adapter
        .query("SELECT ? AS flag, ? AS doc, ? AS half, ? AS nothing", &params, &QueryOptions::read_only())
        .await
        .unwrap();

    let row = &result.rows[0];
    assert_eq!(row["flag"], 1);
    assert_eq!(row["doc"], r#"{"a":[1,2]}"#);
    assert_eq!(row["half"], 2.5);
    assert_eq!(row["nothing"], Value::Null);

    cleanup(&path);
}

// ============================================================================
// Empty String vs NULL Tests
// ============================================================================

#[tokio::test]
async fn test_empty_string_vs_null() {
    let path = create_test_db("null");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE null_test (id INTEGER PRIMARY KEY, value TEXT)", &[]).await;
    exec(adapter.as_ref(), "INSERT INTO null_test (value) VALUES (?)", &[text("")]).await;
    exec(adapter.as_ref(), "INSERT INTO null_test (value) VALUES (?)", &[QueryParam::Null]).await;

    let result = adapter
        .query("SELECT value FROM null_test ORDER BY id", &[], &QueryOptions::read_only())
        .await
        .unwrap();

    assert_eq!(result.rows[0]["value"], Value::String(String::new()));
    assert_eq!(result.rows[1]["value"], Value::Null);

    let result = adapter
        .query("SELECT COUNT(*) AS n FROM null_test WHERE value IS NULL", &[], &QueryOptions::read_only())
        .await
        .unwrap();
    assert_eq!(result.rows[0]["n"], 1);

    cleanup(&path);
}

#[tokio::test]
async fn test_null_first_row_keeps_declared_type() {
    let path = create_test_db("null_type");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE t (id INTEGER PRIMARY KEY, amount NUMERIC(8, 2))", &[]).await;
    exec(adapter.as_ref(), "INSERT INTO t (amount) VALUES (NULL), (1.5)", &[]).await;

    let result = adapter
        .query("SELECT amount, amount * 2 AS doubled FROM t ORDER BY id", &[], &QueryOptions::read_only())
        .await
        .unwrap();

    assert_eq!(result.fields[0].native_type, "NUMERIC(8, 2)");
    // Expression columns take the storage class of the first non-null value
    assert_eq!(result.fields[1].native_type, "REAL");

    cleanup(&path);
}

// ============================================================================
// Query Shape Tests
// ============================================================================

#[tokio::test]
async fn test_very_long_query() {
    let path = create_test_db("long");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE t (id INTEGER PRIMARY KEY)", &[]).await;
    exec(
        adapter.as_ref(),
        "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 500) INSERT INTO t SELECT i FROM n",
        &[],
    )
    .await;

    let ids: Vec<String> = (1..=2000).map(|i| i.to_string()).collect();
    let sql = format!("SELECT COUNT(*) AS n FROM t WHERE id IN ({})", ids.join(", "));
    assert!(sql.len() > 8000);

    let result = adapter.query(&sql, &[], &QueryOptions::read_only()).await.unwrap();
    assert_eq!(result.rows[0]["n"], 500);

    cleanup(&path);
}

#[tokio::test]
async fn test_leading_whitespace_and_comments() {
    let path = create_test_db("whitespace");
    let adapter = open(&path).await;

    let sql = "\n\n   -- report\n  /* block */\t SELECT 1 AS one  \n\n";
    let result = adapter.query(sql, &[], &QueryOptions::read_only()).await.unwrap();
    assert_eq!(result.rows[0]["one"], 1);

    cleanup(&path);
}

#[tokio::test]
async fn test_trailing_semicolon_is_one_statement() {
    let path = create_test_db("semicolon");
    let adapter = open(&path).await;

    let result = adapter.query("SELECT 2 AS two;", &[], &QueryOptions::read_only()).await.unwrap();
    assert_eq!(result.rows[0]["two"], 2);

    cleanup(&path);
}

#[tokio::test]
async fn test_duplicate_column_names_keep_last_value() {
    let path = create_test_db("dup_columns");
    let adapter = open(&path).await;

    let result = adapter
        .query("SELECT 1 AS v, 2 AS v", &[], &QueryOptions::read_only())
        .await
        .unwrap();
    assert_eq!(result.fields.len(), 2);
    assert_eq!(result.rows[0].len(), 1);
    assert_eq!(result.rows[0]["v"], 2);

    cleanup(&path);
}

// ============================================================================
// Case Sensitivity Tests
// ============================================================================

#[tokio::test]
async fn test_identifier_case() {
    let path = create_test_db("case");
    let adapter = open(&path).await;
    exec(adapter.as_ref(), "CREATE TABLE Accounts (Id INTEGER PRIMARY KEY, DisplayName TEXT)", &[]).await;
    exec(adapter.as_ref(), "INSERT INTO Accounts (DisplayName) VALUES ('x')", &[]).await;

    // Declared spelling is reported
    let snapshot = adapter.introspect().await.unwrap();
    let table = snapshot.table("Accounts").unwrap();
    assert_eq!(table.columns[1].name, "DisplayName");

    // Result keys follow the query's spelling
    let result = adapter
        .query("SELECT displayname FROM accounts", &[], &QueryOptions::read_only())
        .await
        .unwrap();
    assert_eq!(result.fields[0].name, "displayname");

    // SQLite resolves table names case-insensitively, and so do statistics
    let stats = adapter.table_statistics("ACCOUNTS").await.unwrap();
    assert_eq!(stats.table, "Accounts");

    cleanup(&path);
}

//! Schema Introspection Performance Benchmarks
//!
//! Full `introspect()` snapshots and `table_statistics()` against `SQLite`
//! files of increasing size:
//! - A single table
//! - Related tables with foreign keys, indexes, a view and a trigger
//! - Many tables (catalog traversal cost)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dblens::{create_adapter, DatabaseAdapter, DatabaseConfig};

fn bench_db(label: &str, schema: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("dblens_bench_{label}.db"));
    let _ = std::fs::remove_file(&path);
    let conn = rusqlite::Connection::open(&path).expect("Failed to create database");
    conn.execute_batch(schema).expect("Failed to create schema");
    path
}

fn connect(runtime: &tokio::runtime::Runtime, path: &std::path::Path) -> Box<dyn DatabaseAdapter> {
    let mut adapter = create_adapter(DatabaseConfig::sqlite(path)).expect("valid config");
    runtime.block_on(adapter.connect()).expect("connect");
    adapter
}

const SIMPLE: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT);";

const RELATED: &str = "
CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT NOT NULL UNIQUE, email TEXT NOT NULL);
CREATE TABLE posts (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    title VARCHAR(200) NOT NULL,
    body TEXT,
    published_at DATETIME
);
CREATE TABLE comments (
    id INTEGER PRIMARY KEY,
    post_id INTEGER NOT NULL REFERENCES posts(id),
    user_id INTEGER NOT NULL REFERENCES users(id),
    body TEXT NOT NULL
);
CREATE INDEX posts_user ON posts (user_id, published_at DESC);
CREATE INDEX comments_post ON comments (post_id);
CREATE VIEW recent_posts AS SELECT id, title FROM posts ORDER BY published_at DESC LIMIT 10;
CREATE TRIGGER comments_touch AFTER INSERT ON comments BEGIN SELECT 1; END;
";

fn many_tables(count: usize) -> String {
    (0..count)
        .map(|i| {
            format!(
                "CREATE TABLE t{i} (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES t{i}(id), label TEXT);\n\
                 CREATE INDEX t{i}_label ON t{i} (label);\n"
            )
        })
        .collect()
}

fn bench_introspect(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("sqlite_introspect");

    for (label, schema) in [("simple", SIMPLE.to_string()), ("related", RELATED.to_string())] {
        let path = bench_db(label, &schema);
        let adapter = connect(&runtime, &path);
        group.bench_function(label, |b| {
            b.iter(|| {
                let snapshot = runtime.block_on(adapter.introspect()).expect("introspect");
                black_box(snapshot)
            });
        });
        let _ = std::fs::remove_file(&path);
    }

    for count in [10usize, 100] {
        let path = bench_db(&format!("many_{count}"), &many_tables(count));
        let adapter = connect(&runtime, &path);
        group.bench_with_input(BenchmarkId::new("tables", count), &count, |b, _| {
            b.iter(|| {
                let snapshot = runtime.block_on(adapter.introspect()).expect("introspect");
                black_box(snapshot.tables.len())
            });
        });
        let _ = std::fs::remove_file(&path);
    }

    group.finish();
}

fn bench_table_statistics(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let path = bench_db("stats", RELATED);
    {
        let conn = rusqlite::Connection::open(&path).expect("open");
        conn.execute_batch(
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 5000)
             INSERT INTO users (username, email) SELECT 'user' || i, 'u' || i || '@example.com' FROM n;",
        )
        .expect("seed");
    }
    let adapter = connect(&runtime, &path);

    c.bench_function("sqlite_table_statistics", |b| {
        b.iter(|| {
            let stats = runtime.block_on(adapter.table_statistics(black_box("users"))).expect("stats");
            black_box(stats)
        });
    });

    let _ = std::fs::remove_file(&path);
}

criterion_group!(benches, bench_introspect, bench_table_statistics);
criterion_main!(benches);

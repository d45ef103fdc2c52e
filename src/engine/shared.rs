//! Helpers shared by every adapter
//!
//! Limit normalization, qualified-name parsing, identifier quoting, type
//! parameter parsing, natural-key grouping and the row collector used to
//! enforce `max_rows`. Nothing here touches a connection.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use base64::Engine as _;
use serde_json::Value;

use super::model::LogicalType;
use super::{QueryOptions, Row};
use crate::error::{DbLensError, Result};
use crate::safety::{self, QueryType};

/// Statement timeout used when the caller gives none
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Upper bound for any statement timeout
pub const MAX_TIMEOUT_MS: u64 = 300_000;
/// Row cap used when the caller gives none
pub const DEFAULT_MAX_ROWS: usize = 1_000;
/// Upper bound for any row cap
pub const MAX_ROWS_LIMIT: usize = 10_000;
/// Tables estimated below this many rows get an exact `COUNT(*)`
pub const EXACT_COUNT_THRESHOLD: u64 = 10_000;
/// `SQLite` tables below this many bytes get an exact `COUNT(*)`
pub const EXACT_COUNT_MAX_BYTES: u64 = 64 * 1024 * 1024;
/// Extra time the runtime deadline allows beyond the engine-side timeout
const BACKSTOP_GRACE_MS: u64 = 1_000;

/// Clamp a requested timeout to `[1, MAX_TIMEOUT_MS]`
#[must_use]
pub fn normalize_timeout(requested: Option<u64>) -> u64 {
    requested.unwrap_or(DEFAULT_TIMEOUT_MS).clamp(1, MAX_TIMEOUT_MS)
}

/// Clamp a requested row cap to `[1, MAX_ROWS_LIMIT]`
#[must_use]
pub fn normalize_max_rows(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_MAX_ROWS).clamp(1, MAX_ROWS_LIMIT)
}

/// Whether an exact count is cheap enough for a table with this estimate
#[must_use]
pub fn wants_exact_count(estimated_rows: Option<u64>) -> bool {
    estimated_rows.is_some_and(|rows| rows < EXACT_COUNT_THRESHOLD)
}

#[must_use]
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// `schema.name` split into its parts, quotes removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

/// Parse `name`, `schema.name` or any quoted form (`"a.b"`, `` `a` ``, `[a]`)
///
/// # Errors
/// `Configuration` on an empty name or unterminated quote
pub fn parse_qualified_name(raw: &str) -> Result<QualifiedName> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut chars = raw.trim().chars().peekable();

    while let Some(ch) = chars.next() {
        let close = match ch {
            '"' => Some('"'),
            '`' => Some('`'),
            '[' => Some(']'),
            _ => None,
        };
        if let Some(close) = close {
            let mut terminated = false;
            while let Some(c) = chars.next() {
                if c == close {
                    if chars.peek() == Some(&close) && close != ']' {
                        chars.next();
                        current.push(close);
                        continue;
                    }
                    terminated = true;
                    break;
                }
                current.push(c);
            }
            if !terminated {
                return Err(DbLensError::configuration(format!(
                    "Unterminated quoted identifier in '{raw}'"
                )));
            }
        } else if ch == '.' {
            parts.push(std::mem::take(&mut current));
        } else if !ch.is_whitespace() {
            current.push(ch);
        }
    }
    parts.push(current);

    if parts.iter().any(String::is_empty) {
        return Err(DbLensError::configuration(format!("Invalid table name '{raw}'")));
    }

    let name = parts.pop().unwrap_or_default();
    let schema = parts.pop();
    Ok(QualifiedName { schema, name })
}

/// Identifier quoting convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    /// `"name"` (`PostgreSQL`, `SQLite`)
    Double,
    /// `` `name` `` (`MySQL`)
    Backtick,
}

/// Quote an identifier, doubling embedded quote characters
#[must_use]
pub fn quote_ident(name: &str, style: QuoteStyle) -> String {
    let quote = match style {
        QuoteStyle::Double => '"',
        QuoteStyle::Backtick => '`',
    };
    let mut out = String::with_capacity(name.len() + 2);
    out.push(quote);
    for ch in name.chars() {
        if ch == quote {
            out.push(quote);
        }
        out.push(ch);
    }
    out.push(quote);
    out
}

/// Length/precision and scale declared in a native type string:
/// `varchar(255)` → `(Some(255), None)`, `numeric(10, 2)` → `(Some(10), Some(2))`
#[must_use]
pub fn parse_type_parameters(native: &str) -> (Option<u32>, Option<u32>) {
    let Some(open) = native.find('(') else {
        return (None, None);
    };
    let Some(close) = native[open..].find(')') else {
        return (None, None);
    };
    let mut numbers = native[open + 1..open + close].split(',').map(|p| p.trim().parse::<u32>().ok());
    let first = numbers.next().flatten();
    let second = numbers.next().flatten();
    (first, second)
}

/// `(length, precision, scale)` for a column, from the parameters of its
/// native type. Which slot a number lands in depends on the logical type.
#[must_use]
pub fn column_dimensions(logical: LogicalType, native: &str) -> (Option<u32>, Option<u32>, Option<u32>) {
    let (first, second) = parse_type_parameters(native);
    match logical {
        LogicalType::Text | LogicalType::Blob => (first, None, None),
        LogicalType::Decimal | LogicalType::Real => (None, first, second),
        LogicalType::Datetime | LogicalType::Time => (None, first, None),
        _ => (None, None, None),
    }
}

/// Values of an `enum('a','b')` / `set(...)` declaration
#[must_use]
pub fn parse_enum_values(native: &str) -> Option<Vec<String>> {
    let open = native.find('(')?;
    let close = native.rfind(')')?;
    let body = native.get(open + 1..close)?;

    let mut values = Vec::new();
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\'' {
            continue;
        }
        let mut value = String::new();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    value.push('\'');
                    continue;
                }
                break;
            }
            value.push(c);
        }
        values.push(value);
    }
    Some(values)
}

/// Group catalog rows by natural key. Keys come out sorted, rows keep their
/// relative input order within each group.
pub fn group_by_key<K, T, I, F>(rows: I, key: F) -> BTreeMap<K, Vec<T>>
where
    K: Ord,
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> K,
{
    let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for row in rows {
        groups.entry(key(&row)).or_default().push(row);
    }
    groups
}

/// Enforces `max_rows` while still counting every row the engine produced
#[derive(Debug)]
pub struct RowCollector {
    max_rows: usize,
    rows: Vec<Row>,
    seen: u64,
}

impl RowCollector {
    #[must_use]
    pub fn new(max_rows: usize) -> Self {
        Self { max_rows, rows: Vec::with_capacity(max_rows.min(256)), seen: 0 }
    }

    /// Count one engine row; true when it should be converted and kept
    pub fn accept(&mut self) -> bool {
        self.seen += 1;
        self.rows.len() < self.max_rows
    }

    pub fn push(&mut self, row: Row) {
        if self.rows.len() < self.max_rows {
            self.rows.push(row);
        }
    }

    /// `(rows, row_count, truncated)`
    #[must_use]
    pub fn finish(self) -> (Vec<Row>, u64, bool) {
        let truncated = self.seen > self.rows.len() as u64;
        (self.rows, self.seen, truncated)
    }
}

/// Runtime deadline around an engine call whose own statement timeout is
/// `timeout_ms`. Fires only if the engine fails to abort in time.
pub async fn with_deadline<T, F>(timeout_ms: u64, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let deadline = Duration::from_millis(timeout_ms.saturating_add(BACKSTOP_GRACE_MS));
    tokio::time::timeout(deadline, operation)
        .await
        .map_err(|_| DbLensError::timeout(format!("Query exceeded timeout of {timeout_ms}ms")))?
}

/// Run the safety analyzer once before a query reaches the engine. Refuses
/// mutations when `read_only` is set and multi-statement text always.
/// Returns the detected statement kind.
///
/// # Errors
/// `ReadOnly` for a mutating or multi-statement query under `read_only`,
/// `QueryExecution` for multi-statement text otherwise
pub fn check_statement(sql: &str, options: &QueryOptions) -> Result<QueryType> {
    let verdict = safety::analyze(sql);
    let kind = verdict.meta.query_type;
    let count = verdict.meta.statement_count;
    if options.read_only && (verdict.meta.is_mutation || count > 1) {
        return Err(DbLensError::read_only(format!(
            "{kind:?} statement refused: query was submitted read-only"
        )));
    }
    if count > 1 {
        return Err(DbLensError::query(format!(
            "Query contains {count} statements; submit exactly one statement per call"
        )));
    }
    Ok(kind)
}

/// Plan requested alongside results: `None`, or `Some(analyze)`.
/// Analyze is downgraded to an estimated plan for anything but reads.
#[must_use]
pub fn embedded_plan_mode(options: &QueryOptions, kind: QueryType) -> Option<bool> {
    if !(options.explain || options.analyze) {
        return None;
    }
    Some(options.analyze && kind == QueryType::Select)
}

/// Float to JSON; NaN and infinities become `null`
#[must_use]
pub fn float_to_json(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Binary data as a base64 JSON string
#[must_use]
pub fn blob_to_json(bytes: &[u8]) -> Value {
    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Strip the outer parentheses from a catalog expression such as `((a > 0))`
#[must_use]
pub fn strip_outer_parens(expr: &str) -> &str {
    let mut s = expr.trim();
    while s.starts_with('(') && s.ends_with(')') {
        let inner = &s[1..s.len() - 1];
        let mut depth = 0i32;
        let balanced = inner.chars().all(|c| {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            depth >= 0
        });
        if !balanced || depth != 0 {
            break;
        }
        s = inner.trim();
    }
    s
}

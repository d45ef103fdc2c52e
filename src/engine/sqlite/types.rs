//! `SQLite` declared type → [`LogicalType`] mapping table.
//!
//! Well-known type names are matched first (`BOOLEAN`, `DATETIME`, `JSON`,
//! ...), then the column affinity substrings from the `SQLite` type rules
//! (`INT`, `CHAR`/`CLOB`/`TEXT`, `BLOB`, `REAL`/`FLOA`/`DOUB`). Anything
//! that would only get `NUMERIC` affinity by elimination is
//! [`LogicalType::Unknown`].

use crate::engine::model::LogicalType;

/// Map a column's declared type (`PRAGMA table_xinfo.type`)
#[must_use]
pub fn map_type(declared: &str) -> LogicalType {
    let upper = declared.trim().to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or_default().trim();

    match base {
        "" => return LogicalType::Unknown,
        "BOOL" | "BOOLEAN" => return LogicalType::Boolean,
        "DATE" => return LogicalType::Date,
        "TIME" => return LogicalType::Time,
        "DATETIME" | "TIMESTAMP" | "TIMESTAMPTZ" => return LogicalType::Datetime,
        "JSON" | "JSONB" => return LogicalType::Json,
        "UUID" | "GUID" => return LogicalType::Uuid,
        "DECIMAL" | "NUMERIC" | "MONEY" => return LogicalType::Decimal,
        "STRING" => return LogicalType::Text,
        _ => {}
    }

    if upper.contains("INT") {
        LogicalType::Integer
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        LogicalType::Text
    } else if upper.contains("BLOB") {
        LogicalType::Blob
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        LogicalType::Real
    } else {
        LogicalType::Unknown
    }
}

/// Storage class name of a runtime value, used for result columns that
/// have no declared type (expressions)
#[must_use]
pub fn storage_class(value: rusqlite::types::ValueRef<'_>) -> &'static str {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => "NULL",
        ValueRef::Integer(_) => "INTEGER",
        ValueRef::Real(_) => "REAL",
        ValueRef::Text(_) => "TEXT",
        ValueRef::Blob(_) => "BLOB",
    }
}

//! `PostgreSQL` native type → [`LogicalType`] mapping table.

use crate::engine::model::LogicalType;

/// Remove `(...)` modifiers wherever they appear: `timestamp(3) with time zone`
fn strip_modifiers(native: &str) -> String {
    let mut out = String::with_capacity(native.len());
    let mut depth = 0u32;
    for ch in native.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map a `format_type()` string. `is_enum` is true when the type has
/// `pg_enum` labels; unknown names map to [`LogicalType::Unknown`].
#[must_use]
pub fn map_type(native: &str, is_enum: bool) -> LogicalType {
    let lowered = native.trim().to_ascii_lowercase();
    if lowered.ends_with("[]") || lowered.starts_with('_') {
        return LogicalType::Array;
    }
    if is_enum {
        return LogicalType::Enum;
    }

    let base = strip_modifiers(&lowered);
    // Schema-qualified user types ("public.mood") are only known through pg_enum
    let base = base.trim_matches('"');

    match base {
        "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" | "smallserial"
        | "serial" | "bigserial" | "serial2" | "serial4" | "serial8" | "oid" | "xid" => {
            LogicalType::Integer
        }
        "real" | "double precision" | "float4" | "float8" | "float" => LogicalType::Real,
        "numeric" | "decimal" | "money" => LogicalType::Decimal,
        "boolean" | "bool" => LogicalType::Boolean,
        "text" | "character varying" | "varchar" | "character" | "char" | "bpchar" | "name"
        | "citext" | "\"char\"" | "inet" | "cidr" | "macaddr" | "macaddr8" | "bit"
        | "bit varying" | "varbit" | "tsvector" | "tsquery" | "xml" | "ltree" => {
            LogicalType::Text
        }
        "bytea" => LogicalType::Blob,
        "date" => LogicalType::Date,
        "time" | "time without time zone" | "time with time zone" | "timetz" => LogicalType::Time,
        "timestamp" | "timestamp without time zone" | "timestamp with time zone"
        | "timestamptz" => LogicalType::Datetime,
        "interval" => LogicalType::Interval,
        "json" | "jsonb" => LogicalType::Json,
        "uuid" => LogicalType::Uuid,
        "point" | "line" | "lseg" | "box" | "path" | "polygon" | "circle" | "geometry"
        | "geography" => LogicalType::Spatial,
        _ => LogicalType::Unknown,
    }
}

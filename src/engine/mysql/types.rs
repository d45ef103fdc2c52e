//! `MySQL`/`MariaDB` type names → [`LogicalType`], plus wire column type names.

use mysql_async::consts::ColumnType;
use mysql_async::Column;

use crate::engine::model::LogicalType;

/// Charset number `MySQL` reports for binary data
pub(crate) const BINARY_CHARSET: u16 = 63;

/// Map `information_schema.COLUMNS` (`DATA_TYPE`, `COLUMN_TYPE`)
#[must_use]
pub fn map_type(data_type: &str, column_type: &str) -> LogicalType {
    let data_type = data_type.trim().to_ascii_lowercase();
    let column_type = column_type.trim().to_ascii_lowercase();

    match data_type.as_str() {
        // tinyint(1) is the conventional boolean column
        "tinyint" if column_type.starts_with("tinyint(1)") => LogicalType::Boolean,
        "bit" if column_type == "bit(1)" => LogicalType::Boolean,
        "bool" | "boolean" => LogicalType::Boolean,
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" | "bit" => {
            LogicalType::Integer
        }
        "float" | "double" | "double precision" | "real" => LogicalType::Real,
        "decimal" | "numeric" | "dec" | "fixed" => LogicalType::Decimal,
        "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "inet4"
        | "inet6" => LogicalType::Text,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            LogicalType::Blob
        }
        "date" => LogicalType::Date,
        "time" => LogicalType::Time,
        "datetime" | "timestamp" => LogicalType::Datetime,
        "json" => LogicalType::Json,
        "uuid" => LogicalType::Uuid,
        "enum" | "set" => LogicalType::Enum,
        "geometry" | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring"
        | "multipolygon" | "geometrycollection" | "geomcollection" => LogicalType::Spatial,
        _ => LogicalType::Unknown,
    }
}

/// SQL-level name for a result column's wire type
#[must_use]
pub fn column_type_name(column: &Column) -> &'static str {
    let binary = column.character_set() == BINARY_CHARSET;
    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY => "TINYINT",
        ColumnType::MYSQL_TYPE_SHORT => "SMALLINT",
        ColumnType::MYSQL_TYPE_INT24 => "MEDIUMINT",
        ColumnType::MYSQL_TYPE_LONG => "INT",
        ColumnType::MYSQL_TYPE_LONGLONG => "BIGINT",
        ColumnType::MYSQL_TYPE_FLOAT => "FLOAT",
        ColumnType::MYSQL_TYPE_DOUBLE => "DOUBLE",
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => "DECIMAL",
        ColumnType::MYSQL_TYPE_YEAR => "YEAR",
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => "DATE",
        ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => "TIME",
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_DATETIME2 => "DATETIME",
        ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => "TIMESTAMP",
        ColumnType::MYSQL_TYPE_BIT => "BIT",
        ColumnType::MYSQL_TYPE_JSON => "JSON",
        ColumnType::MYSQL_TYPE_ENUM => "ENUM",
        ColumnType::MYSQL_TYPE_SET => "SET",
        ColumnType::MYSQL_TYPE_GEOMETRY => "GEOMETRY",
        ColumnType::MYSQL_TYPE_NULL => "NULL",
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB => {
            if binary {
                "BLOB"
            } else {
                "TEXT"
            }
        }
        ColumnType::MYSQL_TYPE_VARCHAR | ColumnType::MYSQL_TYPE_VAR_STRING => {
            if binary {
                "VARBINARY"
            } else {
                "VARCHAR"
            }
        }
        ColumnType::MYSQL_TYPE_STRING => {
            if binary {
                "BINARY"
            } else {
                "CHAR"
            }
        }
        _ => "UNKNOWN",
    }
}

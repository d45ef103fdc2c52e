//! Wire values → JSON and [`QueryParam`] → `mysql_async` values.
//!
//! The text protocol (queries without parameters) returns every value as
//! bytes, so decoding is driven by the column's wire type rather than by
//! the `Value` variant alone.

use mysql_async::consts::ColumnType;
use mysql_async::{Column, Value};
use serde_json::Value as Json;

use super::types::BINARY_CHARSET;
use crate::engine::shared::{blob_to_json, float_to_json};
use crate::engine::QueryParam;

/// Positional parameter → driver value
pub(crate) fn to_mysql_value(param: &QueryParam) -> Value {
    match param {
        QueryParam::Null => Value::NULL,
        QueryParam::Bool(b) => Value::Int(i64::from(*b)),
        QueryParam::Int(i) => Value::Int(*i),
        QueryParam::Float(f) => Value::Double(*f),
        QueryParam::Text(t) => Value::Bytes(t.as_bytes().to_vec()),
    }
}

fn format_date(column: &Column, parts: (u16, u8, u8, u8, u8, u8, u32)) -> String {
    let (year, month, day, hour, minute, second, micros) = parts;
    let date = format!("{year:04}-{month:02}-{day:02}");
    if matches!(column.column_type(), ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE) {
        return date;
    }
    if micros == 0 {
        format!("{date}T{hour:02}:{minute:02}:{second:02}")
    } else {
        format!("{date}T{hour:02}:{minute:02}:{second:02}.{micros:06}")
    }
}

fn format_time(negative: bool, days: u32, hours: u8, minutes: u8, seconds: u8, micros: u32) -> String {
    let sign = if negative { "-" } else { "" };
    let hours = days * 24 + u32::from(hours);
    if micros == 0 {
        format!("{sign}{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
    }
}

fn text_or_base64(bytes: &[u8]) -> Json {
    match std::str::from_utf8(bytes) {
        Ok(s) => Json::String(s.to_string()),
        Err(_) => blob_to_json(bytes),
    }
}

fn decode_bytes(bytes: &[u8], column: &Column) -> Json {
    let text = || std::str::from_utf8(bytes).ok();

    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text()
            .and_then(|t| {
                t.parse::<i64>()
                    .map(Json::from)
                    .or_else(|_| t.parse::<u64>().map(Json::from))
                    .ok()
            })
            .unwrap_or_else(|| text_or_base64(bytes)),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text()
            .and_then(|t| t.parse::<f64>().ok())
            .map_or_else(|| text_or_base64(bytes), float_to_json),
        // Exact decimal text is kept as a string
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => text_or_base64(bytes),
        ColumnType::MYSQL_TYPE_JSON => {
            serde_json::from_slice(bytes).unwrap_or_else(|_| text_or_base64(bytes))
        }
        ColumnType::MYSQL_TYPE_BIT => {
            Json::from(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
        }
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
            text().map_or_else(|| blob_to_json(bytes), |t| Json::String(t.replacen(' ', "T", 1)))
        }
        _ if column.character_set() == BINARY_CHARSET => blob_to_json(bytes),
        _ => text_or_base64(bytes),
    }
}

/// Convert one value of a result row
pub(crate) fn value_to_json(value: &Value, column: &Column) -> Json {
    match value {
        Value::NULL => Json::Null,
        Value::Bytes(bytes) => decode_bytes(bytes, column),
        Value::Int(i) => Json::from(*i),
        Value::UInt(u) => Json::from(*u),
        Value::Float(f) => float_to_json(f64::from(*f)),
        Value::Double(d) => float_to_json(*d),
        Value::Date(year, month, day, hour, minute, second, micros) => Json::String(format_date(
            column,
            (*year, *month, *day, *hour, *minute, *second, *micros),
        )),
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            Json::String(format_time(*negative, *days, *hours, *minutes, *seconds, *micros))
        }
    }
}

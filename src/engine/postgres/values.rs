//! Row values → JSON, and [`QueryParam`] → typed parameters.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::Row;

use crate::engine::shared::{blob_to_json, float_to_json};
use crate::engine::QueryParam;
use crate::error::{DbLensError, Result};

/// Undecoded wire bytes, for types without a native Rust mapping
struct RawBytes(Vec<u8>);

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        DbLensError::query(format!(
            "Failed to read column '{}' ({}): {e}",
            row.columns()[idx].name(),
            row.columns()[idx].type_().name()
        ))
    })
}

fn array<'a, T, F>(row: &'a Row, idx: usize, convert: F) -> Result<Value>
where
    T: FromSql<'a>,
    F: Fn(T) -> Value,
{
    Ok(get::<Vec<Option<T>>>(row, idx)?.map_or(Value::Null, |items| {
        Value::Array(items.into_iter().map(|v| v.map_or(Value::Null, &convert)).collect())
    }))
}

/// Convert column `idx` of `row` to JSON
pub(crate) fn value_to_json(row: &Row, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_().clone();

    let value = match ty {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::from),
        Type::OID => get::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| float_to_json(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(float_to_json),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, idx)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(|v| blob_to_json(&v)),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => get::<NaiveDate>(row, idx)?.map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::TIME => get::<NaiveTime>(row, idx)?.map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::NUMERIC => get::<RawBytes>(row, idx)?
            .map(|raw| decode_numeric(&raw.0).map_or(Value::Null, Value::String)),
        Type::INTERVAL => get::<RawBytes>(row, idx)?
            .map(|raw| decode_interval(&raw.0).map_or(Value::Null, Value::String)),
        Type::BOOL_ARRAY => Some(array::<bool, _>(row, idx, Value::Bool)?),
        Type::INT2_ARRAY => Some(array::<i16, _>(row, idx, Value::from)?),
        Type::INT4_ARRAY => Some(array::<i32, _>(row, idx, Value::from)?),
        Type::INT8_ARRAY => Some(array::<i64, _>(row, idx, Value::from)?),
        Type::FLOAT8_ARRAY => Some(array::<f64, _>(row, idx, float_to_json)?),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => Some(array::<String, _>(row, idx, Value::String)?),
        // Enums, citext and other text-backed types send their label as UTF-8
        _ => get::<RawBytes>(row, idx)?.map(|raw| match String::from_utf8(raw.0) {
            Ok(text) => Value::String(text),
            Err(e) => blob_to_json(e.as_bytes()),
        }),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Binary `numeric` → exact decimal string
pub(crate) fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |i: usize| raw.get(i..i + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(2)? as i16);
    let sign = word(4)?;
    let dscale = usize::from(word(6)?);

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + i * 2)).collect::<Option<_>>()?;
    let digit_at = |pos: i32| usize::try_from(pos).ok().and_then(|p| digits.get(p).copied()).unwrap_or(0);

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                out.push_str(&digit_at(pos).to_string());
            } else {
                out.push_str(&format!("{:04}", digit_at(pos)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Some(out)
}

/// Binary `interval` → ISO-8601 duration
pub(crate) fn decode_interval(raw: &[u8]) -> Option<String> {
    let micros = i64::from_be_bytes(raw.get(0..8)?.try_into().ok()?);
    let days = i32::from_be_bytes(raw.get(8..12)?.try_into().ok()?);
    let months = i32::from_be_bytes(raw.get(12..16)?.try_into().ok()?);

    let mut out = String::from("P");
    let (years, months) = (months / 12, months % 12);
    if years != 0 {
        out.push_str(&format!("{years}Y"));
    }
    if months != 0 {
        out.push_str(&format!("{months}M"));
    }
    if days != 0 {
        out.push_str(&format!("{days}D"));
    }

    let hours = micros / 3_600_000_000;
    let minutes = (micros % 3_600_000_000) / 60_000_000;
    let seconds = (micros % 60_000_000) as f64 / 1_000_000.0;
    if micros != 0 {
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes != 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if seconds != 0.0 {
            out.push_str(&format!("{seconds}S"));
        }
    }
    if out == "P" {
        out.push_str("T0S");
    }
    Some(out)
}

pub(crate) type BoxedParam = Box<dyn ToSql + Sync + Send>;

fn parse_text<T: std::str::FromStr>(text: &str, ty: &Type, position: usize) -> Result<T> {
    text.parse::<T>().map_err(|_| {
        DbLensError::query(format!(
            "Parameter ${position}: cannot convert '{text}' to {}",
            ty.name()
        ))
    })
}

/// Bind one parameter according to the type Postgres inferred for it
fn bind_one(param: &QueryParam, ty: &Type, position: usize) -> Result<BoxedParam> {
    let mismatch = || {
        DbLensError::query(format!(
            "Parameter ${position}: cannot bind {param:?} to {}; add an explicit cast such as ${position}::text",
            ty.name()
        ))
    };

    let boxed: BoxedParam = match (ty.clone(), param) {
        (Type::BOOL, QueryParam::Null) => Box::new(None::<bool>),
        (Type::BOOL, QueryParam::Bool(v)) => Box::new(*v),
        (Type::BOOL, QueryParam::Text(t)) => Box::new(parse_text::<bool>(t, ty, position)?),

        (Type::INT2, QueryParam::Null) => Box::new(None::<i16>),
        (Type::INT2, QueryParam::Int(v)) => Box::new(i16::try_from(*v).map_err(|_| mismatch())?),
        (Type::INT2, QueryParam::Text(t)) => Box::new(parse_text::<i16>(t, ty, position)?),
        (Type::INT4, QueryParam::Null) => Box::new(None::<i32>),
        (Type::INT4, QueryParam::Int(v)) => Box::new(i32::try_from(*v).map_err(|_| mismatch())?),
        (Type::INT4, QueryParam::Text(t)) => Box::new(parse_text::<i32>(t, ty, position)?),
        (Type::INT8, QueryParam::Null) => Box::new(None::<i64>),
        (Type::INT8, QueryParam::Int(v)) => Box::new(*v),
        (Type::INT8, QueryParam::Text(t)) => Box::new(parse_text::<i64>(t, ty, position)?),

        (Type::FLOAT4, QueryParam::Null) => Box::new(None::<f32>),
        #[allow(clippy::cast_possible_truncation)]
        (Type::FLOAT4, QueryParam::Float(v)) => Box::new(*v as f32),
        #[allow(clippy::cast_precision_loss)]
        (Type::FLOAT4, QueryParam::Int(v)) => Box::new(*v as f32),
        (Type::FLOAT8, QueryParam::Null) => Box::new(None::<f64>),
        (Type::FLOAT8, QueryParam::Float(v)) => Box::new(*v),
        #[allow(clippy::cast_precision_loss)]
        (Type::FLOAT8, QueryParam::Int(v)) => Box::new(*v as f64),
        (Type::FLOAT4, QueryParam::Text(t)) => Box::new(parse_text::<f32>(t, ty, position)?),
        (Type::FLOAT8, QueryParam::Text(t)) => Box::new(parse_text::<f64>(t, ty, position)?),

        (Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN, QueryParam::Null) => {
            Box::new(None::<String>)
        }
        (Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN, QueryParam::Text(t)) => {
            Box::new(t.clone())
        }
        (Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN, QueryParam::Int(v)) => {
            Box::new(v.to_string())
        }
        (Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN, QueryParam::Float(v)) => {
            Box::new(v.to_string())
        }
        (Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN, QueryParam::Bool(v)) => {
            Box::new(v.to_string())
        }

        (Type::JSON | Type::JSONB, QueryParam::Null) => Box::new(None::<Value>),
        (Type::JSON | Type::JSONB, QueryParam::Text(t)) => {
            Box::new(serde_json::from_str::<Value>(t).unwrap_or_else(|_| Value::String(t.clone())))
        }
        (Type::JSON | Type::JSONB, other) => {
            Box::new(serde_json::to_value(other).map_err(|e| DbLensError::query(e.to_string()))?)
        }

        (Type::UUID, QueryParam::Null) => Box::new(None::<uuid::Uuid>),
        (Type::UUID, QueryParam::Text(t)) => Box::new(parse_text::<uuid::Uuid>(t, ty, position)?),

        (Type::TIMESTAMPTZ, QueryParam::Null) => Box::new(None::<DateTime<Utc>>),
        (Type::TIMESTAMPTZ, QueryParam::Text(t)) => Box::new(
            DateTime::parse_from_rfc3339(t)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| mismatch())?,
        ),
        (Type::TIMESTAMP, QueryParam::Null) => Box::new(None::<NaiveDateTime>),
        (Type::TIMESTAMP, QueryParam::Text(t)) => Box::new(
            NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f"))
                .map_err(|_| mismatch())?,
        ),
        (Type::DATE, QueryParam::Null) => Box::new(None::<NaiveDate>),
        (Type::DATE, QueryParam::Text(t)) => Box::new(parse_text::<NaiveDate>(t, ty, position)?),
        (Type::TIME, QueryParam::Null) => Box::new(None::<NaiveTime>),
        (Type::TIME, QueryParam::Text(t)) => Box::new(parse_text::<NaiveTime>(t, ty, position)?),

        (Type::BYTEA, QueryParam::Null) => Box::new(None::<Vec<u8>>),
        (Type::BYTEA, QueryParam::Text(t)) => Box::new(t.as_bytes().to_vec()),

        _ => return Err(mismatch()),
    };
    Ok(boxed)
}

/// Bind `params` positionally against a prepared statement's parameter types
pub(crate) fn bind_params(params: &[QueryParam], types: &[Type]) -> Result<Vec<BoxedParam>> {
    if params.len() != types.len() {
        return Err(DbLensError::query(format!(
            "Statement expects {} parameter(s), {} given",
            types.len(),
            params.len()
        )));
    }
    params
        .iter()
        .zip(types)
        .enumerate()
        .map(|(i, (param, ty))| bind_one(param, ty, i + 1))
        .collect()
}

/// Borrow boxed parameters the way `Client::query` expects them
pub(crate) fn as_refs(params: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        assert_eq!(decode_numeric(&numeric(2, 0, 0, 2, &[123, 4500])).as_deref(), Some("123.45"));
        assert_eq!(decode_numeric(&numeric(1, -1, 0, 3, &[10])).as_deref(), Some("0.001"));
        assert_eq!(decode_numeric(&numeric(2, 1, 0, 0, &[1234, 5678])).as_deref(), Some("12345678"));
        assert_eq!(decode_numeric(&numeric(1, 1, 0, 0, &[1])).as_deref(), Some("10000"));
        assert_eq!(decode_numeric(&numeric(1, 0, 0x4000, 1, &[7])).as_deref(), Some("-7.0"));
        assert_eq!(decode_numeric(&numeric(0, 0, 0, 0, &[])).as_deref(), Some("0"));
        assert_eq!(decode_numeric(&numeric(0, 0, 0xC000, 0, &[])).as_deref(), Some("NaN"));
        assert_eq!(decode_numeric(&[0, 1]), None);
    }

    #[test]
    fn test_decode_interval() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(3_723_500_000_i64).to_be_bytes());
        raw.extend_from_slice(&2_i32.to_be_bytes());
        raw.extend_from_slice(&14_i32.to_be_bytes());
        assert_eq!(decode_interval(&raw).as_deref(), Some("P1Y2M2DT1H2M3.5S"));

        let zero = [0u8; 16];
        assert_eq!(decode_interval(&zero).as_deref(), Some("PT0S"));
    }

    #[test]
    fn test_bind_params_checks_arity() {
        let err = bind_params(&[QueryParam::Int(1)], &[]).err().unwrap();
        assert!(err.message().contains("expects 0 parameter(s), 1 given"));
    }

    #[test]
    fn test_bind_params_by_type() {
        let bound = bind_params(
            &[QueryParam::Int(5), QueryParam::Text("x".into()), QueryParam::Null],
            &[Type::INT4, Type::TEXT, Type::TIMESTAMPTZ],
        );
        assert!(bound.is_ok());

        let err = bind_params(&[QueryParam::Text("abc".into())], &[Type::INT8]).err().unwrap();
        assert!(err.message().contains("$1"));

        let err = bind_params(&[QueryParam::Int(70_000)], &[Type::INT2]).err().unwrap();
        assert!(err.message().contains("cannot bind"));
    }
}

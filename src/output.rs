//! JSON Output Envelope Types
//!
//! Every CLI command and dispatcher tool answers with one of two envelopes.
//!
//! # Output Contract
//! - Success: `{"ok": true, "engine": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "engine": "...", "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! `engine` is empty for commands that do not touch a database (`analyze`).

use serde::{Deserialize, Serialize};

use crate::error::DbLensError;

/// Success envelope for operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Engine used for this operation (postgres, mysql, sqlite)
    pub engine: String,

    /// Command that was executed (introspect, query, explain, ...)
    pub command: String,

    /// Operation-specific data
    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, engine: engine.into(), command: command.into(), data, meta }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub engine: String,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, engine: engine.into(), command: command.into(), error }
    }

    /// Build from a [`DbLensError`], keeping its stable code
    pub fn from_error(engine: impl Into<String>, command: impl Into<String>, err: &DbLensError) -> Self {
        Self::new(engine, command, ErrorInfo::from(err))
    }
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. `QUERY_TIMEOUT`, `NOT_FOUND`)
    pub code: String,

    /// Engine detail preserved, secrets redacted
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

impl From<&DbLensError> for ErrorInfo {
    fn from(err: &DbLensError) -> Self {
        Self::new(err.error_code(), err.message())
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Wall-clock time of the whole command in milliseconds
    pub execution_ms: u64,

    /// Rows returned to the caller (query results only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,

    /// Set when the returned rows were cut at `max_rows`
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub truncated: bool,
}

impl Metadata {
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None, truncated: false }
    }

    #[must_use]
    pub const fn with_rows(execution_ms: u64, rows_returned: usize, truncated: bool) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned), truncated }
    }
}

/// Serialize a success envelope to a single JSON line
///
/// # Errors
/// Serialization failure of `data`
pub fn success_json<T: Serialize>(
    engine: &str,
    command: &str,
    data: T,
    meta: Metadata,
) -> serde_json::Result<String> {
    serde_json::to_string(&SuccessEnvelope::new(engine, command, data, meta))
}

/// Serialize an error envelope; never fails
#[must_use]
pub fn error_json(engine: &str, command: &str, err: &DbLensError) -> String {
    let envelope = ErrorEnvelope::from_error(engine, command, err);
    serde_json::to_string(&envelope).unwrap_or_else(|_| {
        format!(r#"{{"ok":false,"engine":"","command":"","error":{{"code":"{}","message":""}}}}"#, err.error_code())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_serialization() {
        let json = success_json("postgres", "query", serde_json::json!({"result": "test"}), Metadata::with_rows(42, 10, false))
            .unwrap();

        assert!(json.contains(r#""ok":true"#));
        assert!(json.contains(r#""engine":"postgres"#));
        assert!(json.contains(r#""command":"query"#));
        assert!(json.contains(r#""execution_ms":42"#));
        assert!(json.contains(r#""rows_returned":10"#));
        assert!(!json.contains("truncated"));
    }

    #[test]
    fn test_error_envelope_from_error() {
        let err = DbLensError::timeout("Query exceeded timeout of 50ms");
        let envelope = ErrorEnvelope::from_error("sqlite", "query", &err);

        assert!(!envelope.ok);
        assert_eq!(envelope.engine, "sqlite");
        assert_eq!(envelope.error.code, "QUERY_TIMEOUT");
        assert!(envelope.error.message.contains("50ms"));
    }

    #[test]
    fn test_error_json_shape() {
        let err = DbLensError::not_found("Table 'ghost' does not exist");
        let value: serde_json::Value = serde_json::from_str(&error_json("mysql", "stats", &err)).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["command"], "stats");
        assert_eq!(value["error"]["code"], "NOT_FOUND");
    }

    #[test]
    fn test_metadata_truncated_flag() {
        let json = serde_json::to_string(&Metadata::with_rows(5, 100, true)).unwrap();
        assert!(json.contains(r#""truncated":true"#));

        let json = serde_json::to_string(&Metadata::new(100)).unwrap();
        assert!(json.contains(r#""execution_ms":100"#));
        assert!(!json.contains("rows_returned"));
    }
}

//! MCP (Model Context Protocol) Server
//!
//! JSON-RPC 2.0 over stdio, one request per line, implemented by hand with
//! `serde_json`. The server is a thin dispatcher: every tool maps onto one
//! [`DatabaseAdapter`] operation or onto the safety analyzer.
//!
//! # State
//!
//! The [`Dispatcher`] owns at most one adapter. `connect` on a live
//! dispatcher disconnects the current adapter before the next one is
//! created; adapters are never reconfigured in place.
//!
//! # MCP Tools
//!
//! - `connect` / `disconnect` / `status`
//! - `introspect` - full schema snapshot
//! - `query` - analyzer-gated execution (`confirm: true` to pass warnings)
//! - `explain` - normalized plan and recommendations
//! - `analyze_query` - safety verdict only, no connection required
//! - `table_statistics`
//!
//! # Usage
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "dblens": { "command": "dblens", "args": ["serve"] }
//!   }
//! }
//! ```

use std::io::{self, BufRead, Write};
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{save_connection, ConfigLocation, ConnectionParams};
use crate::engine::{create_adapter, DatabaseAdapter, QueryOptions, QueryParam};
use crate::error::DbLensError;
use crate::output::{ErrorEnvelope, Metadata, SuccessEnvelope};
use crate::safety::{self, QueryVerdict};

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, value: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(value), error: None }
    }

    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

impl TextContent {
    fn new(text: String) -> Self {
        Self { content_type: "text".to_string(), text }
    }
}

/// MCP tool call result; the text block is a JSON envelope
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    fn success<T: Serialize>(envelope: &SuccessEnvelope<T>) -> Result<Value> {
        let text = serde_json::to_string_pretty(envelope)?;
        Ok(serde_json::to_value(Self { content: vec![TextContent::new(text)], is_error: false })?)
    }

    fn failure(envelope: &ErrorEnvelope) -> Result<Value> {
        let text = serde_json::to_string_pretty(envelope)?;
        Ok(serde_json::to_value(Self { content: vec![TextContent::new(text)], is_error: true })?)
    }
}

// ============================================================================
// Tool arguments
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConnectArgs {
    #[serde(flatten)]
    params: ConnectionParams,
    /// Save the profile: "local" or "global"
    save: Option<String>,
    /// Profile name used with `save`
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryArgs {
    sql: String,
    params: Vec<Value>,
    #[serde(flatten)]
    options: QueryOptions,
    /// Proceed despite findings that require confirmation
    confirm: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExplainArgs {
    sql: String,
    analyze: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TableArgs {
    table: String,
}

fn parse_args<T: for<'de> Deserialize<'de> + Default>(arguments: &Value) -> Result<T, DbLensError> {
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments.clone())
        .map_err(|e| DbLensError::configuration(format!("Invalid tool arguments: {e}")))
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Tool dispatcher holding the single active adapter
#[derive(Default)]
pub struct Dispatcher {
    adapter: Option<Box<dyn DatabaseAdapter>>,
    /// Profile forced every query to read-only
    readonly: bool,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one line of input; `None` for blank lines and notifications
    pub async fn handle_line(&mut self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            return None;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => {
                // Notifications carry no id and get no answer
                if request.id.is_none() && request.method.starts_with("notifications/") {
                    debug!("Ignoring notification {}", request.method);
                    return None;
                }
                self.handle_request(request).await
            }
            Err(e) => JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {e}")),
        };

        match serde_json::to_string(&response) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("Failed to serialize response: {e}");
                None
            }
        }
    }

    async fn handle_request(&mut self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;
        let result = match request.method.as_str() {
            "initialize" => Ok(handle_initialize()),
            "tools/list" => Ok(handle_list_tools()),
            "tools/call" => match request.params {
                Some(params) => self.handle_call_tool(&params).await,
                None => return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params".to_string()),
            },
            other => {
                return JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Unknown method: {other}"))
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::result(id, value),
            Err(e) => JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        }
    }

    async fn handle_call_tool(&mut self, params: &Value) -> Result<Value> {
        let name = params["name"].as_str().ok_or_else(|| anyhow!("Missing tool name"))?;
        let arguments = &params["arguments"];
        let start = Instant::now();
        debug!("Tool call {name}");

        let outcome = match name {
            "connect" => self.tool_connect(arguments).await,
            "disconnect" => self.tool_disconnect().await,
            "status" => Ok(self.tool_status()),
            "introspect" => self.tool_introspect().await,
            "query" => self.tool_query(arguments).await,
            "explain" => self.tool_explain(arguments).await,
            "analyze_query" => tool_analyze_query(arguments),
            "table_statistics" => self.tool_table_statistics(arguments).await,
            _ => return Err(anyhow!("Unknown tool: {name}")),
        };

        let engine = self.adapter.as_ref().map_or("", |a| a.engine().as_str());
        let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Ok((data, meta)) => CallToolResult::success(&SuccessEnvelope::new(
                engine,
                name,
                data,
                Metadata { execution_ms: elapsed, ..meta },
            )),
            Err(err) => CallToolResult::failure(&ErrorEnvelope::from_error(engine, name, &err)),
        }
    }

    fn adapter(&self) -> Result<&dyn DatabaseAdapter, DbLensError> {
        self.adapter
            .as_deref()
            .ok_or_else(|| DbLensError::connection("No active connection; call the connect tool first"))
    }

    async fn release(&mut self) -> Result<(), DbLensError> {
        if let Some(mut adapter) = self.adapter.take() {
            adapter.disconnect().await?;
        }
        self.readonly = false;
        Ok(())
    }

    async fn tool_connect(&mut self, arguments: &Value) -> ToolOutcome {
        let args: ConnectArgs = parse_args(arguments)?;
        let (config, readonly) = args.params.resolve()?;
        let target = config.describe();

        // Destroy before recreate
        if let Err(e) = self.release().await {
            warn!("Previous connection did not close cleanly: {e}");
        }

        let mut adapter = create_adapter(config.clone())?;
        adapter.connect().await?;
        info!("Connected to {target}");

        let saved_to = match args.save.as_deref() {
            None => None,
            Some(location) => {
                let location = match location {
                    "local" => ConfigLocation::Local,
                    "global" => ConfigLocation::Global,
                    other => {
                        return Err(DbLensError::configuration(format!(
                            "Invalid save location '{other}' (expected local or global)"
                        )))
                    }
                };
                let name = args.name.as_deref().unwrap_or("default");
                Some(save_connection(name, config, location)?.display().to_string())
            }
        };

        let engine = adapter.engine();
        self.adapter = Some(adapter);
        self.readonly = readonly;

        Ok((
            serde_json::json!({
                "engine": engine,
                "target": target,
                "readonly": readonly,
                "saved_to": saved_to,
            }),
            Metadata::default(),
        ))
    }

    async fn tool_disconnect(&mut self) -> ToolOutcome {
        let was_connected = self.adapter.is_some();
        self.release().await?;
        Ok((serde_json::json!({ "disconnected": was_connected }), Metadata::default()))
    }

    fn tool_status(&self) -> (Value, Metadata) {
        let status = self.adapter.as_ref().map_or_else(
            || serde_json::json!({ "connected": false }),
            |adapter| {
                serde_json::json!({
                    "connected": adapter.is_connected(),
                    "engine": adapter.engine(),
                    "target": adapter.config().describe(),
                    "readonly": self.readonly,
                })
            },
        );
        (status, Metadata::default())
    }

    async fn tool_introspect(&self) -> ToolOutcome {
        let snapshot = self.adapter()?.introspect().await?;
        Ok((to_value(&snapshot)?, Metadata::default()))
    }

    async fn tool_query(&self, arguments: &Value) -> ToolOutcome {
        let args: QueryArgs = parse_args(arguments)?;
        let verdict = gate(&args.sql, args.confirm)?;

        let mut options = args.options;
        options.read_only |= self.readonly;
        let params: Vec<QueryParam> = args.params.iter().map(QueryParam::from_json).collect();

        let result = self.adapter()?.query(&args.sql, &params, &options).await?;
        let meta = Metadata::with_rows(result.execution_ms, result.rows.len(), result.truncated);
        Ok((serde_json::json!({ "result": result, "findings": verdict.findings }), meta))
    }

    async fn tool_explain(&self, arguments: &Value) -> ToolOutcome {
        let args: ExplainArgs = parse_args(arguments)?;
        if args.analyze {
            // Analyze executes the statement
            gate(&args.sql, false)?;
        }
        let report = self.adapter()?.explain(&args.sql, args.analyze).await?;
        Ok((to_value(&report)?, Metadata::default()))
    }

    async fn tool_table_statistics(&self, arguments: &Value) -> ToolOutcome {
        let args: TableArgs = parse_args(arguments)?;
        let stats = self.adapter()?.table_statistics(&args.table).await?;
        Ok((to_value(&stats)?, Metadata::default()))
    }
}

type ToolOutcome = Result<(Value, Metadata), DbLensError>;

fn to_value<T: Serialize>(data: &T) -> Result<Value, DbLensError> {
    serde_json::to_value(data).map_err(|e| DbLensError::query(format!("Failed to serialize result: {e}")))
}

fn tool_analyze_query(arguments: &Value) -> ToolOutcome {
    let args: ExplainArgs = parse_args(arguments)?;
    Ok((to_value(&safety::analyze(&args.sql))?, Metadata::default()))
}

/// Refuse invalid statements, and statements needing confirmation unless
/// `confirm` is set
fn gate(sql: &str, confirm: bool) -> Result<QueryVerdict, DbLensError> {
    let verdict = safety::analyze(sql);
    let codes = || {
        verdict
            .findings
            .iter()
            .filter(|f| f.severity >= safety::Severity::Warning)
            .map(|f| f.code.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    if !verdict.is_valid {
        return Err(DbLensError::blocked(format!("Statement refused by safety analysis: {}", codes())));
    }
    if verdict.meta.requires_confirmation && !confirm {
        return Err(DbLensError::blocked(format!(
            "Statement requires confirmation ({}); resend with confirm=true",
            codes()
        )));
    }
    Ok(verdict)
}

// ============================================================================
// MCP Protocol Handlers
// ============================================================================

fn handle_initialize() -> Value {
    serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "dblens",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

fn connection_properties() -> Value {
    serde_json::json!({
        "connection": { "type": "string", "description": "Saved profile name; omit everything to use the default profile" },
        "url": { "type": "string", "description": "Connection URL (postgres://, mysql://, mariadb://, sqlite:path)" },
        "engine": { "type": "string", "enum": ["postgres", "mysql", "sqlite"] },
        "host": { "type": "string" },
        "port": { "type": "number" },
        "user": { "type": "string" },
        "password": { "type": "string" },
        "database": { "type": "string" },
        "file": { "type": "string", "description": "SQLite database file or :memory:" },
        "ssl": { "type": "boolean" }
    })
}

fn handle_list_tools() -> Value {
    let mut connect_properties = connection_properties();
    if let Some(map) = connect_properties.as_object_mut() {
        map.insert(
            "save".into(),
            serde_json::json!({ "type": "string", "enum": ["local", "global"], "description": "Save as a profile (.dblens/connections.json or the user config dir)" }),
        );
        map.insert("name".into(), serde_json::json!({ "type": "string", "description": "Profile name for save" }));
    }

    serde_json::json!({
        "tools": [
            {
                "name": "connect",
                "description": "Open a connection and keep it for subsequent tools. Replaces any current connection. Never invent credentials: ask the user.",
                "inputSchema": { "type": "object", "properties": connect_properties }
            },
            {
                "name": "disconnect",
                "description": "Close the current connection.",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "status",
                "description": "Report whether a connection is open and to what.",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "introspect",
                "description": "Snapshot of tables, columns, keys, indexes, views, sequences, functions and triggers with canonical types.",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "query",
                "description": "Execute one SQL statement. Statements the safety analysis rejects are refused; mutations and dangerous patterns need confirm=true. Results are capped at max_rows (default 1000, max 10000).",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "sql": { "type": "string" },
                        "params": { "type": "array", "description": "Positional parameters" },
                        "read_only": { "type": "boolean" },
                        "timeout_ms": { "type": "number", "description": "Statement timeout (default 30000, max 300000)" },
                        "max_rows": { "type": "number" },
                        "explain": { "type": "boolean", "description": "Attach the estimated plan" },
                        "analyze": { "type": "boolean", "description": "Attach the executed plan (read statements only)" },
                        "confirm": { "type": "boolean" }
                    },
                    "required": ["sql"]
                }
            },
            {
                "name": "explain",
                "description": "Normalized execution plan with index and join recommendations. analyze=true executes the statement inside a rolled-back transaction.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "sql": { "type": "string" },
                        "analyze": { "type": "boolean" }
                    },
                    "required": ["sql"]
                }
            },
            {
                "name": "analyze_query",
                "description": "Static safety and complexity analysis of a statement. Does not need a connection.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "sql": { "type": "string" } },
                    "required": ["sql"]
                }
            },
            {
                "name": "table_statistics",
                "description": "Row count, sizes, index count and maintenance figures for one table (name or schema.name).",
                "inputSchema": {
                    "type": "object",
                    "properties": { "table": { "type": "string" } },
                    "required": ["table"]
                }
            }
        ]
    })
}

// ============================================================================
// MCP Server
// ============================================================================

/// Run the stdio server loop until stdin closes
///
/// # Errors
/// stdio failures
#[allow(clippy::future_not_send)]
pub async fn serve() -> Result<()> {
    let stdin = io::stdin();
    let reader = stdin.lock();
    let mut stdout = io::stdout();
    let mut dispatcher = Dispatcher::new();

    info!("dblens MCP server listening on stdio");
    for line in reader.lines() {
        let line = line?;
        if let Some(response) = dispatcher.handle_line(&line).await {
            writeln!(stdout, "{response}")?;
            stdout.flush()?;
        }
    }

    dispatcher.release().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn call(dispatcher: &mut Dispatcher, request: Value) -> Value {
        let line = dispatcher.handle_line(&request.to_string()).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn tool(id: u64, name: &str, arguments: Value) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments }
        })
    }

    /// Envelope inside a tool result
    fn envelope(response: &Value) -> Value {
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let mut dispatcher = Dispatcher::new();
        let init = call(&mut dispatcher, serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
        assert_eq!(init["result"]["serverInfo"]["name"], "dblens");

        let list = call(&mut dispatcher, serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})).await;
        let names: Vec<&str> =
            list["result"]["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec!["connect", "disconnect", "status", "introspect", "query", "explain", "analyze_query", "table_statistics"]
        );
    }

    #[tokio::test]
    async fn test_parse_error_and_unknown_method() {
        let mut dispatcher = Dispatcher::new();
        let line = dispatcher.handle_line("{not json").await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["error"]["code"], PARSE_ERROR);

        let response = call(&mut dispatcher, serde_json::json!({"jsonrpc": "2.0", "id": 3, "method": "bogus"})).await;
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);

        assert!(dispatcher.handle_line("   ").await.is_none());
        assert!(dispatcher
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_analyze_query_without_connection() {
        let mut dispatcher = Dispatcher::new();
        let response = call(&mut dispatcher, tool(4, "analyze_query", serde_json::json!({"sql": "DELETE FROM users"}))).await;
        let body = envelope(&response);
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["is_valid"], false);
        assert_eq!(body["data"]["findings"][0]["code"], "DELETE_WITHOUT_WHERE");
    }

    #[tokio::test]
    async fn test_query_requires_connection() {
        let mut dispatcher = Dispatcher::new();
        let response = call(&mut dispatcher, tool(5, "query", serde_json::json!({"sql": "SELECT 1 LIMIT 1"}))).await;
        assert_eq!(response["result"]["isError"], true);
        assert_eq!(envelope(&response)["error"]["code"], "CONNECTION_ERROR");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_session_against_memory_database() {
        let mut dispatcher = Dispatcher::new();

        let response = call(&mut dispatcher, tool(1, "connect", serde_json::json!({"url": "sqlite::memory:"}))).await;
        assert_eq!(envelope(&response)["data"]["engine"], "sqlite");

        // DDL needs confirmation
        let create = serde_json::json!({"sql": "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)"});
        let refused = call(&mut dispatcher, tool(2, "query", create.clone())).await;
        assert_eq!(envelope(&refused)["error"]["code"], "QUERY_BLOCKED");

        let mut confirmed = create;
        confirmed["confirm"] = Value::Bool(true);
        let response = call(&mut dispatcher, tool(3, "query", confirmed)).await;
        assert_eq!(response["result"]["isError"], false);

        let insert = serde_json::json!({"sql": "INSERT INTO t (name) VALUES (?1), (?2)", "params": ["a", "b"], "confirm": true});
        call(&mut dispatcher, tool(4, "query", insert)).await;

        let select = serde_json::json!({"sql": "SELECT id, name FROM t ORDER BY id LIMIT 10", "max_rows": 1});
        let body = envelope(&call(&mut dispatcher, tool(5, "query", select)).await);
        assert_eq!(body["data"]["result"]["row_count"], 2);
        assert_eq!(body["meta"]["rows_returned"], 1);
        assert_eq!(body["meta"]["truncated"], true);

        let stats = envelope(&call(&mut dispatcher, tool(6, "table_statistics", serde_json::json!({"table": "t"}))).await);
        assert_eq!(stats["data"]["row_count"], 2);

        let missing = envelope(&call(&mut dispatcher, tool(7, "table_statistics", serde_json::json!({"table": "ghost"}))).await);
        assert_eq!(missing["error"]["code"], "NOT_FOUND");

        let status = envelope(&call(&mut dispatcher, tool(8, "status", Value::Null)).await);
        assert_eq!(status["data"]["connected"], true);

        call(&mut dispatcher, tool(9, "disconnect", Value::Null)).await;
        let status = envelope(&call(&mut dispatcher, tool(10, "status", Value::Null)).await);
        assert_eq!(status["data"]["connected"], false);
    }

    #[test]
    fn test_gate() {
        assert!(gate("SELECT id FROM users WHERE id = 1 LIMIT 1", false).is_ok());

        let err = gate("DELETE FROM users", true).unwrap_err();
        assert_eq!(err.error_code(), "QUERY_BLOCKED");

        let err = gate("UPDATE users SET active = 0 WHERE id = 1", false).unwrap_err();
        assert!(err.message().contains("confirm=true"));
        assert!(gate("UPDATE users SET active = 0 WHERE id = 1", true).is_ok());
    }
}

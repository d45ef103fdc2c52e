//! dblens CLI Entry Point
//!
//! Subcommands:
//! - `analyze` - static safety analysis of a statement (no connection)
//! - `introspect` - schema snapshot
//! - `query` - execute one statement
//! - `explain` - normalized plan with recommendations
//! - `stats` - statistics for one table
//! - `serve` - MCP server on stdio
//!
//! All output to stdout is one JSON envelope. Logs go to stderr.

use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::error;

use dblens::config::ConnectionParams;
use dblens::engine::{create_adapter, DatabaseAdapter, QueryOptions, QueryParam};
use dblens::error::{DbLensError, Result};
use dblens::output::{error_json, success_json, Metadata};
use dblens::{logging, mcp, safety};

/// dblens - one view over PostgreSQL, MySQL/MariaDB and SQLite
#[derive(Parser)]
#[command(name = "dblens")]
#[command(about = "Schema introspection, guarded queries and plan analysis across SQL engines")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a statement for safety issues and complexity
    Analyze {
        sql: String,
    },

    /// Capture a schema snapshot
    Introspect {
        #[command(flatten)]
        conn: ConnectionFlags,
    },

    /// Execute one statement
    Query {
        sql: String,

        /// Positional parameter, as JSON (repeatable)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,

        /// Refuse mutating statements
        #[arg(long)]
        read_only: bool,

        /// Statement timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Row cap for the returned rows
        #[arg(long)]
        max_rows: Option<usize>,

        /// Attach the estimated plan
        #[arg(long)]
        explain: bool,

        /// Attach the executed plan (read statements only)
        #[arg(long)]
        analyze: bool,

        #[command(flatten)]
        conn: ConnectionFlags,
    },

    /// Show the normalized execution plan
    Explain {
        sql: String,

        /// Execute the statement (inside a rolled-back transaction)
        #[arg(long)]
        analyze: bool,

        #[command(flatten)]
        conn: ConnectionFlags,
    },

    /// Table size, row and maintenance statistics
    Stats {
        /// `table` or `schema.table`
        table: String,

        #[command(flatten)]
        conn: ConnectionFlags,
    },

    /// Run the MCP server on stdio
    Serve,
}

/// Shared connection flags; with none given the default profile is used
#[derive(Args)]
struct ConnectionFlags {
    /// Saved connection profile
    #[arg(short, long)]
    connection: Option<String>,

    /// Connection URL (postgres://, mysql://, mariadb://, sqlite:path)
    #[arg(long, env = "DBLENS_URL", hide_env_values = true)]
    url: Option<String>,

    /// postgres, mysql or sqlite
    #[arg(long)]
    engine: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long, env = "DBLENS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long)]
    database: Option<String>,

    /// SQLite database file
    #[arg(long)]
    file: Option<std::path::PathBuf>,

    #[arg(long)]
    ssl: bool,
}

impl From<ConnectionFlags> for ConnectionParams {
    fn from(flags: ConnectionFlags) -> Self {
        Self {
            connection: flags.connection,
            url: flags.url,
            engine: flags.engine,
            host: flags.host,
            port: flags.port,
            user: flags.user,
            password: flags.password,
            database: flags.database,
            file: flags.file,
            ssl: flags.ssl.then_some(true),
        }
    }
}

async fn open(flags: ConnectionFlags) -> Result<(Box<dyn DatabaseAdapter>, bool)> {
    let (config, readonly) = ConnectionParams::from(flags).resolve()?;
    let mut adapter = create_adapter(config)?;
    adapter.connect().await?;
    Ok((adapter, readonly))
}

fn parse_param(raw: &str) -> QueryParam {
    // Anything that is not valid JSON is bound as text
    serde_json::from_str::<serde_json::Value>(raw)
        .map_or_else(|_| QueryParam::Text(raw.to_string()), |v| QueryParam::from_json(&v))
}

/// Successful command output, already wrapped
struct Output {
    engine: String,
    data: serde_json::Value,
    meta: Metadata,
}

fn output<T: Serialize>(adapter: &dyn DatabaseAdapter, data: &T, meta: Metadata) -> Result<Output> {
    let data = serde_json::to_value(data)
        .map_err(|e| DbLensError::query(format!("Failed to serialize result: {e}")))?;
    Ok(Output { engine: adapter.engine().to_string(), data, meta })
}

async fn run(command: Commands) -> Result<Output> {
    match command {
        Commands::Analyze { sql } => {
            let verdict = safety::analyze(&sql);
            let data = serde_json::to_value(&verdict)
                .map_err(|e| DbLensError::query(format!("Failed to serialize verdict: {e}")))?;
            Ok(Output { engine: String::new(), data, meta: Metadata::default() })
        }
        Commands::Introspect { conn } => {
            let (mut adapter, _) = open(conn).await?;
            let snapshot = adapter.introspect().await;
            adapter.disconnect().await?;
            output(adapter.as_ref(), &snapshot?, Metadata::default())
        }
        Commands::Query { sql, params, read_only, timeout_ms, max_rows, explain, analyze, conn } => {
            let (mut adapter, profile_readonly) = open(conn).await?;
            let params: Vec<QueryParam> = params.iter().map(|p| parse_param(p)).collect();
            let options = QueryOptions {
                read_only: read_only || profile_readonly,
                timeout_ms,
                max_rows,
                explain,
                analyze,
            };
            let result = adapter.query(&sql, &params, &options).await;
            adapter.disconnect().await?;
            let result = result?;
            let meta = Metadata::with_rows(0, result.rows.len(), result.truncated);
            output(adapter.as_ref(), &result, meta)
        }
        Commands::Explain { sql, analyze, conn } => {
            let (mut adapter, _) = open(conn).await?;
            let report = adapter.explain(&sql, analyze).await;
            adapter.disconnect().await?;
            output(adapter.as_ref(), &report?, Metadata::default())
        }
        Commands::Stats { table, conn } => {
            let (mut adapter, _) = open(conn).await?;
            let stats = adapter.table_statistics(&table).await;
            adapter.disconnect().await?;
            output(adapter.as_ref(), &stats?, Metadata::default())
        }
        // Handled in main; the server writes its own responses
        Commands::Serve => Err(DbLensError::configuration("serve does not produce an envelope")),
    }
}

const fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Analyze { .. } => "analyze",
        Commands::Introspect { .. } => "introspect",
        Commands::Query { .. } => "query",
        Commands::Explain { .. } => "explain",
        Commands::Stats { .. } => "stats",
        Commands::Serve => "serve",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.verbose, cli.quiet) {
        eprintln!("{e}");
    }

    if matches!(cli.command, Commands::Serve) {
        return match mcp::serve().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("MCP server failed: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let command = command_name(&cli.command);
    let start = Instant::now();

    match run(cli.command).await {
        Ok(out) => {
            let meta = Metadata {
                execution_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                ..out.meta
            };
            match success_json(&out.engine, command, out.data, meta) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Failed to serialize output: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            error!("{command} failed: {e}");
            println!("{}", error_json("", command, &e));
            ExitCode::FAILURE
        }
    }
}

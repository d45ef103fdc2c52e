//! Configuration Management
//!
//! This module defines the adapter configuration and the named connection
//! profiles that callers can reference instead of passing credentials.
//!
//! # Adapter Configuration
//! A [`DatabaseConfig`] selects the engine and carries either a connection
//! string or discrete host/port/database/user/password/file parameters, an
//! SSL flag and [`PoolSettings`]. It is immutable once an adapter is built.
//!
//! # Configuration Locations
//! - Local: `.dblens/connections.json` (team-shareable, per-project)
//! - Global: `<config_dir>/dblens/connections.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Explicit connection parameters (highest priority)
//! 2. Local profile file
//! 3. Global profile file

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::DatabaseType;
use crate::error::{DbLensError, Result};

/// Upper bound accepted for `PoolSettings::max_size`
pub const MAX_POOL_SIZE: u32 = 100;

/// Connection pool sizing and timeouts
///
/// The SQLite adapter keeps a single persistent connection and only uses
/// `acquire_timeout_ms` (as the busy timeout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections kept open while idle
    pub min_size: u32,
    /// Hard cap on open connections
    pub max_size: u32,
    /// Idle connections above `min_size` are closed after this long
    pub idle_timeout_ms: u64,
    /// Deadline for obtaining a connection from the pool
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { min_size: 1, max_size: 10, idle_timeout_ms: 600_000, acquire_timeout_ms: 5_000 }
    }
}

impl PoolSettings {
    /// Validate pool bounds
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(DbLensError::configuration("Pool max_size must be greater than 0"));
        }
        if self.max_size > MAX_POOL_SIZE {
            return Err(DbLensError::configuration(format!(
                "Pool max_size must not exceed {MAX_POOL_SIZE}"
            )));
        }
        if self.min_size > self.max_size {
            return Err(DbLensError::configuration(format!(
                "Pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(DbLensError::configuration(
                "Pool acquire_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn acquire_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Adapter configuration
///
/// Fields are engine-specific (e.g., `file` only applies to `SQLite`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database engine type
    pub engine: DatabaseType,

    /// Driver connection string (takes precedence over discrete parameters)
    /// WARNING: may contain credentials, redact before logging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database file path (`:memory:` for an in-memory database)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Require TLS for server engines
    #[serde(default)]
    pub ssl: bool,

    #[serde(default)]
    pub pool: PoolSettings,
}

impl DatabaseConfig {
    /// Config with only the engine set
    #[must_use]
    pub fn empty(engine: DatabaseType) -> Self {
        Self {
            engine,
            connection_string: None,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file: None,
            ssl: false,
            pool: PoolSettings::default(),
        }
    }

    /// Create a new `PostgreSQL` connection config
    #[must_use]
    pub fn postgres(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            user: Some(user.into()),
            password: Some(password.into()),
            database: Some(database.into()),
            ..Self::empty(DatabaseType::Postgres)
        }
    }

    /// Create a new `MySQL` connection config
    #[must_use]
    pub fn mysql(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            user: Some(user.into()),
            password: Some(password.into()),
            database: Some(database.into()),
            ..Self::empty(DatabaseType::MySQL)
        }
    }

    /// Create a new `SQLite` connection config
    #[must_use]
    pub fn sqlite(file: impl Into<PathBuf>) -> Self {
        Self { file: Some(file.into()), ..Self::empty(DatabaseType::SQLite) }
    }

    /// Build a config from a connection URL
    ///
    /// Recognized schemes: `postgres://`, `postgresql://`, `mysql://`,
    /// `mariadb://`, `sqlite://<path>`, `sqlite:<path>`. Server URLs are kept
    /// verbatim for the driver; host and database are extracted for display.
    pub fn from_url(raw: &str) -> Result<Self> {
        let raw = raw.trim();

        if let Some(rest) = raw.strip_prefix("sqlite:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(DbLensError::configuration("SQLite URL is missing a file path"));
            }
            return Ok(Self::sqlite(path));
        }

        let parsed = url::Url::parse(raw).map_err(|e| {
            DbLensError::configuration(format!("Invalid connection string: {e}"))
        })?;

        let (engine, connection_string) = match parsed.scheme() {
            "postgres" | "postgresql" => (DatabaseType::Postgres, raw.to_string()),
            "mysql" => (DatabaseType::MySQL, raw.to_string()),
            // mysql_async only accepts the mysql scheme
            "mariadb" => (DatabaseType::MySQL, format!("mysql{}", &raw["mariadb".len()..])),
            other => {
                return Err(DbLensError::configuration(format!(
                    "Unsupported connection string scheme '{other}'"
                )))
            }
        };

        let ssl = parsed.query_pairs().any(|(key, value)| {
            let value = value.to_ascii_lowercase();
            match key.as_ref() {
                "sslmode" => matches!(value.as_str(), "require" | "verify-ca" | "verify-full"),
                "require_ssl" | "ssl" => value == "true",
                _ => false,
            }
        });

        let database = parsed.path().trim_start_matches('/');

        Ok(Self {
            connection_string: Some(connection_string),
            host: parsed.host_str().map(str::to_string),
            port: parsed.port(),
            user: Some(parsed.username()).filter(|u| !u.is_empty()).map(str::to_string),
            database: Some(database).filter(|d| !d.is_empty()).map(str::to_string),
            ssl,
            ..Self::empty(engine)
        })
    }

    /// Port to use, falling back to the engine default
    #[must_use]
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.engine {
            DatabaseType::Postgres => 5432,
            DatabaseType::MySQL => 3306,
            DatabaseType::SQLite => 0,
        })
    }

    /// Check that the selected engine has every parameter it needs
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        match self.engine {
            DatabaseType::SQLite => {
                if self.file.is_none() {
                    return Err(DbLensError::configuration("SQLite requires 'file' parameter"));
                }
            }
            DatabaseType::Postgres | DatabaseType::MySQL => {
                let engine_name =
                    if self.engine == DatabaseType::Postgres { "PostgreSQL" } else { "MySQL" };

                if let Some(conn) = &self.connection_string {
                    let scheme_ok = match self.engine {
                        DatabaseType::Postgres => {
                            conn.starts_with("postgres://") || conn.starts_with("postgresql://")
                        }
                        _ => conn.starts_with("mysql://"),
                    };
                    if !scheme_ok {
                        return Err(DbLensError::configuration(format!(
                            "Connection string does not match engine {engine_name}"
                        )));
                    }
                    return Ok(());
                }

                if self.host.is_none() {
                    return Err(DbLensError::configuration(format!(
                        "{engine_name} requires 'host' parameter"
                    )));
                }
                if self.user.is_none() {
                    return Err(DbLensError::configuration(format!(
                        "{engine_name} requires 'user' parameter"
                    )));
                }
                if self.database.is_none() {
                    return Err(DbLensError::configuration(format!(
                        "{engine_name} requires 'database' parameter"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Short description safe to log (no credentials)
    #[must_use]
    pub fn describe(&self) -> String {
        match self.engine {
            DatabaseType::SQLite => format!(
                "sqlite:{}",
                self.file.as_deref().map(Path::display).map_or_else(String::new, |d| d.to_string())
            ),
            _ => format!(
                "{}://{}:{}/{}",
                self.engine,
                self.host.as_deref().unwrap_or("localhost"),
                self.port_or_default(),
                self.database.as_deref().unwrap_or("")
            ),
        }
    }
}

/// Named connection profiles stored in one config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionRegistry {
    /// Named connections
    #[serde(default)]
    pub connections: BTreeMap<String, StoredConnection>,

    /// Name of the default connection (must exist in `connections`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Stored connection profile
///
/// Similar to `DatabaseConfig` but supports environment variable references
/// for the password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConnection {
    #[serde(flatten)]
    pub config: DatabaseConfig,

    /// Environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Force `read_only` on every query issued through this profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

impl StoredConnection {
    /// Resolve environment variables and return the config and readonly flag
    pub fn resolve(&self) -> Result<(DatabaseConfig, bool)> {
        let mut config = self.config.clone();

        if let Some(env_var) = &self.password_env {
            let password = std::env::var(env_var).map_err(|_| {
                DbLensError::configuration(format!(
                    "Environment variable {env_var} not found for password"
                ))
            })?;
            config.password = Some(password);
        }

        Ok((config, self.readonly.unwrap_or(false)))
    }
}

/// Configuration file location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLocation {
    /// `.dblens/connections.json` in the current directory
    Local,
    /// `<config_dir>/dblens/connections.json`
    Global,
}

impl ConfigLocation {
    /// Path of the profile file for this location
    pub fn path(self) -> Result<PathBuf> {
        match self {
            Self::Local => {
                let current_dir = std::env::current_dir().map_err(|e| {
                    DbLensError::configuration(format!(
                        "Could not determine current directory: {e}"
                    ))
                })?;
                Ok(current_dir.join(".dblens").join("connections.json"))
            }
            Self::Global => {
                let config_dir = dirs::config_dir().ok_or_else(|| {
                    DbLensError::configuration("Could not determine user config directory")
                })?;
                Ok(config_dir.join("dblens").join("connections.json"))
            }
        }
    }
}

/// Load a registry file; a missing file yields an empty registry
pub fn load_registry(path: &Path) -> Result<ConnectionRegistry> {
    if !path.exists() {
        return Ok(ConnectionRegistry::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| DbLensError::configuration(format!("Could not read config file: {e}")))?;

    serde_json::from_str(&contents)
        .map_err(|e| DbLensError::configuration(format!("Invalid config file format: {e}")))
}

/// Write a registry file, creating parent directories
pub fn save_registry(path: &Path, registry: &ConnectionRegistry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            DbLensError::configuration(format!("Could not create config directory: {e}"))
        })?;
    }

    let contents = serde_json::to_string_pretty(registry)
        .map_err(|e| DbLensError::configuration(format!("Could not serialize config: {e}")))?;

    fs::write(path, contents)
        .map_err(|e| DbLensError::configuration(format!("Could not write config file: {e}")))
}

/// Merge two registries; entries of `local` win, including the default pointer
#[must_use]
pub fn merge_registries(global: ConnectionRegistry, local: ConnectionRegistry) -> ConnectionRegistry {
    let mut merged = global;
    merged.connections.extend(local.connections);
    if local.default.is_some() {
        merged.default = local.default;
    }
    merged
}

/// Load local and global profiles, local taking precedence
pub fn load_with_precedence() -> Result<ConnectionRegistry> {
    let global = load_registry(&ConfigLocation::Global.path()?)?;
    let local = load_registry(&ConfigLocation::Local.path()?)?;
    Ok(merge_registries(global, local))
}

/// Look up a profile by name (or the default) in a registry
pub fn resolve_from(registry: &ConnectionRegistry, name: Option<&str>) -> Result<(DatabaseConfig, bool)> {
    let conn_name = match name {
        Some(n) => n.to_string(),
        None => registry.default.clone().ok_or_else(|| {
            let available: Vec<_> = registry.connections.keys().collect();
            DbLensError::configuration(format!(
                "No default connection set. Available connections: {available:?}"
            ))
        })?,
    };

    let stored = registry.connections.get(&conn_name).ok_or_else(|| {
        let available: Vec<_> = registry.connections.keys().collect();
        DbLensError::configuration(format!(
            "Connection '{conn_name}' not found. Available connections: {available:?}"
        ))
    })?;

    stored.resolve()
}

/// Resolve a named profile (or the default) from the merged registry
///
/// Returns the config and the profile's readonly flag.
pub fn resolve_connection(name: Option<&str>) -> Result<(DatabaseConfig, bool)> {
    resolve_from(&load_with_precedence()?, name)
}

/// Save a profile; the first profile in a file becomes its default
pub fn save_connection(name: &str, config: DatabaseConfig, location: ConfigLocation) -> Result<PathBuf> {
    let path = location.path()?;
    let mut registry = load_registry(&path)?;

    let is_first_connection = registry.connections.is_empty();
    registry
        .connections
        .insert(name.to_string(), StoredConnection { config, password_env: None, readonly: None });
    if is_first_connection {
        registry.default = Some(name.to_string());
    }

    save_registry(&path, &registry)?;
    Ok(path)
}

/// Connection parameters as supplied by a caller (CLI flags, tool arguments)
///
/// Resolution: `url` wins, then an explicit `engine` (or a bare `file`, which
/// implies SQLite), then the named profile or the default one. Discrete
/// fields given alongside a profile override the profile's values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Profile name
    pub connection: Option<String>,
    pub url: Option<String>,
    pub engine: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub file: Option<PathBuf>,
    pub ssl: Option<bool>,
}

impl ConnectionParams {
    /// Resolve against the merged local/global profiles
    pub fn resolve(&self) -> Result<(DatabaseConfig, bool)> {
        if self.url.is_some() || self.engine.is_some() || self.file.is_some() {
            return self.resolve_with(&ConnectionRegistry::default());
        }
        self.resolve_with(&load_with_precedence()?)
    }

    /// Resolve against `registry`; returns the config and the readonly flag
    pub fn resolve_with(&self, registry: &ConnectionRegistry) -> Result<(DatabaseConfig, bool)> {
        let (mut config, readonly) = if let Some(url) = &self.url {
            (DatabaseConfig::from_url(url)?, false)
        } else if let Some(engine) = &self.engine {
            (DatabaseConfig::empty(engine.parse()?), false)
        } else if self.file.is_some() {
            (DatabaseConfig::empty(DatabaseType::SQLite), false)
        } else {
            resolve_from(registry, self.connection.as_deref())?
        };

        if self.host.is_some() {
            config.host.clone_from(&self.host);
        }
        if self.port.is_some() {
            config.port = self.port;
        }
        if self.user.is_some() {
            config.user.clone_from(&self.user);
        }
        if self.password.is_some() {
            config.password.clone_from(&self.password);
        }
        if self.database.is_some() {
            config.database.clone_from(&self.database);
        }
        if self.file.is_some() {
            config.file.clone_from(&self.file);
        }
        if let Some(ssl) = self.ssl {
            config.ssl = ssl;
        }

        config.validate()?;
        Ok((config, readonly))
    }
}

/// Names and safe descriptions of every profile
pub fn list_connections() -> Result<Vec<(String, String)>> {
    let registry = load_with_precedence()?;
    Ok(registry
        .connections
        .iter()
        .map(|(name, stored)| (name.clone(), stored.config.describe()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("dblens_config_{}_{name}", std::process::id()))
            .join("connections.json")
    }

    #[test]
    fn test_pool_defaults_are_valid() {
        assert!(PoolSettings::default().validate().is_ok());
    }

    #[test]
    fn test_pool_validation() {
        let zero = PoolSettings { max_size: 0, ..PoolSettings::default() };
        assert!(matches!(zero.validate(), Err(DbLensError::Configuration(_))));

        let too_big = PoolSettings { max_size: 101, ..PoolSettings::default() };
        assert!(too_big.validate().is_err());

        let inverted = PoolSettings { min_size: 5, max_size: 2, ..PoolSettings::default() };
        assert!(inverted.validate().is_err());

        let no_wait = PoolSettings { acquire_timeout_ms: 0, ..PoolSettings::default() };
        assert!(no_wait.validate().is_err());
    }

    #[test]
    fn test_validate_missing_parameters() {
        let mut config = DatabaseConfig::postgres("localhost", 5432, "app", "pw", "orders");
        assert!(config.validate().is_ok());

        config.host = None;
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(err.message().contains("host"));

        let mut mysql = DatabaseConfig::mysql("localhost", 3306, "app", "pw", "orders");
        mysql.database = None;
        assert!(mysql.validate().unwrap_err().message().contains("database"));

        let mut sqlite = DatabaseConfig::sqlite("/tmp/app.db");
        assert!(sqlite.validate().is_ok());
        sqlite.file = None;
        assert!(sqlite.validate().unwrap_err().message().contains("file"));
    }

    #[test]
    fn test_from_url_postgres() {
        let config =
            DatabaseConfig::from_url("postgresql://app:pw@db.internal:6543/orders?sslmode=require")
                .unwrap();
        assert_eq!(config.engine, DatabaseType::Postgres);
        assert_eq!(config.host.as_deref(), Some("db.internal"));
        assert_eq!(config.port, Some(6543));
        assert_eq!(config.user.as_deref(), Some("app"));
        assert_eq!(config.database.as_deref(), Some("orders"));
        assert!(config.ssl);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_url_mariadb_is_rewritten() {
        let config = DatabaseConfig::from_url("mariadb://root@localhost/shop").unwrap();
        assert_eq!(config.engine, DatabaseType::MySQL);
        assert_eq!(config.connection_string.as_deref(), Some("mysql://root@localhost/shop"));
        assert_eq!(config.port_or_default(), 3306);
        assert!(!config.ssl);
    }

    #[test]
    fn test_from_url_sqlite() {
        let config = DatabaseConfig::from_url("sqlite:///var/lib/app.db").unwrap();
        assert_eq!(config.engine, DatabaseType::SQLite);
        assert_eq!(config.file, Some(PathBuf::from("/var/lib/app.db")));

        let memory = DatabaseConfig::from_url("sqlite::memory:").unwrap();
        assert_eq!(memory.file, Some(PathBuf::from(":memory:")));

        assert!(DatabaseConfig::from_url("sqlite://").is_err());
    }

    #[test]
    fn test_from_url_rejects_unknown_scheme() {
        let err = DatabaseConfig::from_url("oracle://x@y/z").unwrap_err();
        assert!(matches!(err, DbLensError::Configuration(_)));
    }

    #[test]
    fn test_connection_string_must_match_engine() {
        let mut config = DatabaseConfig::from_url("mysql://root@localhost/shop").unwrap();
        config.engine = DatabaseType::Postgres;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_describe_has_no_password() {
        let config = DatabaseConfig::postgres("localhost", 5432, "app", "hunter2", "orders");
        let described = config.describe();
        assert!(!described.contains("hunter2"));
        assert_eq!(described, "postgres://localhost:5432/orders");
    }

    #[test]
    fn test_stored_connection_resolve_env_var() {
        std::env::set_var("DBLENS_TEST_PROFILE_PASSWORD", "secret");

        let mut config = DatabaseConfig::postgres("localhost", 5432, "app", "", "orders");
        config.password = None;
        let stored = StoredConnection {
            config,
            password_env: Some("DBLENS_TEST_PROFILE_PASSWORD".to_string()),
            readonly: Some(true),
        };

        let (resolved, readonly) = stored.resolve().unwrap();
        assert_eq!(resolved.password.as_deref(), Some("secret"));
        assert!(readonly);
    }

    #[test]
    fn test_stored_connection_missing_env_var() {
        let stored = StoredConnection {
            config: DatabaseConfig::sqlite("/tmp/x.db"),
            password_env: Some("DBLENS_TEST_DEFINITELY_UNSET".to_string()),
            readonly: None,
        };
        assert!(matches!(stored.resolve(), Err(DbLensError::Configuration(_))));
    }

    #[test]
    fn test_registry_round_trip_on_disk() {
        let path = temp_registry_path("round_trip");
        let _ = fs::remove_file(&path);

        let mut registry = ConnectionRegistry::default();
        registry.connections.insert(
            "local".to_string(),
            StoredConnection {
                config: DatabaseConfig::sqlite("/tmp/app.db"),
                password_env: None,
                readonly: None,
            },
        );
        registry.default = Some("local".to_string());

        save_registry(&path, &registry).unwrap();
        let loaded = load_registry(&path).unwrap();
        assert_eq!(loaded.default.as_deref(), Some("local"));
        assert_eq!(loaded.connections["local"].config, DatabaseConfig::sqlite("/tmp/app.db"));

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_load_missing_registry_is_empty() {
        let registry = load_registry(Path::new("/definitely/not/here/connections.json")).unwrap();
        assert!(registry.connections.is_empty());
        assert!(registry.default.is_none());
    }

    #[test]
    fn test_merge_local_wins() {
        let stored = |file: &str| StoredConnection {
            config: DatabaseConfig::sqlite(file),
            password_env: None,
            readonly: None,
        };

        let mut global = ConnectionRegistry::default();
        global.connections.insert("dev".into(), stored("/global/dev.db"));
        global.connections.insert("prod".into(), stored("/global/prod.db"));
        global.default = Some("prod".into());

        let mut local = ConnectionRegistry::default();
        local.connections.insert("dev".into(), stored("/local/dev.db"));
        local.default = Some("dev".into());

        let merged = merge_registries(global, local);
        assert_eq!(merged.connections.len(), 2);
        assert_eq!(merged.default.as_deref(), Some("dev"));

        let (config, _) = resolve_from(&merged, None).unwrap();
        assert_eq!(config.file, Some(PathBuf::from("/local/dev.db")));

        let (config, _) = resolve_from(&merged, Some("prod")).unwrap();
        assert_eq!(config.file, Some(PathBuf::from("/global/prod.db")));

        assert!(resolve_from(&merged, Some("staging")).is_err());
    }

    #[test]
    fn test_resolve_without_default() {
        let registry = ConnectionRegistry::default();
        let err = resolve_from(&registry, None).unwrap_err();
        assert!(err.message().contains("No default connection"));
    }

    #[test]
    fn test_connection_params_precedence() {
        let mut registry = ConnectionRegistry::default();
        registry.connections.insert(
            "dev".into(),
            StoredConnection {
                config: DatabaseConfig::postgres("db.dev", 5432, "app", "pw", "orders"),
                password_env: None,
                readonly: Some(true),
            },
        );
        registry.default = Some("dev".into());

        // Default profile with an override
        let params = ConnectionParams { database: Some("billing".into()), ..ConnectionParams::default() };
        let (config, readonly) = params.resolve_with(&registry).unwrap();
        assert_eq!(config.host.as_deref(), Some("db.dev"));
        assert_eq!(config.database.as_deref(), Some("billing"));
        assert!(readonly);

        // A URL ignores profiles
        let params = ConnectionParams { url: Some("sqlite::memory:".into()), ..ConnectionParams::default() };
        let (config, readonly) = params.resolve_with(&registry).unwrap();
        assert_eq!(config.engine, DatabaseType::SQLite);
        assert!(!readonly);

        // A bare file implies SQLite
        let params = ConnectionParams { file: Some("/tmp/app.db".into()), ..ConnectionParams::default() };
        let (config, _) = params.resolve_with(&registry).unwrap();
        assert_eq!(config.file, Some(PathBuf::from("/tmp/app.db")));
    }

    #[test]
    fn test_connection_params_explicit_engine_is_validated() {
        let params = ConnectionParams {
            engine: Some("mysql".into()),
            host: Some("localhost".into()),
            ..ConnectionParams::default()
        };
        let err = params.resolve_with(&ConnectionRegistry::default()).unwrap_err();
        assert!(err.message().contains("user"));

        let params = ConnectionParams { engine: Some("oracle".into()), ..ConnectionParams::default() };
        assert!(params.resolve_with(&ConnectionRegistry::default()).is_err());
    }
}

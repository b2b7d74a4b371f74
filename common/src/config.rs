//! Configuration loading.
//!
//! Process settings are read once at startup. Per-dialect connection
//! defaults are read from the environment every time a connection is opened.

use std::time::Duration;

use crate::models::connection::DbType;

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Service name used in logs and health output.
    pub service_name: String,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Server name tool callers must address.
    pub server_name: String,
    /// Physical connections behind one logical handle.
    pub max_connections: u32,
    /// Driver connect/acquire timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Idle age in seconds after which a connection is reaped; 0 disables reaping.
    pub idle_timeout_secs: u64,
    /// Reaper sweep period in seconds.
    pub reap_interval_secs: u64,
    /// `text` or `json`.
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "gateway".to_string(),
            host: "0.0.0.0".to_string(),
            port: 3000,
            server_name: "database-viewer".to_string(),
            max_connections: 1,
            connect_timeout_secs: 30,
            idle_timeout_secs: 3600,
            reap_interval_secs: 60,
            log_format: "text".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads configuration for the named service.
    ///
    /// A `.env` file in the working directory is applied first; variables
    /// already present in the environment win.
    pub fn load_with_service(service_name: &str) -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            service_name: service_name.to_string(),
            host: env_or("SERVER_HOST", defaults.host),
            port: env_parse("SERVER_PORT", defaults.port),
            server_name: env_or("MCP_SERVER_NAME", defaults.server_name),
            max_connections: env_parse("POOL_MAX_CONNECTIONS", defaults.max_connections).max(1),
            connect_timeout_secs: env_parse("CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            idle_timeout_secs: env_parse("CONNECTION_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            reap_interval_secs: env_parse(
                "CONNECTION_REAP_INTERVAL_SECS",
                defaults.reap_interval_secs,
            )
            .max(1),
            log_format: env_or("LOG_FORMAT", defaults.log_format),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle timeout, or `None` when reaping is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Fallback connection fields for one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectDefaults {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl DialectDefaults {
    /// Reads the dialect's `*_HOST`/`*_PORT`/... variables with built-in fallbacks.
    pub fn from_env(db_type: DbType) -> Self {
        Self::from_lookup(db_type, |key| std::env::var(key).ok())
    }

    /// Same as [`DialectDefaults::from_env`] with an injectable lookup.
    pub fn from_lookup(db_type: DbType, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let (prefix, host_key, user, database) = match db_type {
            DbType::MySQL => ("MYSQL", "HOST", Some("root"), None),
            DbType::Postgres => ("PG", "HOST", Some("postgres"), None),
            DbType::SqlServer => ("MSSQL", "SERVER", Some("sa"), None),
            DbType::MongoDB => ("MONGO", "HOST", None, Some("test")),
            DbType::SQLite => {
                return Self {
                    host: String::new(),
                    port: 0,
                    user: None,
                    password: None,
                    database: lookup("SQLITE_DATABASE"),
                }
            }
        };
        let var = |name: &str| lookup(&format!("{prefix}_{name}")).filter(|v| !v.is_empty());

        Self {
            host: var(host_key).unwrap_or_else(|| "localhost".to_string()),
            port: var("PORT")
                .and_then(|v| v.parse().ok())
                .or_else(|| db_type.default_port())
                .unwrap_or_default(),
            user: var("USER").or_else(|| user.map(String::from)),
            password: lookup(&format!("{prefix}_PASSWORD")).or_else(|| user.map(|_| String::new())),
            database: var("DATABASE").or_else(|| database.map(String::from)),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_mysql_builtin_defaults() {
        let d = DialectDefaults::from_lookup(DbType::MySQL, lookup(&[]));
        assert_eq!(d.host, "localhost");
        assert_eq!(d.port, 3306);
        assert_eq!(d.user.as_deref(), Some("root"));
        assert_eq!(d.password.as_deref(), Some(""));
        assert_eq!(d.database, None);
    }

    #[test]
    fn test_mssql_reads_server_variable() {
        let d = DialectDefaults::from_lookup(
            DbType::SqlServer,
            lookup(&[("MSSQL_SERVER", "db.internal"), ("MSSQL_PORT", "14330")]),
        );
        assert_eq!(d.host, "db.internal");
        assert_eq!(d.port, 14330);
        assert_eq!(d.user.as_deref(), Some("sa"));
    }

    #[test]
    fn test_mongo_database_falls_back_to_test() {
        let d = DialectDefaults::from_lookup(DbType::MongoDB, lookup(&[("MONGO_PORT", "27018")]));
        assert_eq!(d.port, 27018);
        assert_eq!(d.database.as_deref(), Some("test"));
        assert_eq!(d.user, None);
    }

    #[test]
    fn test_idle_timeout_zero_disables_reaping() {
        let config = AppConfig {
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.idle_timeout().is_none());
    }
}

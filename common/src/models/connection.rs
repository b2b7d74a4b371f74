//! Connection models.
//!
//! Backend type identifiers and the arguments accepted by `connect_to_database`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};

/// Database type enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
pub enum DbType {
    /// MySQL / MariaDB.
    #[serde(rename = "mysql")]
    MySQL,
    /// PostgreSQL.
    #[serde(rename = "postgres")]
    Postgres,
    /// SQLite (file or in-memory).
    #[serde(rename = "sqlite")]
    SQLite,
    /// Microsoft SQL Server.
    #[serde(rename = "mssql")]
    SqlServer,
    /// MongoDB document store.
    #[serde(rename = "mongodb")]
    MongoDB,
}

impl DbType {
    /// All supported backend types.
    pub const ALL: [DbType; 5] = [
        DbType::MySQL,
        DbType::Postgres,
        DbType::SQLite,
        DbType::SqlServer,
        DbType::MongoDB,
    ];

    /// Returns the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DbType::MySQL => Some(3306),
            DbType::Postgres => Some(5432),
            DbType::SQLite => None,
            DbType::SqlServer => Some(1433),
            DbType::MongoDB => Some(27017),
        }
    }

    /// Human-readable dialect name, used as the error message prefix.
    pub fn display_name(&self) -> &'static str {
        match self {
            DbType::MySQL => "MySQL",
            DbType::Postgres => "PostgreSQL",
            DbType::SQLite => "SQLite",
            DbType::SqlServer => "SQL Server",
            DbType::MongoDB => "MongoDB",
        }
    }
}

impl std::fmt::Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbType::MySQL => write!(f, "mysql"),
            DbType::Postgres => write!(f, "postgres"),
            DbType::SQLite => write!(f, "sqlite"),
            DbType::SqlServer => write!(f, "mssql"),
            DbType::MongoDB => write!(f, "mongodb"),
        }
    }
}

impl FromStr for DbType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DbType::MySQL),
            "postgres" | "postgresql" | "pg" => Ok(DbType::Postgres),
            "sqlite" | "sqlite3" => Ok(DbType::SQLite),
            "mssql" | "sqlserver" => Ok(DbType::SqlServer),
            "mongodb" | "mongo" => Ok(DbType::MongoDB),
            other => Err(AppError::UnsupportedDatabaseType(other.to_string())),
        }
    }
}

/// Arguments of `connect_to_database`.
///
/// Either `url` or the individual fields may be given; absent fields fall back
/// to dialect defaults at connect time. `options` is applied last and may
/// override anything, including derived host/user/password.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub url: Option<String>,
    pub options: Map<String, Value>,
}

impl ConnectArgs {
    /// Extracts connect arguments from a free-form tool argument object.
    ///
    /// `server` is accepted as an alias of `host`; `port` may be a number or a
    /// numeric string.
    pub fn from_args(args: &Map<String, Value>) -> AppResult<Self> {
        let options = match args.get("options") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(AppError::Validation("'options' must be an object".into())),
        };

        Ok(Self {
            host: string_arg(args, "host")?.or(string_arg(args, "server")?),
            port: port_arg(args.get("port"))?,
            user: string_arg(args, "user")?,
            password: string_arg(args, "password")?,
            database: string_arg(args, "database")?,
            url: string_arg(args, "url")?,
            options,
        })
    }

    /// Returns an option as a string, whatever its JSON scalar type.
    pub fn option_str(&self, key: &str) -> Option<String> {
        self.options.get(key).and_then(scalar_to_string)
    }

    /// Returns an option interpreted as a boolean (`true`, `"true"`, `1`, ...).
    pub fn option_bool(&self, key: &str) -> Option<bool> {
        match self.options.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Some(true),
                "false" | "no" | "0" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Renders a JSON scalar as text; `None` for null, arrays and objects.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_arg(args: &Map<String, Value>, key: &str) -> AppResult<Option<String>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(value)
            .map(Some)
            .ok_or_else(|| AppError::Validation(format!("'{key}' must be a string"))),
    }
}

/// Parses a port given as a number or numeric string.
pub fn port_arg(value: Option<&Value>) -> AppResult<Option<u16>> {
    let invalid = || AppError::Validation("'port' must be a number between 1 and 65535".into());
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .map(Some)
            .ok_or_else(invalid),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .map(Some)
            .ok_or_else(invalid),
        Some(_) => Err(invalid()),
    }
}

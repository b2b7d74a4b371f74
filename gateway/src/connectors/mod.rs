//! Dialect connectors.
//!
//! One [`Connector`] implementation per backend family, all behind the same
//! object-safe contract. A [`ConnectionHandle`] carries the live driver
//! resource; [`ConnectorRegistry`] maps a [`DbType`] to its connector.

pub mod mongo;
pub mod mssql;
pub mod mysql;
pub mod options;
pub mod params;
pub mod postgres;
pub mod sqlite;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{MySqlPool, PgPool, SqlitePool};

use common::config::AppConfig;
use common::errors::{AppError, AppResult};
use common::models::{ConnectArgs, DbType, InsertRows, QueryOutcome, Record, TableStructure};

pub use self::mongo::MongoHandle;
pub use self::mssql::MssqlHandle;

/// Live backend resource owned by a connection record.
///
/// Cloning a handle shares the underlying pool or client.
#[derive(Clone)]
pub enum ConnectionHandle {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
    Mssql(MssqlHandle),
    Mongo(MongoHandle),
}

impl ConnectionHandle {
    pub fn db_type(&self) -> DbType {
        match self {
            ConnectionHandle::MySql(_) => DbType::MySQL,
            ConnectionHandle::Postgres(_) => DbType::Postgres,
            ConnectionHandle::Sqlite(_) => DbType::SQLite,
            ConnectionHandle::Mssql(_) => DbType::SqlServer,
            ConnectionHandle::Mongo(_) => DbType::MongoDB,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionHandle").field(&self.db_type()).finish()
    }
}

/// Pool sizing and timeouts applied when opening connections.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl From<&AppConfig> for PoolSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_connections: config.max_connections.max(1),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        (&AppConfig::default()).into()
    }
}

/// Uniform operation set implemented by every backend.
#[async_trait]
pub trait Connector: Send + Sync {
    fn db_type(&self) -> DbType;

    /// Opens a connection. Never retries.
    async fn connect(&self, args: &ConnectArgs) -> AppResult<ConnectionHandle>;

    async fn list_databases(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>>;

    async fn list_tables(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>>;

    async fn get_table_structure(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
    ) -> AppResult<TableStructure>;

    /// Runs backend-native query text with positional parameters.
    async fn execute_query(
        &self,
        handle: &ConnectionHandle,
        query: &str,
        params: &[Value],
    ) -> AppResult<QueryOutcome>;

    async fn insert_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        rows: &InsertRows,
    ) -> AppResult<QueryOutcome>;

    /// Updates every row matching the conjunction of `filter` equalities.
    async fn update_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        data: &Record,
        filter: &Record,
    ) -> AppResult<QueryOutcome>;

    async fn delete_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        filter: &Record,
    ) -> AppResult<QueryOutcome>;

    /// Releases the driver resource. Fails if it is already closed.
    async fn close_connection(&self, handle: &ConnectionHandle) -> AppResult<()>;
}

/// Static mapping from backend type to connector.
pub struct ConnectorRegistry {
    connectors: HashMap<DbType, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Registers all five connectors.
    pub fn new(settings: PoolSettings) -> Self {
        let connectors: [Arc<dyn Connector>; 5] = [
            Arc::new(mysql::MySqlConnector::new(settings)),
            Arc::new(postgres::PostgresConnector::new(settings)),
            Arc::new(sqlite::SqliteConnector::new(settings)),
            Arc::new(mssql::MssqlConnector::new(settings)),
            Arc::new(mongo::MongoConnector::new(settings)),
        ];
        Self {
            connectors: connectors.into_iter().map(|c| (c.db_type(), c)).collect(),
        }
    }

    pub fn get(&self, db_type: DbType) -> AppResult<Arc<dyn Connector>> {
        self.connectors
            .get(&db_type)
            .cloned()
            .ok_or_else(|| AppError::UnsupportedDatabaseType(db_type.to_string()))
    }
}

pub(crate) fn connection_error(db_type: DbType, err: impl Display) -> AppError {
    AppError::DatabaseConnection(format!("{}: {}", db_type.display_name(), err))
}

pub(crate) fn query_error(db_type: DbType, err: impl Display) -> AppError {
    AppError::DatabaseQuery(format!("{}: {}", db_type.display_name(), err))
}

pub(crate) fn wrong_handle(expected: DbType, handle: &ConnectionHandle) -> AppError {
    AppError::Internal(format!(
        "{} connector received a {} handle",
        expected.display_name(),
        handle.db_type().display_name()
    ))
}

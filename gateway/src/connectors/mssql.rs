//! SQL Server connector (TDS via tiberius).
//!
//! A handle owns one client session behind a mutex, so every call on a
//! connection id runs in the same session. Positional `?` placeholders are
//! rewritten to `@P1..@Pn` before binding.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query, Row};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use common::config::DialectDefaults;
use common::errors::{AppError, AppResult};
use common::models::schema::{fold_index_rows, IndexColumnRow};
use common::models::{
    ColumnInfo, ConnectArgs, DbType, IndexKind, InsertRows, QueryOutcome, Record,
    TableStructure, WriteSummary,
};
use common::utils::sql::translate_positional;
use common::utils::SqlDialect;

use super::params::{bytes_to_json, float_to_json, row_object};
use super::{connection_error, query_error, wrong_handle, ConnectionHandle, Connector, PoolSettings};

const DIALECT: SqlDialect = SqlDialect::MSSQL;
const DEFAULT_SCHEMA: &str = "dbo";

/// Column name of the row count appended to every batch.
const ROWCOUNT_MARKER: &str = "__gateway_rowcount";

type MssqlClient = Client<Compat<TcpStream>>;

/// Live SQL Server session.
#[derive(Clone)]
pub struct MssqlHandle {
    client: Arc<Mutex<Option<MssqlClient>>>,
}

impl MssqlHandle {
    fn new(client: MssqlClient) -> Self {
        Self {
            client: Arc::new(Mutex::new(Some(client))),
        }
    }
}

pub struct MssqlConnector {
    settings: PoolSettings,
}

impl MssqlConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }

    /// Builds the client configuration. `options` is applied last.
    fn config(args: &ConnectArgs) -> AppResult<Config> {
        let defaults = DialectDefaults::from_env(DbType::SqlServer);
        let invalid = |e: tiberius::error::Error| {
            AppError::Validation(format!("SQL Server: invalid connection string: {e}"))
        };

        let (mut config, user, password) = match &args.url {
            Some(url) => {
                // Certificate trust is decided below, after the options overlay.
                let stripped = without_keys(url, TRUST_KEYS);
                let config = if url.trim_start().starts_with("jdbc:") {
                    Config::from_jdbc_string(&stripped).map_err(invalid)?
                } else {
                    Config::from_ado_string(&stripped).map_err(invalid)?
                };
                (config, args.user.clone(), args.password.clone())
            }
            None => {
                let mut config = Config::new();
                config.host(args.host.as_deref().unwrap_or(&defaults.host));
                config.port(args.port.unwrap_or(defaults.port));
                if let Some(database) = args.database.as_ref().or(defaults.database.as_ref()) {
                    config.database(database);
                }
                let user = args.user.clone().or(defaults.user);
                let password = args.password.clone().or(defaults.password);
                (config, Some(user.unwrap_or_default()), Some(password.unwrap_or_default()))
            }
        };

        if args.url.is_some() {
            if let Some(host) = &args.host {
                config.host(host);
            }
            if let Some(port) = args.port {
                config.port(port);
            }
            if let Some(database) = &args.database {
                config.database(database);
            }
        }

        if let Some(host) = args.option_str("server").or_else(|| args.option_str("host")) {
            config.host(host);
        }
        if let Some(port) = args.option_str("port").and_then(|p| p.parse::<u16>().ok()) {
            config.port(port);
        }
        if let Some(database) = args.option_str("database") {
            config.database(database);
        }

        // A connection string keeps its own login unless something overrides part of it.
        let overridden = args.option_str("user").is_some()
            || args.option_str("username").is_some()
            || args.option_str("password").is_some()
            || user.is_some()
            || password.is_some();
        if overridden {
            let base_user = user.or_else(|| args.url.as_deref().and_then(|u| string_value(u, USER_KEYS)));
            let base_password =
                password.or_else(|| args.url.as_deref().and_then(|u| string_value(u, PASSWORD_KEYS)));
            let (user, password) = credentials(args, base_user, base_password);
            config.authentication(AuthMethod::sql_server(
                user.unwrap_or_default(),
                password.unwrap_or_default(),
            ));
        }

        if trust_server_certificate(args) {
            config.trust_cert();
        }
        if let Some(encrypt) = args.option_bool("encrypt") {
            config.encryption(if encrypt {
                EncryptionLevel::Required
            } else {
                EncryptionLevel::Off
            });
        }
        if let Some(name) = args.option_str("application_name").or_else(|| args.option_str("appName")) {
            config.application_name(name);
        }
        if let Some(instance) = args.option_str("instance_name").or_else(|| args.option_str("instanceName")) {
            config.instance_name(instance);
        }
        Ok(config)
    }
}

const TRUST_KEYS: &[&str] = &["TrustServerCertificate"];
const USER_KEYS: &[&str] = &["user id", "uid", "user", "username"];
const PASSWORD_KEYS: &[&str] = &["password", "pwd"];

fn key_matches(part: &str, keys: &[&str]) -> Option<String> {
    let (key, value) = part.split_once('=')?;
    keys.iter()
        .any(|k| key.trim().eq_ignore_ascii_case(k))
        .then(|| value.trim().to_string())
}

/// Value of the first of `keys` present in an ADO or JDBC connection string.
/// Keys match case-insensitively.
fn string_value(url: &str, keys: &[&str]) -> Option<String> {
    url.split(';').find_map(|part| key_matches(part, keys))
}

/// The connection string with every `keys` entry removed.
fn without_keys(url: &str, keys: &[&str]) -> String {
    url.split(';')
        .filter(|part| key_matches(part, keys).is_none())
        .collect::<Vec<_>>()
        .join(";")
}

/// `trust_server_certificate` from `options` (camelCase accepted), then the
/// connection string, then true.
fn trust_server_certificate(args: &ConnectArgs) -> bool {
    args.option_bool("trust_server_certificate")
        .or_else(|| args.option_bool("trustServerCertificate"))
        .or_else(|| {
            let value = string_value(args.url.as_deref()?, TRUST_KEYS)?;
            Some(matches!(value.to_ascii_lowercase().as_str(), "true" | "yes"))
        })
        .unwrap_or(true)
}

/// Login after the `options` overlay. User and password each fall back to
/// the already resolved value on their own.
fn credentials(
    args: &ConnectArgs,
    user: Option<String>,
    password: Option<String>,
) -> (Option<String>, Option<String>) {
    let user = args
        .option_str("user")
        .or_else(|| args.option_str("username"))
        .or(user);
    let password = args.option_str("password").or(password);
    (user, password)
}

fn handle(handle: &ConnectionHandle) -> AppResult<&MssqlHandle> {
    match handle {
        ConnectionHandle::Mssql(handle) => Ok(handle),
        other => Err(wrong_handle(DbType::SqlServer, other)),
    }
}

fn err(e: impl std::fmt::Display) -> AppError {
    query_error(DbType::SqlServer, e)
}

fn closed() -> AppError {
    connection_error(DbType::SqlServer, "connection is closed")
}

/// Converts one cell to JSON.
fn cell_to_json(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(Some(v)) => Value::from(*v),
        ColumnData::I16(Some(v)) => Value::from(*v),
        ColumnData::I32(Some(v)) => Value::from(*v),
        ColumnData::I64(Some(v)) => Value::from(*v),
        ColumnData::F32(Some(v)) => float_to_json(f64::from(*v)),
        ColumnData::F64(Some(v)) => float_to_json(*v),
        ColumnData::Bit(Some(v)) => Value::Bool(*v),
        ColumnData::String(Some(s)) => Value::String(s.to_string()),
        ColumnData::Guid(Some(g)) => Value::String(g.to_string()),
        ColumnData::Binary(Some(b)) => bytes_to_json(b),
        ColumnData::Numeric(Some(n)) => Value::String(n.to_string()),
        ColumnData::Xml(Some(x)) => Value::String(x.clone().into_owned().into_string()),
        ColumnData::DateTime(Some(_))
        | ColumnData::SmallDateTime(Some(_))
        | ColumnData::DateTime2(Some(_)) => NaiveDateTime::from_sql(data)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Date(Some(_)) => NaiveDate::from_sql(data)
            .ok()
            .flatten()
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Time(Some(_)) => NaiveTime::from_sql(data)
            .ok()
            .flatten()
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTimeOffset(Some(_)) => DateTime::<FixedOffset>::from_sql(data)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn row_to_json(row: Row, fields: &[String]) -> Value {
    let values = row.into_iter().map(|cell| cell_to_json(&cell)).collect();
    row_object(fields, values)
}

fn column_names(row: &Row) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn rows_to_json(rows: Vec<Row>) -> Vec<Value> {
    let fields = rows.first().map(column_names).unwrap_or_default();
    rows.into_iter().map(|row| row_to_json(row, &fields)).collect()
}

/// Binds JSON values as owned SQL Server parameters.
fn bind_values<'a>(query: &mut Query<'a>, values: &[&Value]) {
    for value in values {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        }
    }
}

/// Whether T-SQL requires `sql` to be the only statement of its batch.
fn must_run_alone(sql: &str) -> bool {
    let mut words = sql.split_whitespace().map(str::to_uppercase);
    let object = match words.next().as_deref() {
        Some("CREATE") | Some("ALTER") => match words.next() {
            // CREATE OR ALTER <object>
            Some(word) if word == "OR" => words.nth(1),
            other => other,
        },
        _ => return false,
    };
    matches!(
        object.as_deref(),
        Some("PROCEDURE" | "PROC" | "VIEW" | "FUNCTION" | "TRIGGER" | "SCHEMA")
    )
}

/// Runs one parameterised batch and returns its first result set, or its
/// affected row count when it produced none.
async fn run_batch(client: &mut MssqlClient, sql: &str, values: &[&Value]) -> AppResult<QueryOutcome> {
    let alone = must_run_alone(sql);
    let batch = if alone {
        sql.to_string()
    } else {
        // The newline terminates a trailing line comment.
        format!("{sql}\n;SELECT @@ROWCOUNT AS [{ROWCOUNT_MARKER}]")
    };
    let mut query = Query::new(batch);
    bind_values(&mut query, values);

    let mut stream = query.query(client).await.map_err(err)?;
    let fields: Option<Vec<String>> = stream
        .columns()
        .await
        .map_err(err)?
        .map(|columns| columns.iter().map(|c| c.name().to_string()).collect());

    match fields {
        Some(fields) if fields.first().map(String::as_str) != Some(ROWCOUNT_MARKER) => {
            let rows = stream.into_first_result().await.map_err(err)?;
            let results = rows.into_iter().map(|row| row_to_json(row, &fields)).collect();
            Ok(QueryOutcome::rows(results, fields))
        }
        Some(_) => {
            let rows = stream.into_first_result().await.map_err(err)?;
            let affected = rows
                .first()
                .and_then(|row| row.try_get::<i32, _>(0).ok().flatten())
                .unwrap_or(0);
            Ok(QueryOutcome::write(WriteSummary::affected(
                u64::try_from(affected).unwrap_or(0),
            )))
        }
        None => {
            stream.into_results().await.map_err(err)?;
            Ok(QueryOutcome::write(WriteSummary::affected(0)))
        }
    }
}

/// Runs a statement whose rows are echoed through `OUTPUT`.
async fn run_output(client: &mut MssqlClient, sql: &str, values: &[&Value]) -> AppResult<Vec<Value>> {
    let mut query = Query::new(sql.to_string());
    bind_values(&mut query, values);
    let rows = query
        .query(client)
        .await
        .map_err(err)?
        .into_first_result()
        .await
        .map_err(err)?;
    Ok(rows_to_json(rows))
}

async fn simple(client: &mut MssqlClient, sql: &str) -> AppResult<()> {
    client
        .simple_query(sql)
        .await
        .map_err(err)?
        .into_results()
        .await
        .map_err(err)?;
    Ok(())
}

fn text(row: &Row, column: &str) -> AppResult<String> {
    row.try_get::<&str, _>(column)
        .map(|v| v.unwrap_or_default().to_string())
        .map_err(err)
}

fn split_table(table_name: &str) -> (&str, &str) {
    table_name
        .split_once('.')
        .unwrap_or((DEFAULT_SCHEMA, table_name))
}

fn returning_summary(returned: Vec<Value>) -> WriteSummary {
    WriteSummary {
        affected_rows: returned.len() as u64,
        returning: Some(returned),
        ..Default::default()
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    fn db_type(&self) -> DbType {
        DbType::SqlServer
    }

    async fn connect(&self, args: &ConnectArgs) -> AppResult<ConnectionHandle> {
        let config = Self::config(args)?;
        let connect = async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| connection_error(DbType::SqlServer, e))?;
            tcp.set_nodelay(true)
                .map_err(|e| connection_error(DbType::SqlServer, e))?;
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| connection_error(DbType::SqlServer, e))
        };
        let client = tokio::time::timeout(self.settings.connect_timeout, connect)
            .await
            .map_err(|_| connection_error(DbType::SqlServer, "connection timed out"))??;
        Ok(ConnectionHandle::Mssql(MssqlHandle::new(client)))
    }

    async fn list_databases(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        let mut guard = self::handle(handle)?.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;
        let rows = run_output(
            client,
            "SELECT name FROM sys.databases WHERE database_id > 4 ORDER BY name",
            &[],
        )
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r["name"].as_str().map(String::from))
            .collect())
    }

    async fn list_tables(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        let mut guard = self::handle(handle)?.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;
        let rows = run_output(
            client,
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
            &[],
        )
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r["TABLE_NAME"].as_str().map(String::from))
            .collect())
    }

    async fn get_table_structure(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
    ) -> AppResult<TableStructure> {
        let mut guard = self::handle(handle)?.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;
        let (schema, table) = split_table(table_name);
        let qualified = DIALECT.quote_table(&format!("{schema}.{table}"));

        let mut query = Query::new(
            "SELECT c.COLUMN_NAME, c.DATA_TYPE, c.IS_NULLABLE, c.COLUMN_DEFAULT, \
                    COLUMNPROPERTY(OBJECT_ID(@P1), c.COLUMN_NAME, 'IsIdentity') AS IS_IDENTITY \
             FROM INFORMATION_SCHEMA.COLUMNS c \
             WHERE c.TABLE_SCHEMA = @P2 AND c.TABLE_NAME = @P3 \
             ORDER BY c.ORDINAL_POSITION",
        );
        query.bind(qualified.clone());
        query.bind(schema.to_string());
        query.bind(table.to_string());
        let column_rows = query
            .query(client)
            .await
            .map_err(err)?
            .into_first_result()
            .await
            .map_err(err)?;
        if column_rows.is_empty() {
            return Err(err(format!("Invalid object name '{table_name}'")));
        }

        let mut query = Query::new(
            "SELECT i.name AS index_name, col.name AS column_name, \
                    i.is_unique, i.is_primary_key \
             FROM sys.indexes i \
             JOIN sys.index_columns ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id \
             JOIN sys.columns col ON ic.object_id = col.object_id AND ic.column_id = col.column_id \
             WHERE i.object_id = OBJECT_ID(@P1) AND i.name IS NOT NULL AND ic.is_included_column = 0 \
             ORDER BY i.name, ic.key_ordinal",
        );
        query.bind(qualified);
        let index_rows = query
            .query(client)
            .await
            .map_err(err)?
            .into_first_result()
            .await
            .map_err(err)?;
        let index_rows = index_rows
            .iter()
            .map(|row| {
                Ok(IndexColumnRow {
                    index_name: text(row, "index_name")?,
                    column_name: text(row, "column_name")?,
                    unique: row.try_get::<bool, _>("is_unique").map_err(err)?.unwrap_or(false),
                    primary: row
                        .try_get::<bool, _>("is_primary_key")
                        .map_err(err)?
                        .unwrap_or(false),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        let indexes = fold_index_rows(index_rows);
        let primary_columns: Vec<&String> = indexes
            .iter()
            .filter(|i| i.kind == IndexKind::Primary)
            .flat_map(|i| i.columns.iter())
            .collect();

        let columns = column_rows
            .iter()
            .map(|row| {
                let name = text(row, "COLUMN_NAME")?;
                let default = row
                    .try_get::<&str, _>("COLUMN_DEFAULT")
                    .map_err(err)?
                    .map(|d| Value::String(d.to_string()));
                let identity = row.try_get::<i32, _>("IS_IDENTITY").map_err(err)?;
                Ok(ColumnInfo {
                    primary_key: primary_columns.contains(&&name),
                    data_type: text(row, "DATA_TYPE")?,
                    nullable: text(row, "IS_NULLABLE")? == "YES",
                    default,
                    auto_increment: Some(identity == Some(1)),
                    name,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(TableStructure {
            table_name: table_name.to_string(),
            columns,
            indexes,
        })
    }

    async fn execute_query(
        &self,
        handle: &ConnectionHandle,
        query: &str,
        params: &[Value],
    ) -> AppResult<QueryOutcome> {
        let (sql, placeholders) = translate_positional(query);
        if placeholders > 0 && placeholders != params.len() {
            return Err(AppError::Validation(format!(
                "SQL Server: query has {placeholders} placeholders but {} parameters were given",
                params.len()
            )));
        }
        tracing::debug!(sql = %sql, params = params.len(), "mssql execute");

        let mut guard = self::handle(handle)?.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;
        let values: Vec<&Value> = params.iter().collect();
        run_batch(client, &sql, &values).await
    }

    async fn insert_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        rows: &InsertRows,
    ) -> AppResult<QueryOutcome> {
        let columns = rows.columns();
        let sql = DIALECT.insert(table_name, &columns, 1, true);

        let mut guard = self::handle(handle)?.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;

        simple(client, "BEGIN TRANSACTION").await?;
        let mut returned = Vec::with_capacity(rows.len());
        let mut result = Ok(());
        for record in rows.records() {
            let values = rows.values_of(record, &columns);
            match run_output(client, &sql, &values).await {
                Ok(rows) => returned.extend(rows),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            result = simple(client, "COMMIT TRANSACTION").await;
        }
        if let Err(e) = result {
            if let Err(rollback) = simple(client, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            return Err(e);
        }

        Ok(QueryOutcome::write(returning_summary(returned)))
    }

    async fn update_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        data: &Record,
        filter: &Record,
    ) -> AppResult<QueryOutcome> {
        let set_columns: Vec<String> = data.keys().cloned().collect();
        let where_columns: Vec<String> = filter.keys().cloned().collect();
        let sql = DIALECT.update(table_name, &set_columns, &where_columns, true);
        let values: Vec<&Value> = data.values().chain(filter.values()).collect();

        let mut guard = self::handle(handle)?.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;
        let returned = run_output(client, &sql, &values).await?;
        Ok(QueryOutcome::write(returning_summary(returned)))
    }

    async fn delete_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        filter: &Record,
    ) -> AppResult<QueryOutcome> {
        let where_columns: Vec<String> = filter.keys().cloned().collect();
        let sql = DIALECT.delete(table_name, &where_columns, true);
        let values: Vec<&Value> = filter.values().collect();

        let mut guard = self::handle(handle)?.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;
        let returned = run_output(client, &sql, &values).await?;
        Ok(QueryOutcome::write(returning_summary(returned)))
    }

    async fn close_connection(&self, handle: &ConnectionHandle) -> AppResult<()> {
        let client = self::handle(handle)?
            .client
            .lock()
            .await
            .take()
            .ok_or_else(|| connection_error(DbType::SqlServer, "connection is already closed"))?;
        client
            .close()
            .await
            .map_err(|e| connection_error(DbType::SqlServer, e))
    }
}

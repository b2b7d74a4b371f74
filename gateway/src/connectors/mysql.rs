//! MySQL / MariaDB connector.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{Column, MySqlPool, Row, TypeInfo, ValueRef};

use common::config::DialectDefaults;
use common::errors::{AppError, AppResult};
use common::models::schema::{fold_index_rows, IndexColumnRow};
use common::models::{
    ColumnInfo, ConnectArgs, DbType, InsertRows, QueryOutcome, Record, TableStructure,
    WriteSummary,
};
use common::utils::SqlDialect;

use super::options::resolve_url;
use super::params::{bind_all, bytes_to_json, float_to_json, result_columns, row_object};
use super::{connection_error, query_error, wrong_handle, ConnectionHandle, Connector, PoolSettings};

const DIALECT: SqlDialect = SqlDialect::MYSQL;

pub struct MySqlConnector {
    settings: PoolSettings,
}

impl MySqlConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }
}

fn pool(handle: &ConnectionHandle) -> AppResult<&MySqlPool> {
    match handle {
        ConnectionHandle::MySql(pool) => Ok(pool),
        other => Err(wrong_handle(DbType::MySQL, other)),
    }
}

fn err(e: impl std::fmt::Display) -> AppError {
    query_error(DbType::MySQL, e)
}

fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

/// Decodes one cell by its column type.
fn decode_value(row: &MySqlRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    let decoded = match type_name.as_str() {
        "BOOLEAN" => row.try_get::<bool, _>(index).map(Value::Bool),
        name if name.ends_with("UNSIGNED") => row.try_get::<u64, _>(index).map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(index).map(Value::from)
        }
        "YEAR" => row.try_get_unchecked::<u16, _>(index).map(Value::from),
        "FLOAT" => row
            .try_get::<f32, _>(index)
            .map(|f| float_to_json(f64::from(f))),
        "DOUBLE" => row.try_get::<f64, _>(index).map(float_to_json),
        // Rendered as text so no precision is lost.
        "DECIMAL" => row
            .try_get::<Decimal, _>(index)
            .map(|d| Value::String(d.to_string())),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string())),
        "DATETIME" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|dt| Value::String(format_datetime(dt))),
        "TIMESTAMP" => row
            .try_get::<DateTime<Utc>, _>(index)
            .map(|dt| Value::String(dt.to_rfc3339())),
        "JSON" => row.try_get::<Value, _>(index),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|b| bytes_to_json(&b)),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::String),
    };

    decoded
        .or_else(|_| {
            row.try_get_unchecked::<Vec<u8>, _>(index)
                .map(|b| bytes_to_json(&b))
        })
        .unwrap_or(Value::Null)
}

fn decode_rows(rows: &[MySqlRow], fields: &[String]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let values = (0..fields.len()).map(|i| decode_value(row, i)).collect();
            row_object(fields, values)
        })
        .collect()
}

/// Reads a catalog text column; some servers report these as binary strings.
fn text(row: &MySqlRow, column: &str) -> AppResult<String> {
    row.try_get_unchecked::<Option<String>, _>(column)
        .map(Option::unwrap_or_default)
        .map_err(err)
}

fn write_summary(rows_affected: u64, last_insert_id: u64) -> WriteSummary {
    WriteSummary {
        insert_id: (last_insert_id > 0).then(|| Value::from(last_insert_id)),
        ..WriteSummary::affected(rows_affected)
    }
}

/// `UPDATE` also reports the count as `changed_rows`.
fn update_summary(rows_affected: u64) -> WriteSummary {
    WriteSummary {
        changed_rows: Some(rows_affected),
        ..WriteSummary::affected(rows_affected)
    }
}

/// Runs `query` over the text protocol.
///
/// Used for statements the server refuses to prepare (`USE`, some
/// administrative commands). Only valid without parameters.
async fn execute_unprepared(pool: &MySqlPool, query: &str) -> AppResult<QueryOutcome> {
    let mut stream = sqlx::raw_sql(query).fetch_many(pool);
    let mut rows: Vec<MySqlRow> = Vec::new();
    let mut summary = WriteSummary::default();
    while let Some(item) = stream.try_next().await.map_err(err)? {
        item.either(
            |done| {
                summary.affected_rows += done.rows_affected();
                if done.last_insert_id() > 0 {
                    summary.insert_id = Some(Value::from(done.last_insert_id()));
                }
            },
            |row| rows.push(row),
        );
    }

    match rows.first() {
        Some(first) => {
            let fields: Vec<String> = first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            Ok(QueryOutcome::rows(decode_rows(&rows, &fields), fields))
        }
        None => Ok(QueryOutcome::write(summary)),
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn db_type(&self) -> DbType {
        DbType::MySQL
    }

    async fn connect(&self, args: &ConnectArgs) -> AppResult<ConnectionHandle> {
        let url = resolve_url(DbType::MySQL, args, &DialectDefaults::from_env(DbType::MySQL))?;
        let pool = MySqlPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.settings.connect_timeout)
            .connect(url.as_str())
            .await
            .map_err(|e| connection_error(DbType::MySQL, e))?;
        Ok(ConnectionHandle::MySql(pool))
    }

    async fn list_databases(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        let rows = sqlx::query("SHOW DATABASES")
            .fetch_all(pool(handle)?)
            .await
            .map_err(err)?;
        rows.iter().map(|row| text(row, "Database")).collect()
    }

    async fn list_tables(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        let rows = sqlx::query("SHOW TABLES")
            .fetch_all(pool(handle)?)
            .await
            .map_err(err)?;
        // The single column is named `Tables_in_<database>`.
        rows.iter()
            .map(|row| {
                row.try_get_unchecked::<Option<String>, _>(0)
                    .map(Option::unwrap_or_default)
                    .map_err(err)
            })
            .collect()
    }

    async fn get_table_structure(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
    ) -> AppResult<TableStructure> {
        let pool = pool(handle)?;
        let table = DIALECT.quote_table(table_name);

        let column_rows = sqlx::query(&format!("SHOW COLUMNS FROM {table}"))
            .fetch_all(pool)
            .await
            .map_err(err)?;
        let columns = column_rows
            .iter()
            .map(|row| {
                let key = text(row, "Key")?;
                let extra = text(row, "Extra")?;
                let default: Option<String> = row
                    .try_get_unchecked::<Option<String>, _>("Default")
                    .map_err(err)?;
                Ok(ColumnInfo {
                    name: text(row, "Field")?,
                    data_type: text(row, "Type")?,
                    nullable: text(row, "Null")? == "YES",
                    default: default.map(Value::String),
                    primary_key: key == "PRI",
                    auto_increment: Some(extra.to_lowercase().contains("auto_increment")),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let index_rows = sqlx::query(&format!("SHOW INDEX FROM {table}"))
            .fetch_all(pool)
            .await
            .map_err(err)?;
        let index_rows = index_rows
            .iter()
            .map(|row| {
                let name = text(row, "Key_name")?;
                let non_unique: i64 = row.try_get_unchecked("Non_unique").map_err(err)?;
                Ok(IndexColumnRow {
                    primary: name == "PRIMARY",
                    unique: non_unique == 0,
                    column_name: text(row, "Column_name")?,
                    index_name: name,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(TableStructure {
            table_name: table_name.to_string(),
            columns,
            indexes: fold_index_rows(index_rows),
        })
    }

    async fn execute_query(
        &self,
        handle: &ConnectionHandle,
        query: &str,
        params: &[Value],
    ) -> AppResult<QueryOutcome> {
        let pool = pool(handle)?;
        tracing::debug!(sql = %query, params = params.len(), "mysql execute");

        let fields = match result_columns(pool, query).await {
            Ok(fields) => fields,
            Err(e) if params.is_empty() => {
                tracing::debug!(error = %e, "prepare refused, retrying unprepared");
                return execute_unprepared(pool, query).await;
            }
            Err(e) => return Err(err(e)),
        };

        let statement = bind_all(sqlx::query(query), params);
        if fields.is_empty() {
            let result = statement.execute(pool).await.map_err(err)?;
            Ok(QueryOutcome::write(write_summary(
                result.rows_affected(),
                result.last_insert_id(),
            )))
        } else {
            let rows = statement.fetch_all(pool).await.map_err(err)?;
            Ok(QueryOutcome::rows(decode_rows(&rows, &fields), fields))
        }
    }

    async fn insert_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        rows: &InsertRows,
    ) -> AppResult<QueryOutcome> {
        let columns = rows.columns();
        let sql = DIALECT.insert(table_name, &columns, rows.len(), false);
        let values = rows
            .records()
            .iter()
            .flat_map(|record| rows.values_of(record, &columns));

        // One multi-row statement; `insert_id` is the id of the first row.
        let result = bind_all(sqlx::query(&sql), values)
            .execute(pool(handle)?)
            .await
            .map_err(err)?;
        Ok(QueryOutcome::write(write_summary(
            result.rows_affected(),
            result.last_insert_id(),
        )))
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
        let sql = DIALECT.update(table_name, &set_columns, &where_columns, false);

        let result = bind_all(sqlx::query(&sql), data.values().chain(filter.values()))
            .execute(pool(handle)?)
            .await
            .map_err(err)?;
        Ok(QueryOutcome::write(update_summary(result.rows_affected())))
    }

    async fn delete_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        filter: &Record,
    ) -> AppResult<QueryOutcome> {
        let where_columns: Vec<String> = filter.keys().cloned().collect();
        let sql = DIALECT.delete(table_name, &where_columns, false);

        let result = bind_all(sqlx::query(&sql), filter.values())
            .execute(pool(handle)?)
            .await
            .map_err(err)?;
        Ok(QueryOutcome::write(WriteSummary::affected(result.rows_affected())))
    }

    async fn close_connection(&self, handle: &ConnectionHandle) -> AppResult<()> {
        let pool = pool(handle)?;
        if pool.is_closed() {
            return Err(connection_error(DbType::MySQL, "connection is already closed"));
        }
        pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_id_reported_only_when_generated() {
        let with_id = write_summary(3, 10);
        assert_eq!(with_id.insert_id, Some(json!(10)));
        assert_eq!(with_id.affected_rows, 3);
        assert_eq!(write_summary(2, 0).insert_id, None);
    }

    #[test]
    fn test_write_envelopes() {
        let insert = serde_json::to_value(QueryOutcome::write(write_summary(2, 41))).unwrap();
        assert_eq!(insert, json!({"affected_rows": 2, "insert_id": 41}));

        let update = serde_json::to_value(QueryOutcome::write(update_summary(5))).unwrap();
        assert_eq!(update, json!({"affected_rows": 5, "changed_rows": 5}));

        let delete = serde_json::to_value(QueryOutcome::write(write_summary(1, 0))).unwrap();
        assert_eq!(delete, json!({"affected_rows": 1}));
    }

    #[test]
    fn test_datetime_keeps_fraction_only_when_present() {
        let whole = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(format_datetime(whole), "2024-05-01 08:30:00");
        let fractional = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_milli_opt(8, 30, 0, 250)
            .unwrap();
        assert_eq!(format_datetime(fractional), "2024-05-01 08:30:00.250");
    }

    #[test]
    fn test_generated_statements_use_backticks() {
        let sql = DIALECT.update(
            "shop.orders",
            &["status".to_string()],
            &["id".to_string()],
            false,
        );
        assert_eq!(sql, "UPDATE `shop`.`orders` SET `status` = ? WHERE `id` = ?");
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let connector = MySqlConnector::new(PoolSettings {
            max_connections: 1,
            connect_timeout: std::time::Duration::from_millis(500),
        });
        let args = ConnectArgs {
            host: Some("127.0.0.1".into()),
            port: Some(1),
            ..Default::default()
        };
        let err = connector.connect(&args).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.to_string().starts_with("MySQL: "));
    }
}

//! PostgreSQL connector.
//!
//! Postgres will not implicitly cast a bound `text` to `integer`, so every
//! statement is described first and each JSON argument is coerced to the
//! parameter type the server inferred.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::{Column, Executor, PgPool, Postgres, Row, Statement, TypeInfo, ValueRef};
use uuid::Uuid;

use common::config::DialectDefaults;
use common::errors::{AppError, AppResult};
use common::models::schema::{fold_index_rows, IndexColumnRow};
use common::models::{
    ColumnInfo, ConnectArgs, DbType, IndexKind, InsertRows, QueryOutcome, Record, TableStructure,
    WriteSummary,
};
use common::utils::SqlDialect;

use super::options::resolve_url;
use super::params::{bytes_to_json, float_to_json, row_object, value_to_text};
use super::{connection_error, query_error, wrong_handle, ConnectionHandle, Connector, PoolSettings};

const DIALECT: SqlDialect = SqlDialect::POSTGRES;
const DEFAULT_SCHEMA: &str = "public";

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

pub struct PostgresConnector {
    settings: PoolSettings,
}

impl PostgresConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }
}

fn pool(handle: &ConnectionHandle) -> AppResult<&PgPool> {
    match handle {
        ConnectionHandle::Postgres(pool) => Ok(pool),
        other => Err(wrong_handle(DbType::Postgres, other)),
    }
}

fn err(e: impl std::fmt::Display) -> AppError {
    query_error(DbType::Postgres, e)
}

/// Result columns and inferred parameter types of a statement.
struct Described {
    fields: Vec<String>,
    parameters: Vec<PgTypeInfo>,
}

async fn describe<'e, 'q: 'e, E>(executor: E, sql: &'q str) -> Result<Described, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let statement = executor.prepare(sql).await?;
    let fields = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let parameters = statement
        .parameters()
        .and_then(|p| p.left())
        .map(<[PgTypeInfo]>::to_vec)
        .unwrap_or_default();
    Ok(Described { fields, parameters })
}

/// Builds a query with every value bound as its inferred parameter type.
fn bind_params<'q>(
    sql: &'q str,
    values: &[&Value],
    types: &[PgTypeInfo],
) -> AppResult<PgQuery<'q>> {
    if values.len() != types.len() {
        return Err(AppError::Validation(format!(
            "PostgreSQL: statement expects {} parameters but {} were given",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .try_fold(sqlx::query(sql), |query, (value, ty)| bind_typed(query, value, ty))
}

fn parse_text<T: FromStr>(value: &Value) -> Option<T> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Some(true),
            "false" | "f" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn to_naive_datetime(value: &Value) -> Option<NaiveDateTime> {
    let text = value.as_str()?.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.naive_utc()))
        .or_else(|| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?.and_hms_opt(0, 0, 0))
}

fn to_datetime_utc(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?.trim();
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| to_naive_datetime(value).map(|dt| dt.and_utc()))
}

fn to_vec<T>(value: &Value, item: impl Fn(&Value) -> Option<T>) -> Option<Vec<T>> {
    value.as_array()?.iter().map(item).collect()
}

fn bind_typed<'q>(query: PgQuery<'q>, value: &Value, ty: &PgTypeInfo) -> AppResult<PgQuery<'q>> {
    let name = ty.name();
    let mismatch = || {
        AppError::Validation(format!(
            "PostgreSQL: parameter value {value} cannot be bound as {name}"
        ))
    };

    // Binds `None::<T>` for null, otherwise the converted value.
    macro_rules! bind_as {
        ($ty:ty, $convert:expr) => {{
            if value.is_null() {
                query.bind(None::<$ty>)
            } else {
                let converted: Option<$ty> = $convert;
                query.bind(Some(converted.ok_or_else(mismatch)?))
            }
        }};
    }

    let query = match name {
        "BOOL" => bind_as!(bool, to_bool(value)),
        "INT2" => bind_as!(i16, parse_text(value)),
        "INT4" => bind_as!(i32, parse_text(value)),
        "INT8" => bind_as!(i64, parse_text(value)),
        "FLOAT4" => bind_as!(f32, parse_text(value)),
        "FLOAT8" => bind_as!(f64, parse_text(value)),
        "NUMERIC" => bind_as!(Decimal, to_decimal(value)),
        "JSON" | "JSONB" => query.bind(value.clone()),
        "UUID" => bind_as!(Uuid, value.as_str().and_then(|s| Uuid::parse_str(s).ok())),
        "DATE" => bind_as!(
            NaiveDate,
            value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        ),
        "TIME" => bind_as!(
            NaiveTime,
            value
                .as_str()
                .and_then(|s| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok())
        ),
        "TIMESTAMP" => bind_as!(NaiveDateTime, to_naive_datetime(value)),
        "TIMESTAMPTZ" => bind_as!(DateTime<Utc>, to_datetime_utc(value)),
        "BYTEA" => bind_as!(Vec<u8>, value.as_str().map(|s| s.as_bytes().to_vec())),
        "INT4[]" => bind_as!(Vec<i32>, to_vec(value, parse_text)),
        "INT8[]" => bind_as!(Vec<i64>, to_vec(value, parse_text)),
        "TEXT[]" | "VARCHAR[]" => bind_as!(Vec<String>, to_vec(value, |v| Some(value_to_text(v)))),
        // TEXT, VARCHAR, BPCHAR, NAME and anything without a native mapping.
        _ => bind_as!(String, Some(value_to_text(value))),
    };
    Ok(query)
}

/// Decodes one cell by its column type.
fn decode_value(row: &PgRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(index).map(Value::from),
        "INT4" => row.try_get::<i32, _>(index).map(Value::from),
        "INT8" => row.try_get::<i64, _>(index).map(Value::from),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .map(|f| float_to_json(f64::from(f))),
        "FLOAT8" => row.try_get::<f64, _>(index).map(float_to_json),
        "NUMERIC" => row
            .try_get::<Decimal, _>(index)
            .map(|d| Value::String(d.to_string())),
        "JSON" | "JSONB" => row.try_get::<Value, _>(index),
        "UUID" => row
            .try_get::<Uuid, _>(index)
            .map(|u| Value::String(u.to_string())),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string())),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(index)
            .map(|dt| Value::String(dt.to_rfc3339())),
        "BYTEA" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|b| bytes_to_json(&b)),
        "BOOL[]" => row.try_get::<Vec<bool>, _>(index).map(Value::from),
        "INT4[]" => row.try_get::<Vec<i32>, _>(index).map(Value::from),
        "INT8[]" => row.try_get::<Vec<i64>, _>(index).map(Value::from),
        "TEXT[]" | "VARCHAR[]" => row.try_get::<Vec<String>, _>(index).map(Value::from),
        // Text-like types, and enums, whose wire format is their label.
        _ => row.try_get_unchecked::<String, _>(index).map(Value::String),
    };
    decoded.unwrap_or(Value::Null)
}

fn decode_rows(rows: &[PgRow]) -> (Vec<Value>, Vec<String>) {
    let fields: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let results = rows
        .iter()
        .map(|row| {
            let values = (0..fields.len()).map(|i| decode_value(row, i)).collect();
            row_object(&fields, values)
        })
        .collect();
    (results, fields)
}

/// Splits `schema.table`, defaulting the schema.
fn split_table(table_name: &str) -> (&str, &str) {
    table_name
        .split_once('.')
        .unwrap_or((DEFAULT_SCHEMA, table_name))
}

/// Runs `query` over the simple protocol, for multi-statement text.
async fn execute_unprepared(pool: &PgPool, query: &str) -> AppResult<QueryOutcome> {
    let mut stream = sqlx::raw_sql(query).fetch_many(pool);
    let mut rows: Vec<PgRow> = Vec::new();
    let mut affected = 0u64;
    while let Some(item) = stream.try_next().await.map_err(err)? {
        item.either(
            |done| affected += done.rows_affected(),
            |row| rows.push(row),
        );
    }
    if rows.is_empty() {
        return Ok(QueryOutcome::write(WriteSummary::affected(affected)));
    }
    let (results, fields) = decode_rows(&rows);
    Ok(QueryOutcome::rows(results, fields))
}

/// Write summary for a `RETURNING *` statement. The echoed rows go to
/// `returning`, never `results`.
fn returning_summary(rows: &[PgRow]) -> WriteSummary {
    let (returned, _) = decode_rows(rows);
    summarize_returned(returned)
}

fn summarize_returned(returned: Vec<Value>) -> WriteSummary {
    WriteSummary {
        affected_rows: returned.len() as u64,
        returning: Some(returned),
        ..Default::default()
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn db_type(&self) -> DbType {
        DbType::Postgres
    }

    async fn connect(&self, args: &ConnectArgs) -> AppResult<ConnectionHandle> {
        let url = resolve_url(
            DbType::Postgres,
            args,
            &DialectDefaults::from_env(DbType::Postgres),
        )?;
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.settings.connect_timeout)
            .connect(url.as_str())
            .await
            .map_err(|e| connection_error(DbType::Postgres, e))?;
        Ok(ConnectionHandle::Postgres(pool))
    }

    async fn list_databases(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT datname::text FROM pg_database WHERE datistemplate = false ORDER BY datname",
        )
        .fetch_all(pool(handle)?)
        .await
        .map_err(err)
    }

    async fn list_tables(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(DEFAULT_SCHEMA)
        .fetch_all(pool(handle)?)
        .await
        .map_err(err)
    }

    async fn get_table_structure(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
    ) -> AppResult<TableStructure> {
        let pool = pool(handle)?;
        let (schema, table) = split_table(table_name);

        let column_rows = sqlx::query(
            "SELECT column_name::text, data_type::text, is_nullable::text, \
                    column_default::text, is_identity::text \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await
        .map_err(err)?;
        if column_rows.is_empty() {
            return Err(err(format!("relation \"{table_name}\" does not exist")));
        }

        let index_rows = sqlx::query(
            "SELECT i.relname::text AS index_name, a.attname::text AS column_name, \
                    ix.indisunique AS is_unique, ix.indisprimary AS is_primary \
             FROM pg_index ix \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = ANY(ix.indkey) \
             WHERE ix.indrelid = $1::regclass \
             ORDER BY i.relname, array_position(ix.indkey::int2[], a.attnum)",
        )
        .bind(DIALECT.quote_table(table_name))
        .fetch_all(pool)
        .await
        .map_err(err)?;
        let index_rows = index_rows
            .iter()
            .map(|row| {
                Ok(IndexColumnRow {
                    index_name: row.try_get("index_name")?,
                    column_name: row.try_get("column_name")?,
                    unique: row.try_get("is_unique")?,
                    primary: row.try_get("is_primary")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(err)?;
        let indexes = fold_index_rows(index_rows);
        let primary_columns: Vec<&String> = indexes
            .iter()
            .filter(|i| i.kind == IndexKind::Primary)
            .flat_map(|i| i.columns.iter())
            .collect();

        let columns = column_rows
            .iter()
            .map(|row| {
                let name: String = row.try_get("column_name")?;
                let default: Option<String> = row.try_get("column_default")?;
                let identity: Option<String> = row.try_get("is_identity")?;
                let serial = default
                    .as_deref()
                    .is_some_and(|d| d.starts_with("nextval("));
                Ok(ColumnInfo {
                    primary_key: primary_columns.contains(&&name),
                    data_type: row.try_get("data_type")?,
                    nullable: row.try_get::<String, _>("is_nullable")? == "YES",
                    auto_increment: Some(serial || identity.as_deref() == Some("YES")),
                    default: default.map(Value::String),
                    name,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(err)?;

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
        let pool = pool(handle)?;
        tracing::debug!(sql = %query, params = params.len(), "postgres execute");

        let described = match describe(pool, query).await {
            Ok(described) => described,
            Err(e) if params.is_empty() => {
                tracing::debug!(error = %e, "prepare refused, retrying unprepared");
                return execute_unprepared(pool, query).await;
            }
            Err(e) => return Err(err(e)),
        };

        let values: Vec<&Value> = params.iter().collect();
        let statement = bind_params(query, &values, &described.parameters)?;
        if described.fields.is_empty() {
            let result = statement.execute(pool).await.map_err(err)?;
            Ok(QueryOutcome::write(WriteSummary::affected(
                result.rows_affected(),
            )))
        } else {
            let rows = statement.fetch_all(pool).await.map_err(err)?;
            let (results, _) = decode_rows(&rows);
            Ok(QueryOutcome::rows(results, described.fields))
        }
    }

    async fn insert_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        rows: &InsertRows,
    ) -> AppResult<QueryOutcome> {
        let columns = rows.columns();
        let sql = DIALECT.insert(table_name, &columns, 1, true);

        let mut tx = pool(handle)?.begin().await.map_err(err)?;
        let described = describe(&mut *tx, &sql).await.map_err(err)?;
        let mut inserted = Vec::with_capacity(rows.len());
        for record in rows.records() {
            let values = rows.values_of(record, &columns);
            let returned = bind_params(&sql, &values, &described.parameters)?
                .fetch_all(&mut *tx)
                .await
                .map_err(err)?;
            inserted.extend(returned);
        }
        tx.commit().await.map_err(err)?;

        Ok(QueryOutcome::write(returning_summary(&inserted)))
    }

    async fn update_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        data: &Record,
        filter: &Record,
    ) -> AppResult<QueryOutcome> {
        let pool = pool(handle)?;
        let set_columns: Vec<String> = data.keys().cloned().collect();
        let where_columns: Vec<String> = filter.keys().cloned().collect();
        let sql = DIALECT.update(table_name, &set_columns, &where_columns, true);

        let described = describe(pool, &sql).await.map_err(err)?;
        let values: Vec<&Value> = data.values().chain(filter.values()).collect();
        let rows = bind_params(&sql, &values, &described.parameters)?
            .fetch_all(pool)
            .await
            .map_err(err)?;
        Ok(QueryOutcome::write(returning_summary(&rows)))
    }

    async fn delete_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        filter: &Record,
    ) -> AppResult<QueryOutcome> {
        let pool = pool(handle)?;
        let where_columns: Vec<String> = filter.keys().cloned().collect();
        let sql = DIALECT.delete(table_name, &where_columns, true);

        let described = describe(pool, &sql).await.map_err(err)?;
        let values: Vec<&Value> = filter.values().collect();
        let rows = bind_params(&sql, &values, &described.parameters)?
            .fetch_all(pool)
            .await
            .map_err(err)?;
        Ok(QueryOutcome::write(returning_summary(&rows)))
    }

    async fn close_connection(&self, handle: &ConnectionHandle) -> AppResult<()> {
        let pool = pool(handle)?;
        if pool.is_closed() {
            return Err(connection_error(DbType::Postgres, "connection is already closed"));
        }
        pool.close().await;
        Ok(())
    }
}

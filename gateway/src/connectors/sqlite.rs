//! SQLite connector.
//!
//! One logical handle is a single-connection pool, so in-memory databases
//! live exactly as long as the handle and every call sees the same session.

use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, TypeInfo, ValueRef};

use common::config::DialectDefaults;
use common::errors::{AppError, AppResult};
use common::models::connection::scalar_to_string;
use common::models::schema::{fold_index_rows, IndexColumnRow};
use common::models::{
    ColumnInfo, ConnectArgs, DbType, IndexInfo, IndexKind, InsertRows, QueryOutcome, Record,
    TableStructure, WriteSummary,
};
use common::utils::SqlDialect;

use super::params::{bind_all, bytes_to_json, float_to_json, result_columns, row_object};
use super::{connection_error, query_error, wrong_handle, ConnectionHandle, Connector, PoolSettings};

const DIALECT: SqlDialect = SqlDialect::SQLITE;
const MEMORY_MARKER: &str = ":memory:";

/// Option keys consumed by the connector itself; anything else is a PRAGMA.
const KNOWN_OPTIONS: [&str; 5] = [
    "database",
    "filename",
    "read_only",
    "create_if_missing",
    "busy_timeout_ms",
];

pub struct SqliteConnector {
    settings: PoolSettings,
}

impl SqliteConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }

    /// Builds connect options from the caller's arguments.
    fn connect_options(args: &ConnectArgs) -> AppResult<SqliteConnectOptions> {
        let database = args
            .option_str("database")
            .or_else(|| args.option_str("filename"))
            .or_else(|| args.database.clone())
            .or_else(|| DialectDefaults::from_env(DbType::SQLite).database)
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| {
                AppError::Validation(
                    "SQLite: 'database' must be a file path or ':memory:'".to_string(),
                )
            })?;

        let mut options = if database == MEMORY_MARKER || database.starts_with("sqlite:") {
            let url = if database == MEMORY_MARKER {
                "sqlite::memory:".to_string()
            } else {
                database.clone()
            };
            SqliteConnectOptions::from_str(&url).map_err(|e| connection_error(DbType::SQLite, e))?
        } else {
            SqliteConnectOptions::new()
                .filename(&database)
                .create_if_missing(args.option_bool("create_if_missing").unwrap_or(true))
        };

        options = options.foreign_keys(true);
        if let Some(read_only) = args.option_bool("read_only") {
            options = options.read_only(read_only);
        }
        if let Some(ms) = args.option_str("busy_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
            options = options.busy_timeout(Duration::from_millis(ms));
        }
        for (key, value) in &args.options {
            if KNOWN_OPTIONS.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = scalar_to_string(value) {
                options = options.pragma(Cow::<'static, str>::Owned(key.clone()), Cow::<'static, str>::Owned(value));
            }
        }
        Ok(options)
    }
}

fn pool(handle: &ConnectionHandle) -> AppResult<&SqlitePool> {
    match handle {
        ConnectionHandle::Sqlite(pool) => Ok(pool),
        other => Err(wrong_handle(DbType::SQLite, other)),
    }
}

fn err(e: impl std::fmt::Display) -> AppError {
    query_error(DbType::SQLite, e)
}

/// Decodes one cell by its storage class.
fn decode_value(row: &SqliteRow, index: usize) -> Value {
    let raw = match row.try_get_raw(index) {
        Ok(raw) => raw,
        Err(_) => return Value::Null,
    };
    if raw.is_null() {
        return Value::Null;
    }
    let storage = raw.type_info().name().to_string();
    match storage.as_str() {
        "INTEGER" => row
            .try_get::<i64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<f64, _>(index)
            .map(float_to_json)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|b| bytes_to_json(&b))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn decode_rows(rows: &[SqliteRow], fields: &[String]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let values = (0..fields.len()).map(|i| decode_value(row, i)).collect();
            row_object(fields, values)
        })
        .collect()
}

fn write_summary(rows_affected: u64, last_rowid: i64) -> WriteSummary {
    WriteSummary {
        insert_id: (rows_affected > 0 && last_rowid > 0).then(|| Value::from(last_rowid)),
        ..WriteSummary::affected(rows_affected)
    }
}

/// Splits `schema.table` the way the write paths quote it.
fn split_table(table_name: &str) -> (Option<&str>, &str) {
    match table_name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, table_name),
    }
}

/// `PRAGMA [schema.]name(arg)`. The schema qualifies the pragma, not its argument.
fn pragma(schema: Option<&str>, name: &str, arg: &str) -> String {
    let arg = DIALECT.quote_ident(arg);
    match schema {
        Some(schema) => format!("PRAGMA {}.{name}({arg})", DIALECT.quote_ident(schema)),
        None => format!("PRAGMA {name}({arg})"),
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn db_type(&self) -> DbType {
        DbType::SQLite
    }

    async fn connect(&self, args: &ConnectArgs) -> AppResult<ConnectionHandle> {
        let options = Self::connect_options(args)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(self.settings.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| connection_error(DbType::SQLite, e))?;
        Ok(ConnectionHandle::Sqlite(pool))
    }

    async fn list_databases(&self, _handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        Ok(vec!["main".to_string()])
    }

    async fn list_tables(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
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

        let column_rows = sqlx::query(&pragma(schema, "table_info", table))
            .fetch_all(pool)
            .await
            .map_err(err)?;
        if column_rows.is_empty() {
            return Err(err(format!("no such table: {table_name}")));
        }

        let mut primary_columns: Vec<(i64, String)> = Vec::new();
        let mut columns = Vec::with_capacity(column_rows.len());
        for row in &column_rows {
            let name: String = row.try_get("name").map_err(err)?;
            let data_type: String = row.try_get("type").unwrap_or_default();
            let not_null: i64 = row.try_get("notnull").unwrap_or(0);
            let default: Option<String> = row.try_get("dflt_value").unwrap_or(None);
            let pk_position: i64 = row.try_get("pk").unwrap_or(0);
            if pk_position > 0 {
                primary_columns.push((pk_position, name.clone()));
            }
            columns.push(ColumnInfo {
                name,
                data_type,
                nullable: not_null == 0,
                default: default.map(Value::String),
                primary_key: pk_position > 0,
                auto_increment: None,
            });
        }
        primary_columns.sort_by_key(|(position, _)| *position);

        // A lone INTEGER PRIMARY KEY aliases the rowid and auto-increments.
        if let [(_, pk)] = primary_columns.as_slice() {
            for column in columns.iter_mut().filter(|c| &c.name == pk) {
                column.auto_increment = Some(column.data_type.eq_ignore_ascii_case("INTEGER"));
            }
        }

        let index_list = sqlx::query(&pragma(schema, "index_list", table))
            .fetch_all(pool)
            .await
            .map_err(err)?;
        let mut index_rows = Vec::new();
        for index in &index_list {
            let index_name: String = index.try_get("name").map_err(err)?;
            let unique: i64 = index.try_get("unique").unwrap_or(0);
            let origin: String = index.try_get("origin").unwrap_or_default();

            let members = sqlx::query(&pragma(schema, "index_info", &index_name))
            .fetch_all(pool)
            .await
            .map_err(err)?;
            for member in &members {
                let column: Option<String> = member.try_get("name").unwrap_or(None);
                index_rows.push(IndexColumnRow {
                    index_name: index_name.clone(),
                    column_name: column.unwrap_or_else(|| "(expression)".to_string()),
                    unique: unique != 0,
                    primary: origin == "pk",
                });
            }
        }
        let mut indexes = fold_index_rows(index_rows);

        // Rowid primary keys have no backing index; report them anyway.
        let has_primary = indexes.iter().any(|i| i.kind == IndexKind::Primary);
        if !has_primary && !primary_columns.is_empty() {
            indexes.insert(
                0,
                IndexInfo {
                    name: "PRIMARY".to_string(),
                    columns: primary_columns.into_iter().map(|(_, name)| name).collect(),
                    unique: true,
                    kind: IndexKind::Primary,
                },
            );
        }

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
        tracing::debug!(sql = %query, params = params.len(), "sqlite execute");

        let fields = result_columns(pool, query).await.map_err(err)?;
        let statement = bind_all(sqlx::query(query), params);
        if fields.is_empty() {
            let result = statement.execute(pool).await.map_err(err)?;
            Ok(QueryOutcome::write(write_summary(
                result.rows_affected(),
                result.last_insert_rowid(),
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
        let pool = pool(handle)?;
        let columns = rows.columns();
        let sql = DIALECT.insert(table_name, &columns, 1, false);

        let mut tx = pool.begin().await.map_err(err)?;
        let mut affected = 0u64;
        let mut ids = Vec::with_capacity(rows.len());
        for record in rows.records() {
            let values = rows.values_of(record, &columns);
            // Dropping the transaction on error rolls it back.
            let result = bind_all(sqlx::query(&sql), values)
                .execute(&mut *tx)
                .await
                .map_err(err)?;
            affected += result.rows_affected();
            ids.push(Value::from(result.last_insert_rowid()));
        }
        tx.commit().await.map_err(err)?;

        Ok(QueryOutcome::write(WriteSummary {
            insert_id: ids.last().cloned(),
            inserted_ids: (!rows.is_single()).then_some(ids),
            ..WriteSummary::affected(affected)
        }))
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
        Ok(QueryOutcome::write(WriteSummary {
            changed_rows: Some(result.rows_affected()),
            ..WriteSummary::affected(result.rows_affected())
        }))
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
        Ok(QueryOutcome::write(WriteSummary {
            deleted_count: Some(result.rows_affected()),
            ..WriteSummary::affected(result.rows_affected())
        }))
    }

    async fn close_connection(&self, handle: &ConnectionHandle) -> AppResult<()> {
        let pool = pool(handle)?;
        if pool.is_closed() {
            return Err(connection_error(DbType::SQLite, "connection is already closed"));
        }
        pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> ConnectArgs {
        ConnectArgs::from_args(value.as_object().unwrap()).unwrap()
    }

    async fn memory() -> (SqliteConnector, ConnectionHandle) {
        let connector = SqliteConnector::new(PoolSettings::default());
        let handle = connector
            .connect(&args(json!({"database": ":memory:"})))
            .await
            .unwrap();
        (connector, handle)
    }

    fn results(outcome: &QueryOutcome) -> &[Value] {
        match outcome {
            QueryOutcome::Rows(rows) => &rows.results,
            QueryOutcome::Write(_) => panic!("expected rows, got a write summary"),
        }
    }

    fn summary(outcome: &QueryOutcome) -> &WriteSummary {
        match outcome {
            QueryOutcome::Write(write) => write,
            QueryOutcome::Rows(_) => panic!("expected a write summary, got rows"),
        }
    }

    const CREATE_USERS: &str = "CREATE TABLE test_users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT UNIQUE, age INTEGER)";

    #[tokio::test]
    async fn test_database_is_required() {
        let err = SqliteConnector::connect_options(&args(json!({}))).err();
        if std::env::var("SQLITE_DATABASE").is_err() {
            assert!(matches!(err, Some(AppError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn test_in_memory_database_survives_between_calls() {
        let (connector, handle) = memory().await;
        connector.execute_query(&handle, CREATE_USERS, &[]).await.unwrap();
        let tables = connector.list_tables(&handle).await.unwrap();
        assert_eq!(tables, vec!["test_users"]);
        assert_eq!(connector.list_databases(&handle).await.unwrap(), vec!["main"]);
    }

    #[tokio::test]
    async fn test_read_and_write_shapes() {
        let (connector, handle) = memory().await;
        connector.execute_query(&handle, CREATE_USERS, &[]).await.unwrap();

        let insert = connector
            .execute_query(
                &handle,
                "INSERT INTO test_users (name, email, age) VALUES (?, ?, ?)",
                &[json!("Ana"), json!("ana@example.com"), json!(31)],
            )
            .await
            .unwrap();
        assert_eq!(summary(&insert).affected_rows, 1);
        assert_eq!(summary(&insert).insert_id, Some(json!(1)));

        let select = connector
            .execute_query(&handle, "SELECT * FROM test_users WHERE age > ?", &[json!(30)])
            .await
            .unwrap();
        let rows = results(&select);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], json!({"id": 1, "name": "Ana", "email": "ana@example.com", "age": 31}));

        // An empty result still carries the read shape.
        let empty = connector
            .execute_query(&handle, "SELECT id FROM test_users WHERE age > 100", &[])
            .await
            .unwrap();
        match empty {
            QueryOutcome::Rows(rows) => {
                assert!(rows.results.is_empty());
                assert_eq!(rows.fields, vec!["id"]);
            }
            QueryOutcome::Write(_) => panic!("expected rows"),
        }
    }

    #[tokio::test]
    async fn test_structure_reports_rowid_primary_key() {
        let (connector, handle) = memory().await;
        connector
            .execute_query(
                &handle,
                "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT UNIQUE)",
                &[],
            )
            .await
            .unwrap();
        let structure = connector.get_table_structure(&handle, "t").await.unwrap();

        assert_eq!(structure.columns.len(), 3);
        assert!(structure.columns[0].primary_key);
        assert_eq!(structure.columns[0].auto_increment, Some(true));
        assert!(!structure.columns[1].nullable);
        assert!(structure.indexes.iter().any(|i| i.kind == IndexKind::Primary));
        let unique = structure
            .indexes
            .iter()
            .find(|i| i.kind == IndexKind::Unique)
            .unwrap();
        assert_eq!(unique.columns, vec!["email"]);
    }

    #[tokio::test]
    async fn test_structure_of_missing_table_fails() {
        let (connector, handle) = memory().await;
        let err = connector.get_table_structure(&handle, "nope").await.unwrap_err();
        assert!(err.to_string().starts_with("SQLite: "));
    }

    #[tokio::test]
    async fn test_insert_rolls_back_on_failure() {
        let (connector, handle) = memory().await;
        connector.execute_query(&handle, CREATE_USERS, &[]).await.unwrap();

        let rows = InsertRows::from_value(&json!([
            {"name": "a", "email": "same@example.com"},
            {"name": "b", "email": "same@example.com"}
        ]))
        .unwrap();
        let err = connector.insert_data(&handle, "test_users", &rows).await.unwrap_err();
        assert_eq!(err.code(), "QUERY_ERROR");

        let count = connector
            .execute_query(&handle, "SELECT COUNT(*) AS n FROM test_users", &[])
            .await
            .unwrap();
        assert_eq!(results(&count)[0]["n"], json!(0));
    }

    #[tokio::test]
    async fn test_update_touches_only_matching_rows() {
        let (connector, handle) = memory().await;
        connector.execute_query(&handle, CREATE_USERS, &[]).await.unwrap();
        let rows = InsertRows::from_value(&json!([
            {"name": "a", "age": 20},
            {"name": "b", "age": 20},
            {"name": "c", "age": 40}
        ]))
        .unwrap();
        let inserted = connector.insert_data(&handle, "test_users", &rows).await.unwrap();
        assert_eq!(summary(&inserted).affected_rows, 3);
        assert_eq!(summary(&inserted).inserted_ids.as_ref().map(Vec::len), Some(3));

        let data = json!({"age": 21});
        let filter = json!({"name": "a", "age": 20});
        let updated = connector
            .update_data(
                &handle,
                "test_users",
                data.as_object().unwrap(),
                filter.as_object().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(summary(&updated).affected_rows, 1);

        let all = connector
            .execute_query(&handle, "SELECT name, age FROM test_users ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(
            results(&all),
            &[
                json!({"name": "a", "age": 21}),
                json!({"name": "b", "age": 20}),
                json!({"name": "c", "age": 40})
            ]
        );

        let filter = json!({"age": 20});
        let deleted = connector
            .delete_data(&handle, "test_users", filter.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(summary(&deleted).deleted_count, Some(1));
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let (connector, handle) = memory().await;
        connector
            .execute_query(&handle, "CREATE TABLE parent (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        connector
            .execute_query(
                &handle,
                "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id))",
                &[],
            )
            .await
            .unwrap();
        let err = connector
            .execute_query(&handle, "INSERT INTO child (parent_id) VALUES (99)", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUERY_ERROR");
    }

    #[tokio::test]
    async fn test_file_database_and_read_only_option() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let path = path.to_str().unwrap();

        let connector = SqliteConnector::new(PoolSettings::default());
        let handle = connector.connect(&args(json!({"database": path}))).await.unwrap();
        connector
            .execute_query(&handle, "CREATE TABLE notes (body TEXT)", &[])
            .await
            .unwrap();
        connector.close_connection(&handle).await.unwrap();

        let read_only = connector
            .connect(&args(json!({"database": path, "options": {"read_only": true}})))
            .await
            .unwrap();
        let err = connector
            .execute_query(&read_only, "INSERT INTO notes (body) VALUES ('x')", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUERY_ERROR");
    }

    #[tokio::test]
    async fn test_second_close_fails() {
        let (connector, handle) = memory().await;
        connector.close_connection(&handle).await.unwrap();
        let err = connector.close_connection(&handle).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    #[test]
    fn test_pragmas_take_the_schema_prefix() {
        assert_eq!(pragma(None, "table_info", "t"), "PRAGMA table_info(\"t\")");
        let (schema, table) = split_table("main.t");
        assert_eq!(
            pragma(schema, "index_list", table),
            "PRAGMA \"main\".index_list(\"t\")"
        );
    }

    #[tokio::test]
    async fn test_schema_qualified_structure_matches_insert() {
        let (connector, handle) = memory().await;
        connector.execute_query(&handle, CREATE_USERS, &[]).await.unwrap();

        let rows = InsertRows::from_value(&json!({"name": "Dee", "age": 33})).unwrap();
        connector.insert_data(&handle, "main.test_users", &rows).await.unwrap();

        let structure = connector
            .get_table_structure(&handle, "main.test_users")
            .await
            .unwrap();
        assert_eq!(structure.table_name, "main.test_users");
        assert_eq!(structure.columns.len(), 4);
        assert!(structure.indexes.iter().any(|i| i.kind == IndexKind::Primary));
        connector.close_connection(&handle).await.unwrap();
    }
}

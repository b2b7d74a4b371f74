//! Parameter binding and value rendering shared by the SQL connectors.

use serde_json::{Map, Number, Value};
use sqlx::query::Query;
use sqlx::{Column, Database, Encode, Executor, Pool, Statement, Type};

use common::errors::{AppError, AppResult};

/// Binds one JSON value to a sqlx query.
///
/// Used by the dialects that coerce parameter types server-side (MySQL,
/// SQLite). Arrays and objects are bound as their JSON text.
pub fn bind_json<'q, DB>(
    query: Query<'q, DB, <DB as Database>::Arguments<'q>>,
    value: &Value,
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB> + Type<DB>,
{
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Binds every value of `values` in order.
pub fn bind_all<'q, 'v, DB, I>(
    mut query: Query<'q, DB, <DB as Database>::Arguments<'q>>,
    values: I,
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    I: IntoIterator<Item = &'v Value>,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB> + Type<DB>,
{
    for value in values {
        query = bind_json(query, value);
    }
    query
}

/// Column names a statement would produce, from its prepared description.
///
/// Empty for statements that return no rows, which is how callers pick the
/// write shape over the read shape.
pub async fn result_columns<DB>(pool: &Pool<DB>, sql: &str) -> Result<Vec<String>, sqlx::Error>
where
    DB: Database,
    for<'c> &'c mut <DB as Database>::Connection: Executor<'c, Database = DB>,
{
    let statement = pool.prepare(sql).await?;
    Ok(statement
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect())
}

/// Extracts the `params` argument; absent or null means no parameters.
pub fn params_arg(value: Option<&Value>) -> AppResult<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(AppError::Validation("'params' must be an array".into())),
    }
}

/// Renders a JSON value as parameter text (strings unquoted, others as JSON).
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Bytes as a UTF-8 string when valid, otherwise `0x`-prefixed hex.
pub fn bytes_to_json(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            Value::String(format!("0x{hex}"))
        }
    }
}

/// A float as a JSON number; NaN and infinities become strings.
pub fn float_to_json(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

/// Pairs column names with decoded values into a row object.
pub fn row_object(fields: &[String], values: Vec<Value>) -> Value {
    let map: Map<String, Value> = fields.iter().cloned().zip(values).collect();
    Value::Object(map)
}

//! Tool dispatcher.
//!
//! Turns `(tool_name, args)` into a connector call and always answers with a
//! well-formed [`ToolEnvelope`]. Errors and panics raised anywhere below are
//! converted into failure envelopes here.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};

use common::errors::{AppError, AppResult};
use common::models::query::non_empty_object;
use common::models::{ConnectArgs, DbType, InsertRows, ToolName};
use common::response::ToolEnvelope;

use crate::connectors::params::params_arg;
use crate::connectors::ConnectorRegistry;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct Dispatcher {
    connectors: Arc<ConnectorRegistry>,
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(connectors: Arc<ConnectorRegistry>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            connectors,
            registry,
        }
    }

    /// Invokes a tool. Never fails; failures are reported in the envelope.
    ///
    /// The call runs on its own task, so it completes even when the caller
    /// stops waiting for it.
    pub async fn invoke(&self, tool_name: &str, args: &Value) -> ToolEnvelope {
        let this = self.clone();
        let tool = tool_name.to_string();
        let args = args.clone();
        let task = tokio::spawn(async move { this.dispatch(&tool, &args).await });

        match task.await {
            Ok(Ok(result)) => {
                tracing::info!(tool = tool_name, "Tool call succeeded");
                ToolEnvelope::success(result)
            }
            Ok(Err(e)) => {
                tracing::warn!(tool = tool_name, code = e.code(), error = %e, "Tool call failed");
                ToolEnvelope::failure(&e)
            }
            Err(e) => {
                tracing::error!(tool = tool_name, panicked = e.is_panic(), error = %e, "Tool call aborted");
                ToolEnvelope::failure(&AppError::Internal(format!(
                    "tool '{tool_name}' aborted unexpectedly"
                )))
            }
        }
    }

    async fn dispatch(&self, tool_name: &str, args: &Value) -> AppResult<Value> {
        let tool: ToolName = tool_name.parse()?;
        let empty = Map::new();
        let args = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(AppError::Validation("'args' must be a JSON object".into())),
        };
        if let Some(missing) = tool.missing_argument(args) {
            return Err(AppError::MissingArgument(missing.to_string()));
        }

        if tool == ToolName::ConnectToDatabase {
            return self.connect(args).await;
        }

        let id = text_arg(args, "connection_id")?;
        let record = self.registry.resolve(&id).await?;
        self.registry.touch(&id).await?;
        let connector = self.connectors.get(record.db_type)?;
        let handle = &record.handle;
        tracing::debug!(tool = %tool, connection_id = %id, db_type = %record.db_type, "Dispatching");

        match tool {
            ToolName::ConnectToDatabase => Err(AppError::Internal(
                "connect_to_database does not take a connection".into(),
            )),
            ToolName::ListDatabases => {
                let databases = connector.list_databases(handle).await?;
                Ok(json!({ "databases": databases }))
            }
            ToolName::ListTables => {
                let tables = connector.list_tables(handle).await?;
                Ok(json!({ "tables": tables }))
            }
            ToolName::GetTableStructure => {
                let table = text_arg(args, "table_name")?;
                to_value(connector.get_table_structure(handle, &table).await?)
            }
            ToolName::ExecuteQuery => {
                let query = query_arg(args)?;
                let params = params_arg(args.get("params"))?;
                tracing::debug!(connection_id = %id, query = %query, params = params.len(), "Executing query");
                let outcome = connector.execute_query(handle, &query, &params).await?;
                tracing::debug!(connection_id = %id, affected_rows = outcome.affected_rows(), "Query finished");
                to_value(outcome)
            }
            ToolName::InsertData => {
                let table = text_arg(args, "table_name")?;
                let rows = InsertRows::from_value(&args["data"])?;
                let outcome = connector.insert_data(handle, &table, &rows).await?;
                tracing::debug!(connection_id = %id, table = %table, affected_rows = outcome.affected_rows(), "Rows inserted");
                to_value(outcome)
            }
            ToolName::UpdateData => {
                let table = text_arg(args, "table_name")?;
                let data = non_empty_object(&args["data"], "data")?;
                let filter = non_empty_object(&args["where"], "where")?;
                to_value(connector.update_data(handle, &table, data, filter).await?)
            }
            ToolName::DeleteData => {
                let table = text_arg(args, "table_name")?;
                let filter = non_empty_object(&args["where"], "where")?;
                to_value(connector.delete_data(handle, &table, filter).await?)
            }
            ToolName::CloseConnection => {
                connector.close_connection(handle).await?;
                self.registry.remove(&id).await;
                tracing::info!(
                    connection_id = %id,
                    db_type = %record.db_type,
                    open_secs = (chrono::Utc::now() - record.created_at).num_seconds(),
                    "Connection closed"
                );
                Ok(json!({ "message": format!("Connection {id} closed successfully") }))
            }
        }
    }

    async fn connect(&self, args: &Map<String, Value>) -> AppResult<Value> {
        let db_type: DbType = text_arg(args, "type")?.parse()?;
        let connect_args = ConnectArgs::from_args(args)?;
        let connector = self.connectors.get(db_type)?;

        let handle = connector.connect(&connect_args).await?;
        let id = self.registry.register(db_type, handle).await;
        tracing::info!(connection_id = %id, db_type = %db_type, "Connection opened");

        Ok(json!({
            "connection_id": id,
            "type": db_type,
            "message": format!("Successfully connected to {} database", db_type.display_name()),
        }))
    }
}

fn to_value<T: Serialize>(value: T) -> AppResult<Value> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.to_string()))
}

/// A required scalar argument rendered as text.
fn text_arg(args: &Map<String, Value>, key: &str) -> AppResult<String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(_)) => Err(AppError::Validation(format!("'{key}' must not be empty"))),
        None | Some(Value::Null) => Err(AppError::MissingArgument(key.to_string())),
        Some(_) => Err(AppError::Validation(format!("'{key}' must be a string"))),
    }
}

/// Query text. A document query may also be passed as a JSON object.
fn query_arg(args: &Map<String, Value>) -> AppResult<String> {
    match args.get("query") {
        Some(Value::Object(_)) => Ok(args["query"].to_string()),
        _ => text_arg(args, "query"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::PoolSettings;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(ConnectorRegistry::new(PoolSettings::default())),
            Arc::new(ConnectionRegistry::new()),
        )
    }

    async fn call(d: &Dispatcher, tool: &str, args: Value) -> Value {
        serde_json::to_value(d.invoke(tool, &args).await).unwrap()
    }

    async fn connect_memory(d: &Dispatcher) -> String {
        let res = call(d, "connect_to_database", json!({"type": "sqlite", "database": ":memory:"})).await;
        assert_eq!(res["success"], json!(true), "{res}");
        res["connection_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_sqlite_end_to_end_scenario() {
        let d = dispatcher();
        let id = connect_memory(&d).await;

        let res = call(&d, "execute_query", json!({
            "connection_id": id,
            "query": "CREATE TABLE test_users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT UNIQUE, age INTEGER)"
        }))
        .await;
        assert_eq!(res["success"], json!(true), "{res}");

        let res = call(&d, "execute_query", json!({
            "connection_id": id,
            "query": "INSERT INTO test_users (name, email, age) VALUES ('Ana', 'ana@x.io', 30), ('Ben', 'ben@x.io', 22), ('Cy', 'cy@x.io', 41)"
        }))
        .await;
        assert_eq!(res["affected_rows"], json!(3), "{res}");
        assert!(res.get("results").is_none());

        let res = call(&d, "list_tables", json!({"connection_id": id})).await;
        assert_eq!(res["tables"], json!(["test_users"]));

        let res = call(&d, "execute_query", json!({
            "connection_id": id,
            "query": "SELECT * FROM test_users WHERE age > 25"
        }))
        .await;
        assert_eq!(res["results"].as_array().unwrap().len(), 2);
        assert_eq!(res["fields"], json!(["id", "name", "email", "age"]));

        let res = call(&d, "get_table_structure", json!({"connection_id": id, "table_name": "test_users"})).await;
        assert_eq!(res["columns"].as_array().unwrap().len(), 4);
        assert!(res["indexes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|i| i["type"] == json!("PRIMARY")));

        let res = call(&d, "close_connection", json!({"connection_id": id})).await;
        assert_eq!(res["success"], json!(true), "{res}");

        let res = call(&d, "list_tables", json!({"connection_id": id})).await;
        assert_eq!(res["success"], json!(false));
        assert_eq!(res["code"], json!("NOT_FOUND"));
        assert!(d.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_insert_update_delete_round_trip() {
        let d = dispatcher();
        let id = connect_memory(&d).await;
        call(&d, "execute_query", json!({
            "connection_id": id,
            "query": "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, qty INTEGER)"
        }))
        .await;

        let res = call(&d, "insert_data", json!({
            "connection_id": id,
            "table_name": "items",
            "data": [{"name": "bolt", "qty": 5}, {"name": "nut", "qty": 7}]
        }))
        .await;
        assert_eq!(res["affected_rows"], json!(2), "{res}");

        let res = call(&d, "update_data", json!({
            "connection_id": id,
            "table_name": "items",
            "data": {"qty": 9},
            "where": {"name": "nut"}
        }))
        .await;
        assert_eq!(res["affected_rows"], json!(1), "{res}");

        let res = call(&d, "execute_query", json!({
            "connection_id": id,
            "query": "SELECT name, qty FROM items ORDER BY id",
        }))
        .await;
        assert_eq!(res["results"], json!([{"name": "bolt", "qty": 5}, {"name": "nut", "qty": 9}]));

        let res = call(&d, "delete_data", json!({
            "connection_id": id,
            "table_name": "items",
            "where": {"name": "bolt"}
        }))
        .await;
        assert_eq!(res["affected_rows"], json!(1), "{res}");

        let res = call(&d, "execute_query", json!({
            "connection_id": id,
            "query": "SELECT COUNT(*) AS n FROM items WHERE qty = ?",
            "params": [9]
        }))
        .await;
        assert_eq!(res["results"], json!([{"n": 1}]));
    }

    #[tokio::test]
    async fn test_missing_connection_id_for_every_tool() {
        let d = dispatcher();
        for tool in ToolName::ALL.into_iter().filter(ToolName::needs_connection) {
            let res = call(&d, tool.as_str(), json!({"table_name": "t"})).await;
            assert_eq!(res["success"], json!(false));
            assert_eq!(res["code"], json!("MISSING_ARGUMENT"), "{tool}");
            assert_eq!(res["error"], json!("Missing required argument: connection_id"));
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_args() {
        let d = dispatcher();
        let res = call(&d, "drop_everything", json!({})).await;
        assert_eq!(res["code"], json!("UNKNOWN_TOOL"));

        let res = call(&d, "list_tables", json!(["conn_1"])).await;
        assert_eq!(res["code"], json!("VALIDATION_ERROR"));

        let res = call(&d, "list_tables", json!({"connection_id": "conn_nope"})).await;
        assert_eq!(res["code"], json!("NOT_FOUND"));
        assert_eq!(res["error"], json!("Connection 'conn_nope' not found"));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_type() {
        let d = dispatcher();
        let res = call(&d, "connect_to_database", json!({"type": "oracle"})).await;
        assert_eq!(res["code"], json!("UNSUPPORTED_DATABASE_TYPE"));
        assert!(d.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_connect_response_shape() {
        let d = dispatcher();
        let res = call(&d, "connect_to_database", json!({"type": "sqlite", "database": ":memory:"})).await;
        assert_eq!(res["type"], json!("sqlite"));
        assert!(res["connection_id"].as_str().unwrap().starts_with("conn_"));
        assert!(res["message"].as_str().unwrap().contains("SQLite"));
        assert_eq!(d.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_where_is_rejected() {
        let d = dispatcher();
        let id = connect_memory(&d).await;
        let res = call(&d, "delete_data", json!({
            "connection_id": id,
            "table_name": "anything",
            "where": {}
        }))
        .await;
        assert_eq!(res["code"], json!("VALIDATION_ERROR"));

        let res = call(&d, "execute_query", json!({
            "connection_id": id,
            "query": "SELECT 1",
            "params": "oops"
        }))
        .await;
        assert_eq!(res["code"], json!("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn test_query_error_keeps_connection_registered() {
        let d = dispatcher();
        let id = connect_memory(&d).await;
        let res = call(&d, "execute_query", json!({"connection_id": id, "query": "SELEC nope"})).await;
        assert_eq!(res["success"], json!(false));
        assert!(res["error"].as_str().unwrap().starts_with("SQLite: "));
        assert!(d.registry.resolve(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_call_completes_after_caller_gives_up() {
        let d = dispatcher();
        let id = connect_memory(&d).await;

        // The caller's future is dropped right after its first poll.
        let args = json!({"connection_id": id, "query": "CREATE TABLE survivors (id INTEGER)"});
        let _ = tokio::time::timeout(std::time::Duration::ZERO, d.invoke("execute_query", &args)).await;

        let mut tables = Value::Null;
        for _ in 0..50 {
            tables = call(&d, "list_tables", json!({"connection_id": id})).await["tables"].clone();
            if tables == json!(["survivors"]) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(tables, json!(["survivors"]));
    }
}

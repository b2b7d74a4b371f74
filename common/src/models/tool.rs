//! Tool catalogue models.
//!
//! Contains the fixed set of tool names, their required arguments and the
//! request body accepted by the HTTP transport.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use validator::Validate;

use crate::errors::AppError;

/// A named operation of the uniform contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ConnectToDatabase,
    ListDatabases,
    ListTables,
    GetTableStructure,
    ExecuteQuery,
    InsertData,
    UpdateData,
    DeleteData,
    CloseConnection,
}

impl ToolName {
    /// All tools, in catalogue order.
    pub const ALL: [ToolName; 9] = [
        ToolName::ConnectToDatabase,
        ToolName::ListDatabases,
        ToolName::ListTables,
        ToolName::GetTableStructure,
        ToolName::ExecuteQuery,
        ToolName::InsertData,
        ToolName::UpdateData,
        ToolName::DeleteData,
        ToolName::CloseConnection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ConnectToDatabase => "connect_to_database",
            ToolName::ListDatabases => "list_databases",
            ToolName::ListTables => "list_tables",
            ToolName::GetTableStructure => "get_table_structure",
            ToolName::ExecuteQuery => "execute_query",
            ToolName::InsertData => "insert_data",
            ToolName::UpdateData => "update_data",
            ToolName::DeleteData => "delete_data",
            ToolName::CloseConnection => "close_connection",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::ConnectToDatabase => {
                "Connect to a MySQL, PostgreSQL, SQLite, SQL Server or MongoDB database"
            }
            ToolName::ListDatabases => "List all databases visible to the connection",
            ToolName::ListTables => "List all tables or collections in the current database",
            ToolName::GetTableStructure => "Get the columns and indexes of a table",
            ToolName::ExecuteQuery => "Execute a native SQL query or MongoDB operation",
            ToolName::InsertData => "Insert one or more records into a table",
            ToolName::UpdateData => "Update records matching all given equalities",
            ToolName::DeleteData => "Delete records matching all given equalities",
            ToolName::CloseConnection => "Close a database connection",
        }
    }

    /// Arguments that must be present. `connection_id` comes first so it is
    /// reported before anything else.
    pub fn required_args(&self) -> &'static [&'static str] {
        match self {
            ToolName::ConnectToDatabase => &["type"],
            ToolName::ListDatabases | ToolName::ListTables | ToolName::CloseConnection => {
                &["connection_id"]
            }
            ToolName::GetTableStructure => &["connection_id", "table_name"],
            ToolName::ExecuteQuery => &["connection_id", "query"],
            ToolName::InsertData => &["connection_id", "table_name", "data"],
            ToolName::UpdateData => &["connection_id", "table_name", "data", "where"],
            ToolName::DeleteData => &["connection_id", "table_name", "where"],
        }
    }

    /// Whether the tool operates on an existing connection.
    pub fn needs_connection(&self) -> bool {
        !matches!(self, ToolName::ConnectToDatabase)
    }

    /// Returns the first required argument absent (or null) in `args`.
    pub fn missing_argument(&self, args: &Map<String, Value>) -> Option<&'static str> {
        self.required_args()
            .iter()
            .copied()
            .find(|key| matches!(args.get(*key), None | Some(Value::Null)))
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| AppError::UnknownTool(s.to_string()))
    }
}

/// Catalogue entry returned by `GET /mcp/tools`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub required_args: Vec<String>,
}

impl From<ToolName> for ToolDescriptor {
    fn from(tool: ToolName) -> Self {
        Self {
            name: tool.as_str().to_string(),
            description: tool.description().to_string(),
            required_args: tool.required_args().iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Request body for invoking a tool.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ToolRequest {
    /// Server name the caller addresses.
    #[validate(length(min = 1, message = "Server name is required"))]
    pub server_name: String,

    /// Tool to invoke.
    #[validate(length(min = 1, message = "Tool name is required"))]
    pub tool_name: String,

    /// Free-form tool arguments.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub args: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_tool_round_trips_through_its_name() {
        for tool in ToolName::ALL {
            assert_eq!(tool.as_str().parse::<ToolName>().unwrap(), tool);
        }
    }

    #[test]
    fn test_unknown_tool_name() {
        let err = "drop_database".parse::<ToolName>().unwrap_err();
        assert!(matches!(err, AppError::UnknownTool(_)));
    }

    #[test]
    fn test_connection_id_reported_first() {
        let args = json!({"table_name": "users"});
        let missing = ToolName::UpdateData.missing_argument(args.as_object().unwrap());
        assert_eq!(missing, Some("connection_id"));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let args = json!({"connection_id": "conn_1", "query": null});
        let missing = ToolName::ExecuteQuery.missing_argument(args.as_object().unwrap());
        assert_eq!(missing, Some("query"));
    }

    #[test]
    fn test_only_connect_skips_connection_id() {
        for tool in ToolName::ALL {
            assert_eq!(
                tool.needs_connection(),
                tool.required_args().contains(&"connection_id")
            );
        }
    }

    #[test]
    fn test_request_validation() {
        let req: ToolRequest =
            serde_json::from_value(json!({"server_name": "", "tool_name": "list_tables"})).unwrap();
        assert!(req.validate().is_err());
        assert!(req.args.is_null());
    }
}

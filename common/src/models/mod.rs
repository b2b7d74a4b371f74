//! Shared data models.

pub mod connection;
pub mod query;
pub mod schema;
pub mod tool;

// Re-export commonly used types
pub use connection::{ConnectArgs, DbType};
pub use query::{InsertRows, QueryOutcome, Record, RowSet, WriteSummary};
pub use schema::{ColumnInfo, IndexInfo, IndexKind, TableStructure};
pub use tool::{ToolDescriptor, ToolName, ToolRequest};

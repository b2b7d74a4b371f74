//! Application error types.
//!
//! Every failure a tool invocation can produce maps to exactly one variant.
//! Connectors wrap driver errors into these variants with a dialect prefix,
//! and the dispatcher turns them into `{success: false, error}` envelopes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::response::ToolEnvelope;

/// Result alias used across the workspace.
pub type AppResult<T> = Result<T, AppError>;

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum AppError {
    /// Opening or closing a backend connection failed.
    #[error("{0}")]
    DatabaseConnection(String),

    /// No connection is registered under the given id.
    #[error("Connection '{0}' not found")]
    ConnectionNotFound(String),

    /// The tool name does not map to any operation.
    #[error("Tool '{0}' not found")]
    UnknownTool(String),

    /// A required argument was absent.
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// Caller supplied malformed or insufficient arguments.
    #[error("{0}")]
    Validation(String),

    /// The backend rejected a query or mutation.
    #[error("{0}")]
    DatabaseQuery(String),

    /// The document backend was given an action it does not know.
    #[error("{0}")]
    UnsupportedOperation(String),

    /// The document query is not valid structured input.
    #[error("{0}")]
    MalformedQuery(String),

    /// The requested backend type is not supported.
    #[error("Database type '{0}' is not supported")]
    UnsupportedDatabaseType(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::DatabaseConnection(_) => "CONNECTION_ERROR",
            AppError::ConnectionNotFound(_) => "NOT_FOUND",
            AppError::UnknownTool(_) => "UNKNOWN_TOOL",
            AppError::MissingArgument(_) => "MISSING_ARGUMENT",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::DatabaseQuery(_) => "QUERY_ERROR",
            AppError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            AppError::MalformedQuery(_) => "MALFORMED_QUERY",
            AppError::UnsupportedDatabaseType(_) => "UNSUPPORTED_DATABASE_TYPE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status used when the error escapes to the transport layer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ConnectionNotFound(_) | AppError::UnknownTool(_) => StatusCode::NOT_FOUND,
            AppError::MissingArgument(_)
            | AppError::Validation(_)
            | AppError::UnsupportedOperation(_)
            | AppError::MalformedQuery(_)
            | AppError::UnsupportedDatabaseType(_) => StatusCode::BAD_REQUEST,
            AppError::DatabaseConnection(_) => StatusCode::BAD_GATEWAY,
            AppError::DatabaseQuery(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ToolEnvelope::failure(&self))).into_response()
    }
}

//! 网关路由模块

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{health_check, index, invoke_tool, list_tools};
use crate::state::AppState;

/// 创建网关路由
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/mcp/tools", get(list_tools))
        .route("/mcp/tool", post(invoke_tool))
        .route("/api/health", get(health_check))
}

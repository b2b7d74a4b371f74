//! Handler模块

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use validator::Validate;

use common::errors::AppError;
use common::models::{ToolDescriptor, ToolName, ToolRequest};
use common::response::ToolEnvelope;

use crate::state::AppState;

/// 服务信息
#[utoipa::path(
    get,
    path = "/",
    tag = "gateway",
    responses(
        (status = 200, description = "服务信息", body = ServiceInfo)
    )
)]
pub async fn index(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: state.config.server_name.clone(),
        description: "Unified tool gateway for MySQL, PostgreSQL, SQLite, SQL Server and MongoDB"
            .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
    })
}

/// 列出全部工具
#[utoipa::path(
    get,
    path = "/mcp/tools",
    tag = "tools",
    responses(
        (status = 200, description = "工具列表", body = ToolList)
    )
)]
pub async fn list_tools() -> Json<ToolList> {
    Json(ToolList {
        tools: ToolName::ALL.into_iter().map(ToolDescriptor::from).collect(),
    })
}

/// 调用工具
#[utoipa::path(
    post,
    path = "/mcp/tool",
    tag = "tools",
    request_body = ToolRequest,
    responses(
        (status = 200, description = "工具调用结果", body = ToolEnvelope),
        (status = 400, description = "请求无效或服务器名称不匹配", body = ToolEnvelope)
    )
)]
pub async fn invoke_tool(
    State(state): State<AppState>,
    payload: Result<Json<ToolRequest>, JsonRejection>,
) -> Result<Json<ToolEnvelope>, AppError> {
    let Json(req) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    if req.server_name != state.config.server_name {
        return Err(AppError::Validation(format!(
            "Server '{}' not found",
            req.server_name
        )));
    }

    Ok(Json(state.dispatcher.invoke(&req.tool_name, &req.args).await))
}

/// 健康检查端点
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses(
        (status = 200, description = "服务运行正常", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        connections: state.registry.len().await,
    })
}

/// 服务信息
#[derive(Serialize, ToSchema)]
pub struct ServiceInfo {
    /// 服务器名称
    pub name: String,
    /// 服务描述
    pub description: String,
    /// 服务版本
    pub version: String,
    /// 运行状态
    pub status: String,
}

/// 工具列表
#[derive(Serialize, ToSchema)]
pub struct ToolList {
    pub tools: Vec<ToolDescriptor>,
}

/// 健康检查响应
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// 服务状态
    pub status: String,
    /// 服务名称
    pub service: String,
    /// 服务版本
    pub version: String,
    /// 当前时间戳
    pub timestamp: DateTime<Utc>,
    /// 打开的连接数
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use common::config::AppConfig;

    use crate::routes;
    use crate::state::AppState;

    fn app() -> (Router, AppState) {
        let state = AppState::new(AppConfig::default());
        (routes::router().with_state(state.clone()), state)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_index_reports_running() {
        let (app, _) = app();
        let (status, body) = send(&app, Method::GET, "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("running"));
        assert_eq!(body["name"], json!("database-viewer"));
    }

    #[tokio::test]
    async fn test_lists_nine_tools() {
        let (app, _) = app();
        let (_, body) = send(&app, Method::GET, "/mcp/tools", None).await;
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 9);
        assert_eq!(tools[0]["name"], json!("connect_to_database"));
        assert!(tools.iter().all(|t| t["description"].is_string()));
    }

    #[tokio::test]
    async fn test_wrong_server_name_is_rejected() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/mcp/tool",
            Some(json!({"server_name": "other", "tool_name": "list_tables", "args": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("other"));
    }

    #[tokio::test]
    async fn test_tool_failures_still_answer_ok() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/mcp/tool",
            Some(json!({"server_name": "database-viewer", "tool_name": "list_tables", "args": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("MISSING_ARGUMENT"));
    }

    #[tokio::test]
    async fn test_connect_over_http_is_counted_by_health() {
        let (app, state) = app();
        let (status, body) = send(
            &app,
            Method::POST,
            "/mcp/tool",
            Some(json!({
                "server_name": "database-viewer",
                "tool_name": "connect_to_database",
                "args": {"type": "sqlite", "database": ":memory:"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true), "{body}");

        let (_, health) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(health["status"], json!("healthy"));
        assert_eq!(health["connections"], json!(1));

        state.registry.close_all(&state.connectors).await;
    }

    #[tokio::test]
    async fn test_malformed_body_keeps_envelope_shape() {
        let (app, _) = app();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/mcp/tool")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"server_name\": "))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));
    }
}

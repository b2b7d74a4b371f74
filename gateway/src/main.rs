//! 多数据库网关服务
//!
//! 通过统一的工具调用接口访问多种数据库：
//! - 连接管理（连接、关闭、空闲回收）
//! - 元数据浏览（数据库、表、表结构）
//! - 查询执行与数据增删改

mod connectors;
mod dispatcher;
mod handlers;
mod registry;
mod routes;
mod state;

use anyhow::Context;
use axum::{middleware, routing::get, Json, Router};
use common::config::AppConfig;
use common::middleware::request_id::request_id_middleware;
use state::AppState;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

const SERVICE_NAME: &str = "gateway";

#[derive(OpenApi)]
#[openapi(
    info(
        title = "多数据库网关 API",
        version = "0.1.0",
        description = "MySQL / PostgreSQL / SQLite / SQL Server / MongoDB 统一工具调用网关"
    ),
    paths(
        handlers::index,
        handlers::list_tools,
        handlers::invoke_tool,
        handlers::health_check,
    ),
    components(schemas(
        common::models::ToolRequest,
        common::models::ToolDescriptor,
        common::models::ToolName,
        common::models::DbType,
        common::models::TableStructure,
        common::models::ColumnInfo,
        common::models::IndexInfo,
        common::models::IndexKind,
        common::response::ToolEnvelope,
        handlers::ServiceInfo,
        handlers::ToolList,
        handlers::HealthResponse,
    )),
    tags(
        (name = "gateway", description = "网关端点"),
        (name = "tools", description = "工具调用端点"),
        (name = "health", description = "健康检查端点")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    let config = AppConfig::load_with_service(SERVICE_NAME);

    // 初始化日志追踪
    common::logging::init(&config.log_format);

    // 创建应用状态
    let state = AppState::new(config.clone());

    // 空闲连接回收
    let reaper = registry::spawn_reaper(
        state.registry.clone(),
        state.connectors.clone(),
        config.idle_timeout(),
        config.reap_interval(),
    );

    // 创建路由
    let app = create_router(state.clone());

    // 启动服务
    let addr = format!("{}:{}", config.host, config.port);
    info!(service = SERVICE_NAME, address = %addr, server_name = %config.server_name, "启动数据库网关");

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务运行失败")?;

    // 关闭剩余连接
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    if !state.registry.is_empty().await {
        state.registry.close_all(&state.connectors).await;
    }
    info!(service = SERVICE_NAME, "服务已停止");
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::router())
        .route("/api-docs/openapi.json", get(openapi_json))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "无法监听 Ctrl-C 信号");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "无法监听 SIGTERM 信号");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("收到停止信号，开始优雅关闭");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_openapi_document_lists_tool_endpoint() {
        let app = create_router(AppState::new(AppConfig::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api-docs/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(doc["paths"]["/mcp/tool"]["post"].is_object());
    }
}

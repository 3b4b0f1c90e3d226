use anyhow::{Context, Result};
use axum::{http::HeaderValue, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::info;
use tubetube_rust::{config::AppConfig, logging, server::websocket, AppState};

/// 根据配置构建 CORS 层
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// 等待退出信号
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
    }
    info!("收到退出信号，开始关闭...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load_or_default("config/app.toml").await;
    let _log_guard = logging::init_logging(&config.log);

    // 存储初始化失败直接退出，注册表填充完成之前不接受任何动作
    let state = AppState::new(config).await?;

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(build_cors_layer(&state.config.server.cors_origins));

    let app = Router::new()
        .route("/ws", get(websocket::handle_websocket))
        .fallback_service(ServeDir::new("static").append_index_html_on_directories(true))
        .layer(middleware)
        .with_state(state.clone());

    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听 {} 失败", addr))?;
    info!("TubeTube 后端已启动: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务器运行失败")?;

    // 退出前保存最终快照并关闭数据库
    state.dispatcher.shutdown().await;
    state.store.close();
    info!("服务已退出");

    Ok(())
}

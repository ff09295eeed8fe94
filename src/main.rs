use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sql_gateway::config::Config;
use sql_gateway::handlers;
use sql_gateway::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("sql-gateway.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("sql-gateway starting up");
    tracing::info!(environments = ?config.database.environments().collect::<Vec<_>>(), "configuration loaded");

    let app_state = Arc::new(AppState::new(config.clone()));

    let tool_routes = Router::new()
        .route("/tools/review_sql_script", post(handlers::review_sql_script))
        .route("/tools/query_readonly", post(handlers::query_readonly))
        .route("/tools/schema_summary", post(handlers::schema_summary))
        .route("/tools/explain", post(handlers::explain))
        .with_state(Arc::clone(&app_state));

    let health_routes = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .with_state(Arc::clone(&app_state));

    let app = Router::new()
        .merge(tool_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

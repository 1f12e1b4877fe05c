//! # Response Cache - Demo Server
//!
//! Runs a small item API behind the response cache:
//!
//! - `GET /items/:id` is cached in group `items`
//! - `POST /items/:id` stores a new value and invalidates group `items`
//!
//! The cache namespace is taken from the `x-user-id` header; requests without it are
//! served uncached. Configuration is read from `RESPONSE_CACHE_CONFIG` (default
//! `config/response-cache.yaml`) and falls back to defaults when the file is absent.

use axum::extract::{Path, State};
use axum::handler::Handler;
use axum::http::{HeaderName, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use response_cache::caching::{
    build_store, cache_response, invalidate_groups, namespace_from_header, CacheMiddleware,
    CacheRoute, InvalidateRoute,
};
use response_cache::observability::{init_logging, install_prometheus_exporter};
use response_cache::{ServiceConfig, ServiceResult};

const DEFAULT_CONFIG_PATH: &str = "config/response-cache.yaml";
const NAMESPACE_HEADER: &str = "x-user-id";

type Items = Arc<DashMap<String, String>>;

#[tokio::main]
async fn main() -> ServiceResult<()> {
    let config_path =
        std::env::var("RESPONSE_CACHE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = ServiceConfig::load_or_default(&config_path).await?;

    init_logging(&config.logging)?;
    info!(config = %config_path, "🚀 Starting response cache demo");

    if let Some(address) = &config.metrics_address {
        install_prometheus_exporter(address)?;
        info!(address = %address, "📊 Prometheus exporter listening");
    }

    let store = build_store(&config.store).await?;
    let middleware = Arc::new(CacheMiddleware::new(store));
    let app = build_router(middleware.clone(), &config);

    let listener = TcpListener::bind(config.server.bind_address.as_str()).await?;
    info!(address = %config.server.bind_address, "🌐 Listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    middleware.shutdown().await;
    info!("✅ Write-back pipeline flushed, shutdown complete");

    served.map_err(Into::into)
}

fn build_router(middleware: Arc<CacheMiddleware>, config: &ServiceConfig) -> Router {
    let cached = CacheRoute::new(middleware.clone(), Arc::new(config.cache.clone()), "items");
    let invalidate = InvalidateRoute::new(middleware, ["items"]);
    let items: Items = Arc::new(DashMap::new());

    Router::new()
        .route(
            "/items/:id",
            get(show_item.layer(from_fn_with_state(cached, cache_response)))
                .post(update_item.layer(from_fn_with_state(invalidate, invalidate_groups))),
        )
        .layer(from_fn_with_state(
            HeaderName::from_static(NAMESPACE_HEADER),
            namespace_from_header,
        ))
        .with_state(items)
}

async fn show_item(State(items): State<Items>, Path(id): Path<String>) -> Response {
    match items.get(&id) {
        Some(value) => Json(json!({ "id": id, "value": value.value() })).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "item not found" }))).into_response(),
    }
}

async fn update_item(
    State(items): State<Items>,
    Path(id): Path<String>,
    value: String,
) -> StatusCode {
    items.insert(id, value);
    StatusCode::OK
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("📡 Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
    }
}

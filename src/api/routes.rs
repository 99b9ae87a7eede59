//! API route definitions

use crate::config::ServiceConfig;
use crate::pool::ModelPool;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: ModelPool,
    pub config: Arc<ServiceConfig>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/tier", get(handlers::tier))
        // Pool
        .route(
            "/pool",
            get(handlers::pool_status)
                .post(handlers::load_primary)
                .delete(handlers::clear_pool),
        )
        .route("/pool/{key}", post(handlers::load_key))
        // Cache diagnostics; model ids contain a slash
        .route("/cache/{*model_id}", get(handlers::cache_status))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

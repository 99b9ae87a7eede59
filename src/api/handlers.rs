//! API request handlers

use super::models::{
    CacheStatus, HandleInfo, HealthResponse, LoadParams, LocationReport, PoolStatus, TierResponse,
};
use super::routes::AppState;
use crate::error::ApiError;
use crate::models::cache::{get_cache_size, model_location};
use crate::models::registry::{descriptor, reranker_model};
use crate::models::split::resolve_split;
use crate::models::validator::validate;
use crate::pool::ClearReport;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// GET /health - Service health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /tier - Detected hardware tier
pub async fn tier(State(state): State<AppState>) -> Json<TierResponse> {
    let tier = state.pool.detector().detect_tier().clone();
    let reranker_model = tier.reranker_variant.and_then(reranker_model);
    Json(TierResponse {
        tier,
        reranker_model,
    })
}

/// GET /pool - Routing table and loaded handles
pub async fn pool_status(State(state): State<AppState>) -> Json<PoolStatus> {
    let handles = state
        .pool
        .loaded()
        .await
        .iter()
        .map(|h| HandleInfo::from(h.as_ref()))
        .collect();
    Json(PoolStatus::new(state.pool.pool_config(), handles))
}

/// POST /pool - Load the primary key
pub async fn load_primary(
    State(state): State<AppState>,
    Query(params): Query<LoadParams>,
) -> Result<Json<HandleInfo>, ApiError> {
    let handle = state.pool.get(None, params.model.as_deref()).await?;
    Ok(Json(HandleInfo::from(handle.as_ref())))
}

/// POST /pool/{key} - Load a routing key, optionally with an explicit model
pub async fn load_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<LoadParams>,
) -> Result<Json<HandleInfo>, ApiError> {
    let handle = state.pool.get(Some(&key), params.model.as_deref()).await?;
    Ok(Json(HandleInfo::from(handle.as_ref())))
}

/// DELETE /pool - Release every handle
pub async fn clear_pool(State(state): State<AppState>) -> Json<ClearReport> {
    Json(state.pool.clear_all().await)
}

/// GET /cache/{model_id} - Validate a model's cache in both roots
pub async fn cache_status(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<CacheStatus>, ApiError> {
    let model_id = model_id.trim_matches('/').to_string();
    if model_id.is_empty() {
        return Err(ApiError::BadRequest("model id is required".to_string()));
    }

    let roots = state.config.cache_roots();
    let status = tokio::task::spawn_blocking(move || {
        let custom = model_location(&roots.custom, &model_id);
        let default = model_location(&roots.default, &model_id);

        let split = descriptor(&model_id)
            .filter(|d| d.trust_remote_code)
            .map(|d| resolve_split(d, &custom, &default));

        CacheStatus {
            custom: LocationReport::new(
                custom.clone(),
                validate(&custom),
                get_cache_size(&roots.custom, &model_id),
            ),
            default: LocationReport::new(
                default.clone(),
                validate(&default),
                get_cache_size(&roots.default, &model_id),
            ),
            split,
            model: model_id,
        }
    })
    .await
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("cache inspection failed: {e}")))?;

    Ok(Json(status))
}

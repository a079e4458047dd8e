//! Cache administration endpoints.

use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use tracing::info;

use checker_core::cache::CacheStats;

use crate::AppState;

/// POST /cache/flush
pub async fn flush_cache(State(state): State<Arc<AppState>>) -> &'static str {
    state.cache.flush().await;
    info!("cache flushed by request");
    "Cache successfully flushed"
}

/// GET /cache/status
pub async fn cache_status(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

//! HTTP route assembly.
//!
//! - `tasks`: batch submission, status and paginated results
//! - `cache`: cache flush and statistics
//! - `keys`: admin CRUD over API keys
//! - `health`: liveness and metrics exposition

pub mod cache;
pub mod health;
pub mod keys;
pub mod tasks;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::middleware::{admin_middleware, api_key_middleware};
use crate::AppState;

/// Build all API routes with their middleware layers.
pub fn build_routes(state: Arc<AppState>) -> Router {
    let user_routes = Router::new()
        .route("/tasks", post(tasks::create_task))
        .route("/tasks/{id}", get(tasks::task_status))
        .route("/tasks-results/{id}", get(tasks::task_results))
        .route("/tasks-with-webhook", post(tasks::create_task_with_webhook))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ));

    let admin_routes = Router::new()
        .route("/keys", post(keys::create_key))
        .route("/admin/keys", get(keys::list_keys))
        .route(
            "/admin/keys/{api_key}",
            get(keys::get_key)
                .patch(keys::update_key)
                .delete(keys::delete_key),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_middleware,
        ));

    Router::new()
        .merge(user_routes)
        .merge(admin_routes)
        .route("/cache/flush", post(cache::flush_cache))
        .route("/cache/status", get(cache::cache_status))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(health::metrics_handler))
        .with_state(state)
}

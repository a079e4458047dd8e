//! Liveness and metrics endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: std::time::SystemTime,
}

/// GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: std::time::SystemTime::now(),
    })
}

/// GET /metrics
///
/// Prometheus text exposition rendered from the engine counters and the
/// cache statistics.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    let snap = state.metrics.snapshot();
    let cache = state.cache.stats().await;

    let metrics = format!(
        "# HELP email_checker_tasks_processed_total Tasks completed by this node\n\
         # TYPE email_checker_tasks_processed_total counter\n\
         email_checker_tasks_processed_total {}\n\
         \n\
         # HELP email_checker_tasks_failed_total Tasks that failed processing\n\
         # TYPE email_checker_tasks_failed_total counter\n\
         email_checker_tasks_failed_total {}\n\
         \n\
         # HELP email_checker_emails_checked_total Emails run through the pipeline\n\
         # TYPE email_checker_emails_checked_total counter\n\
         email_checker_emails_checked_total {}\n\
         \n\
         # HELP email_checker_throttled_domains_total Domains throttled after exhausted MX attempts\n\
         # TYPE email_checker_throttled_domains_total counter\n\
         email_checker_throttled_domains_total {}\n\
         \n\
         # HELP email_checker_rbl_restrictions_total Probes rejected by RBL restrictions\n\
         # TYPE email_checker_rbl_restrictions_total counter\n\
         email_checker_rbl_restrictions_total {}\n\
         \n\
         # HELP email_checker_temporary_errors_total Temporary SMTP errors observed\n\
         # TYPE email_checker_temporary_errors_total counter\n\
         email_checker_temporary_errors_total {}\n\
         \n\
         # HELP email_checker_webhook_attempts_total Webhook delivery attempts\n\
         # TYPE email_checker_webhook_attempts_total counter\n\
         email_checker_webhook_attempts_total {}\n\
         \n\
         # HELP email_checker_webhook_failures_total Webhook delivery failures\n\
         # TYPE email_checker_webhook_failures_total counter\n\
         email_checker_webhook_failures_total {}\n\
         \n\
         # HELP email_checker_cache_items Current cache entries\n\
         # TYPE email_checker_cache_items gauge\n\
         email_checker_cache_items {}\n\
         \n\
         # HELP email_checker_cache_hits_total Cache hits\n\
         # TYPE email_checker_cache_hits_total counter\n\
         email_checker_cache_hits_total {}\n\
         \n\
         # HELP email_checker_cache_misses_total Cache misses\n\
         # TYPE email_checker_cache_misses_total counter\n\
         email_checker_cache_misses_total {}\n\
         \n\
         # HELP email_checker_build_info Build information\n\
         # TYPE email_checker_build_info gauge\n\
         email_checker_build_info{{version=\"{}\"}} 1\n",
        snap.tasks_processed,
        snap.tasks_failed,
        snap.emails_checked,
        snap.throttled_domains,
        snap.rbl_restrictions,
        snap.temporary_errors,
        snap.webhook_attempts,
        snap.webhook_failures,
        cache.items,
        cache.hits,
        cache.misses,
        env!("CARGO_PKG_VERSION"),
    );

    (StatusCode::OK, metrics)
}

//! Shared application state.

use sqlx::PgPool;
use std::sync::Arc;

use checker_core::auth::AuthService;
use checker_core::cache::CacheProvider;
use checker_core::metrics::Metrics;
use checker_core::storage::TaskStore;

use crate::config::AppConfig;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn TaskStore>,
    pub cache: Arc<dyn CacheProvider>,
    /// Present only when a database is configured; gates authentication.
    pub auth: Option<Arc<AuthService>>,
    pub db: Option<PgPool>,
    pub metrics: Arc<Metrics>,
}

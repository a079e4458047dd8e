//! Request authentication middleware.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::AppState;

/// Validate the `X-API-Key` header and stash the resolved key in request
/// extensions. When no database is configured the service runs
/// unauthenticated and requests pass through without a key.
pub async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(auth) = &state.auth else {
        return Ok(next.run(req).await);
    };

    let api_key = req
        .headers()
        .get("X-API-Key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if api_key.is_empty() {
        return Err(ApiError::Unauthorized("API key required".into()));
    }

    let key = auth.validate_key(&api_key).await?;
    debug!(remaining = key.remaining_checks, "api key accepted");
    req.extensions_mut().insert(key);

    Ok(next.run(req).await)
}

/// Gate admin endpoints on the `X-Admin-Key` header.
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let admin_key = &state.config.security.admin_key;
    let provided = req
        .headers()
        .get("X-Admin-Key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if admin_key.is_empty() || provided != admin_key {
        return Err(ApiError::Forbidden("Admin access required".into()));
    }

    Ok(next.run(req).await)
}

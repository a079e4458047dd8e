//! Admin CRUD over API keys.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Months, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};

use checker_core::KeyType;

use crate::error::ApiError;
use crate::AppState;

fn require_db(state: &AppState) -> Result<&PgPool, ApiError> {
    state
        .db
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("database not configured".into()))
}

/// Cryptographically random 256-bit key, URL-safe base64 encoded.
fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub initial_checks: i64,
}

/// POST /keys
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = require_db(&state)?;
    if request.initial_checks <= 0 {
        return Err(ApiError::bad_request("initial_checks must be positive"));
    }

    let api_key = generate_api_key();
    let expires_at = match request.key_type {
        KeyType::PayAsYouGo => Utc::now() + Months::new(24),
        KeyType::Monthly => Utc::now() + Months::new(1),
    };

    sqlx::query(
        r#"
        INSERT INTO api_keys (api_key, key_type, initial_checks, used_checks,
                              remaining_checks, created_at, expires_at)
        VALUES ($1, $2, $3, 0, $3, NOW(), $4)
        "#,
    )
    .bind(&api_key)
    .bind(request.key_type.as_str())
    .bind(request.initial_checks)
    .bind(expires_at)
    .execute(db)
    .await
    .map_err(|err| {
        error!(%err, "key creation failed");
        ApiError::internal("Failed to create key")
    })?;

    info!(key_type = request.key_type.as_str(), "api key created");
    Ok(Json(json!({
        "api_key": api_key,
        "expires_at": expires_at.to_rfc3339(),
        "key_type": request.key_type.as_str(),
        "remaining": request.initial_checks,
    })))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct KeySummary {
    pub api_key: String,
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(rename = "remaining")]
    pub remaining_checks: i64,
    #[serde(rename = "initial")]
    pub initial_checks: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// GET /admin/keys
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<KeySummary>>, ApiError> {
    let db = require_db(&state)?;
    let keys = sqlx::query_as::<_, KeySummary>(
        r#"
        SELECT api_key, key_type, remaining_checks,
               initial_checks, created_at, expires_at
        FROM api_keys
        ORDER BY created_at
        "#,
    )
    .fetch_all(db)
    .await
    .map_err(|_| ApiError::internal("Failed to retrieve keys"))?;

    Ok(Json(keys))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct KeyDetails {
    pub api_key: String,
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(rename = "remaining")]
    pub remaining_checks: i64,
    #[serde(rename = "used")]
    pub used_checks: i64,
    #[serde(rename = "initial")]
    pub initial_checks: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_topup: Option<DateTime<Utc>>,
}

/// GET /admin/keys/{api_key}
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(api_key): Path<String>,
) -> Result<Json<KeyDetails>, ApiError> {
    let db = require_db(&state)?;
    let details = sqlx::query_as::<_, KeyDetails>(
        r#"
        SELECT api_key, key_type, remaining_checks, used_checks,
               initial_checks, created_at, expires_at, last_topup
        FROM api_keys
        WHERE api_key = $1
        "#,
    )
    .bind(&api_key)
    .fetch_optional(db)
    .await
    .map_err(|_| ApiError::internal("Failed to retrieve key"))?
    .ok_or_else(|| ApiError::NotFound("API key not found".into()))?;

    Ok(Json(details))
}

#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    #[serde(default)]
    pub add_checks: i64,
}

/// PATCH /admin/keys/{api_key}
///
/// Tops up the quota and extends expiry according to the key type.
pub async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(api_key): Path<String>,
    Json(request): Json<UpdateKeyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = require_db(&state)?;
    if request.add_checks < 0 {
        return Err(ApiError::bad_request("add_checks must not be negative"));
    }

    let result = sqlx::query(
        r#"
        UPDATE api_keys
        SET remaining_checks = remaining_checks + $1,
            initial_checks = initial_checks + $1,
            expires_at = CASE
                WHEN key_type = 'pay_as_you_go' THEN
                    GREATEST(expires_at, NOW()) + INTERVAL '24 MONTH'
                ELSE
                    expires_at + INTERVAL '1 MONTH'
            END,
            last_topup = NOW()
        WHERE api_key = $2
        "#,
    )
    .bind(request.add_checks)
    .bind(&api_key)
    .execute(db)
    .await
    .map_err(|_| ApiError::internal("Update failed"))?;

    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("API key not found".into()));
    }

    info!(add_checks = request.add_checks, "api key topped up");
    Ok(Json(json!({ "status": "updated" })))
}

/// DELETE /admin/keys/{api_key}
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(api_key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let db = require_db(&state)?;
    sqlx::query("DELETE FROM api_keys WHERE api_key = $1")
        .bind(&api_key)
        .execute(db)
        .await
        .map_err(|_| ApiError::internal("Deletion failed"))?;

    if let Some(auth) = &state.auth {
        auth.invalidate_cached_key(&api_key).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct_and_decodable() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert_eq!(URL_SAFE.decode(&a).unwrap().len(), 32);
    }
}

//! API-key validation and quota accounting.
//!
//! Key lookups go through a short-lived cache entry in the shared store
//! before hitting the database. Quota decrements run inside a database
//! transaction in standalone mode; in cluster mode a per-key lock plus an
//! atomic script keep the cached counter consistent while the database
//! remains authoritative.

use chrono::Utc;
use redis::AsyncCommands;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::lock::DistributedLock;
use crate::{ApiKey, CheckerError, KeyType, KvClient, Result};

/// TTL for cached key entries.
const KEY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL of the per-key decrement lock.
const DECREMENT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Check-and-decrement on the cached hash; fails when the cached counter
/// cannot cover the requested amount.
const DECREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local count = tonumber(ARGV[1])
local remaining = tonumber(redis.call('HGET', key, 'remaining'))

if not remaining or remaining < count then
    return redis.error_reply('not enough quota')
end

redis.call('HINCRBY', key, 'used_checks', count)
redis.call('HINCRBY', key, 'remaining', -count)
redis.call('EXPIRE', key, ARGV[2])
return remaining - count
"#;

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    api_key: String,
    key_type: String,
    initial_checks: i64,
    used_checks: i64,
    remaining_checks: i64,
    created_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
    last_topup: Option<chrono::DateTime<Utc>>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        let key_type = match row.key_type.as_str() {
            "monthly" => KeyType::Monthly,
            _ => KeyType::PayAsYouGo,
        };
        Self {
            key: row.api_key,
            key_type,
            initial_checks: row.initial_checks,
            used_checks: row.used_checks,
            remaining_checks: row.remaining_checks,
            created_at: row.created_at,
            expires_at: row.expires_at,
            last_topup: row.last_topup,
        }
    }
}

pub struct AuthService {
    db: PgPool,
    kv: Option<KvClient>,
    cluster_mode: bool,
}

impl AuthService {
    pub fn new(db: PgPool, kv: Option<KvClient>, cluster_mode: bool) -> Self {
        Self {
            db,
            kv,
            cluster_mode,
        }
    }

    /// Validate a key and return its current accounting. Rejects unknown,
    /// expired and exhausted keys.
    pub async fn validate_key(&self, api_key: &str) -> Result<ApiKey> {
        if let Some(cached) = self.get_from_cache(api_key).await {
            self.check_state(&cached)?;
            return Ok(cached);
        }

        let key = self.get_from_db(api_key).await?;
        self.check_state(&key)?;

        if let Err(err) = self.cache_key(&key).await {
            warn!(%err, "failed to cache api key");
        }
        Ok(key)
    }

    fn check_state(&self, key: &ApiKey) -> Result<()> {
        if Utc::now() > key.expires_at {
            return Err(CheckerError::KeyExpired);
        }
        if key.remaining_checks <= 0 {
            return Err(CheckerError::QuotaExhausted);
        }
        Ok(())
    }

    /// Consume `count` checks from the key's quota.
    pub async fn decrement(&self, api_key: &str, count: i64) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }
        if self.cluster_mode {
            self.decrement_with_lock(api_key, count).await
        } else {
            self.decrement_in_transaction(api_key, count).await
        }
    }

    async fn decrement_in_transaction(&self, api_key: &str, count: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let new_remaining: i64 = sqlx::query_scalar(
            r#"
            UPDATE api_keys
            SET used_checks = used_checks + $1,
                remaining_checks = remaining_checks - $1
            WHERE api_key = $2
            RETURNING remaining_checks
            "#,
        )
        .bind(count)
        .bind(api_key)
        .fetch_one(&mut *tx)
        .await?;

        if new_remaining < 0 {
            tx.rollback().await?;
            return Err(CheckerError::QuotaExhausted);
        }
        tx.commit().await?;

        // Refresh the cache with the committed state.
        if let Ok(key) = self.get_from_db(api_key).await {
            if let Err(err) = self.cache_key(&key).await {
                warn!(%err, "failed to refresh cached api key");
            }
        }
        debug!(%api_key, count, new_remaining, "quota decremented");
        Ok(())
    }

    async fn decrement_with_lock(&self, api_key: &str, count: i64) -> Result<()> {
        let lock = DistributedLock::new(
            self.kv.clone(),
            format!("lock:apikey:{api_key}"),
            DECREMENT_LOCK_TTL,
        );
        if !lock.acquire().await {
            return Err(CheckerError::LockUnavailable(format!("apikey:{api_key}")));
        }

        let result = self.decrement_locked(api_key, count).await;
        lock.release().await;
        result
    }

    async fn decrement_locked(&self, api_key: &str, count: i64) -> Result<()> {
        if let Some(kv) = &self.kv {
            let mut conn = kv.clone();
            let script = redis::Script::new(DECREMENT_SCRIPT);
            let invoked = script
                .key(format!("apikey:{api_key}"))
                .arg(count)
                .arg(KEY_CACHE_TTL.as_secs())
                .invoke_async::<i64>(&mut conn)
                .await;
            if let Err(err) = invoked {
                // An absent hash is repopulated from the database below;
                // an exhausted counter is final.
                if err.to_string().contains("not enough quota") {
                    return Err(CheckerError::QuotaExhausted);
                }
                warn!(%err, "cached quota decrement failed");
            }
        }

        // The database remains the source of truth.
        sqlx::query(
            r#"
            UPDATE api_keys
            SET used_checks = used_checks + $1,
                remaining_checks = remaining_checks - $1
            WHERE api_key = $2
            "#,
        )
        .bind(count)
        .bind(api_key)
        .execute(&self.db)
        .await?;

        if let Ok(key) = self.get_from_db(api_key).await {
            if let Err(err) = self.cache_key(&key).await {
                warn!(%err, "failed to refresh cached api key");
            }
        }
        Ok(())
    }

    async fn get_from_cache(&self, api_key: &str) -> Option<ApiKey> {
        let kv = self.kv.as_ref()?;
        let mut conn = kv.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(format!("apikey:{api_key}")).await.ok()?;
        if fields.is_empty() {
            return None;
        }

        let parse_i64 = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());
        let expires_at = fields
            .get("expires_at")
            .and_then(|v| v.parse::<chrono::DateTime<Utc>>().ok())?;
        let created_at = fields
            .get("created_at")
            .and_then(|v| v.parse::<chrono::DateTime<Utc>>().ok())
            .unwrap_or(expires_at);
        let key_type = match fields.get("type").map(String::as_str) {
            Some("monthly") => KeyType::Monthly,
            _ => KeyType::PayAsYouGo,
        };

        Some(ApiKey {
            key: api_key.to_string(),
            key_type,
            initial_checks: parse_i64("initial_checks")?,
            used_checks: parse_i64("used_checks")?,
            remaining_checks: parse_i64("remaining")?,
            created_at,
            expires_at,
            last_topup: None,
        })
    }

    async fn cache_key(&self, key: &ApiKey) -> Result<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let mut conn = kv.clone();
        let cache_key = format!("apikey:{}", key.key);
        let fields = [
            ("type", key.key_type.as_str().to_string()),
            ("initial_checks", key.initial_checks.to_string()),
            ("used_checks", key.used_checks.to_string()),
            ("remaining", key.remaining_checks.to_string()),
            ("created_at", key.created_at.to_rfc3339()),
            ("expires_at", key.expires_at.to_rfc3339()),
        ];
        conn.hset_multiple::<_, _, _, ()>(&cache_key, &fields).await?;
        conn.expire::<_, ()>(&cache_key, KEY_CACHE_TTL.as_secs() as i64)
            .await?;
        Ok(())
    }

    /// Drop the cached entry, e.g. after an admin mutation.
    pub async fn invalidate_cached_key(&self, api_key: &str) {
        if let Some(kv) = &self.kv {
            let mut conn = kv.clone();
            let _ = conn.del::<_, ()>(format!("apikey:{api_key}")).await;
        }
    }

    async fn get_from_db(&self, api_key: &str) -> Result<ApiKey> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT api_key, key_type, initial_checks, used_checks,
                   remaining_checks, created_at, expires_at, last_topup
            FROM api_keys
            WHERE api_key = $1
            "#,
        )
        .bind(api_key)
        .fetch_optional(&self.db)
        .await?;

        row.map(ApiKey::from).ok_or(CheckerError::InvalidApiKey)
    }

    /// Remove keys that are both expired and fully consumed. Runs daily
    /// from the worker pool.
    pub async fn sweep_expired_keys(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM api_keys
            WHERE expires_at < NOW()
              AND remaining_checks = 0
            "#,
        )
        .execute(&self.db)
        .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "swept expired api keys");
        }
        Ok(removed)
    }
}

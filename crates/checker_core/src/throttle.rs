//! Per-domain probe throttling and retry scheduling.
//!
//! A throttled domain carries a short-lived `throttle:<domain>` entry in
//! the cache; scheduled retries live under `retry:<email>:<attempt>` with
//! an attempt-specific delay.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::CacheProvider;

/// Default domain block duration.
pub const THROTTLE_TTL: Duration = Duration::from_secs(60);

/// Max allowed retry attempts per email.
pub const MAX_RETRIES: u32 = 3;

pub struct ThrottleManager {
    cache: Arc<dyn CacheProvider>,
}

impl ThrottleManager {
    pub fn new(cache: Arc<dyn CacheProvider>) -> Self {
        Self { cache }
    }

    pub async fn is_throttled(&self, domain: &str) -> bool {
        self.cache.get(&format!("throttle:{domain}")).await.is_some()
    }

    /// Block a domain for the default 60s.
    pub async fn throttle_domain(&self, domain: &str) {
        self.throttle_domain_with_ttl(domain, THROTTLE_TTL).await;
    }

    pub async fn throttle_domain_with_ttl(&self, domain: &str, ttl: Duration) {
        self.cache
            .set(&format!("throttle:{domain}"), "1".into(), ttl)
            .await;
        debug!(%domain, ttl_secs = ttl.as_secs(), "domain throttled");
    }

    /// Record a retry schedule for the given attempt number.
    pub async fn schedule_retry(&self, email: &str, attempt: u32) {
        let delay = retry_delay(attempt);
        self.cache
            .set(&format!("retry:{email}:{attempt}"), email.into(), delay)
            .await;
        debug!(%email, attempt, delay_secs = delay.as_secs(), "retry scheduled");
    }
}

/// Delay ladder: 10s, 20s, then 30s for every later attempt.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    match attempt {
        1 => Duration::from_secs(10),
        2 => Duration::from_secs(20),
        _ => Duration::from_secs(30),
    }
}

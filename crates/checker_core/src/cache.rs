//! Two-tier result cache.
//!
//! The engine reads and writes opaque JSON strings through the
//! [`CacheProvider`] trait; the in-process backend keeps entries in a map
//! with monotonic expiry, the shared backend delegates TTL handling to the
//! key-value store so every node observes the same entries.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::KvClient;

/// Statistics about the current state of a cache backend.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub items: i64,
    /// Approximate memory footprint in bytes; `-1` when unavailable.
    pub memory: i64,
    pub hits: i64,
    pub misses: i64,
}

/// Pluggable cache backend. Values are opaque strings; callers own
/// serialization. A read past the entry's TTL is a miss.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn flush(&self);
    async fn stats(&self) -> CacheStats;
}

struct CacheItem {
    value: String,
    expire_at: Instant,
}

/// In-process cache backend: map behind an RW lock with atomic hit/miss
/// counters.
#[derive(Default)]
pub struct MemoryCache {
    items: RwLock<HashMap<String, CacheItem>>,
    hits: AtomicI64,
    misses: AtomicI64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let items = self.items.read().await;
        match items.get(key) {
            Some(item) if Instant::now() < item.expire_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(item.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut items = self.items.write().await;
        items.insert(
            key.to_string(),
            CacheItem {
                value,
                expire_at: Instant::now() + ttl,
            },
        );
    }

    async fn flush(&self) {
        let mut items = self.items.write().await;
        debug!(items = items.len(), "flushing cache");
        items.clear();
    }

    async fn stats(&self) -> CacheStats {
        let items = self.items.read().await;
        let memory: usize = items
            .iter()
            .map(|(k, v)| k.len() + v.value.len() + std::mem::size_of::<CacheItem>())
            .sum();
        CacheStats {
            items: items.len() as i64,
            memory: memory as i64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Shared cache backend with native TTL handling. Hits and misses are
/// counted locally per node; memory usage is not reported.
pub struct SharedCache {
    conn: KvClient,
    hits: AtomicI64,
    misses: AtomicI64,
}

impl SharedCache {
    pub fn new(conn: KvClient) -> Self {
        Self {
            conn,
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl CacheProvider for SharedCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                warn!(%key, %err, "shared cache read failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        if let Err(err) = conn.set_ex::<_, _, ()>(key, value, secs).await {
            warn!(%key, %err, "shared cache write failed");
        }
    }

    async fn flush(&self) {
        debug!("flushing shared cache");
        let mut conn = self.conn.clone();
        if let Err(err) = redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await {
            warn!(%err, "shared cache flush failed");
        }
    }

    async fn stats(&self) -> CacheStats {
        let mut conn = self.conn.clone();
        let items = redis::cmd("DBSIZE")
            .query_async::<i64>(&mut conn)
            .await
            .unwrap_or(0);
        CacheStats {
            items,
            memory: -1,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

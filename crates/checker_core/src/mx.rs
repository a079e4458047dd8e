//! DNS MX lookup with two-tier caching.
//!
//! Resolution order is shared cache (`mx:<domain>`) -> local in-process
//! cache -> live query against the configured DNS server, trying UDP first
//! and falling back to TCP. Live results populate both tiers.

use async_trait::async_trait;
use hickory_resolver::config::{
    NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::CacheProvider;
use crate::{CheckerConfig, CheckerError, MxRecord, Result};

/// Timeout for a single DNS exchange.
const DNS_TIMEOUT: Duration = Duration::from_secs(2);

/// Seam for the validator pipeline; tests construct fakes.
#[async_trait]
pub trait MxLookup: Send + Sync {
    async fn get_mx(&self, domain: &str) -> Result<Vec<MxRecord>>;
}

struct LocalEntry {
    records: Vec<MxRecord>,
    expire_at: Instant,
}

/// MX resolver with a custom upstream server and two cache tiers.
pub struct MxResolver {
    resolver: TokioAsyncResolver,
    shared: Arc<dyn CacheProvider>,
    local: RwLock<HashMap<String, LocalEntry>>,
    local_ttl: Duration,
    shared_ttl: Duration,
}

impl MxResolver {
    /// Build a resolver that queries `dns_server:53` over UDP with a TCP
    /// fallback entry, 2s timeout per exchange.
    pub fn new(
        dns_server: IpAddr,
        shared: Arc<dyn CacheProvider>,
        config: &CheckerConfig,
    ) -> Result<Self> {
        let addr = SocketAddr::new(dns_server, 53);
        let mut group = NameServerConfigGroup::new();
        group.push(NameServerConfig::new(addr, Protocol::Udp));
        group.push(NameServerConfig::new(addr, Protocol::Tcp));

        let resolver_config = ResolverConfig::from_parts(None, Vec::new(), group);
        let mut opts = ResolverOpts::default();
        opts.timeout = DNS_TIMEOUT;
        opts.attempts = 2;

        info!(%dns_server, "MX resolver initialized");

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
            shared,
            local: RwLock::new(HashMap::new()),
            local_ttl: config.domain_cache_ttl,
            shared_ttl: config.mx_cache_ttl,
        })
    }

    async fn lookup(&self, domain: &str) -> Result<Vec<MxRecord>> {
        let response = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| CheckerError::Dns(e.to_string()))?;

        let mut records: Vec<MxRecord> = response
            .iter()
            .map(|mx| {
                let priority = mx.preference();
                MxRecord {
                    host: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                    priority,
                    ttl: priority_ttl(priority),
                }
            })
            .collect();
        records.sort_by_key(|r| r.priority);
        Ok(records)
    }
}

/// Retry hint derived from the record priority.
pub fn priority_ttl(priority: u16) -> i64 {
    match priority {
        10 => 3600,
        20 => 7200,
        30 => 14400,
        _ => 3600,
    }
}

#[async_trait]
impl MxLookup for MxResolver {
    async fn get_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        let shared_key = format!("mx:{domain}");
        if let Some(cached) = self.shared.get(&shared_key).await {
            if let Ok(records) = serde_json::from_str::<Vec<MxRecord>>(&cached) {
                debug!(%domain, "MX served from shared cache");
                return Ok(records);
            }
        }

        {
            let local = self.local.read().await;
            if let Some(entry) = local.get(domain) {
                if Instant::now() < entry.expire_at {
                    debug!(%domain, "MX served from local cache");
                    return Ok(entry.records.clone());
                }
            }
        }

        let records = self.lookup(domain).await?;
        debug!(%domain, count = records.len(), "MX resolved");

        {
            let mut local = self.local.write().await;
            local.insert(
                domain.to_string(),
                LocalEntry {
                    records: records.clone(),
                    expire_at: Instant::now() + self.local_ttl,
                },
            );
        }

        if let Ok(json) = serde_json::to_string(&records) {
            self.shared.set(&shared_key, json, self.shared_ttl).await;
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ttl_hint_follows_priority() {
        assert_eq!(priority_ttl(10), 3600);
        assert_eq!(priority_ttl(20), 7200);
        assert_eq!(priority_ttl(30), 14400);
        assert_eq!(priority_ttl(5), 3600);
        assert_eq!(priority_ttl(40), 3600);
    }

    #[tokio::test]
    async fn shared_cache_short_circuits_lookup() {
        use crate::cache::MemoryCache;

        let shared = Arc::new(MemoryCache::new());
        let records = vec![MxRecord {
            host: "mx.cached.test".into(),
            priority: 10,
            ttl: 3600,
        }];
        shared
            .set(
                "mx:cached.test",
                serde_json::to_string(&records).unwrap(),
                Duration::from_secs(60),
            )
            .await;

        let resolver = MxResolver::new(
            "127.0.0.1".parse().unwrap(),
            shared,
            &CheckerConfig::default(),
        )
        .unwrap();

        // No DNS server is listening locally; a hit proves the cache path.
        let got = resolver.get_mx("cached.test").await.unwrap();
        assert_eq!(got, records);
    }
}

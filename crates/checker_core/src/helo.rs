//! HELO/EHLO domain rotation.
//!
//! Each SMTP attempt greets with the next domain from a configured list,
//! driven by a monotonic counter: a process-local atomic in standalone
//! mode, a shared increment in cluster mode so all nodes rotate through
//! the same sequence.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{CheckerError, KvClient, Result};

/// Shared counter key for cluster-wide rotation.
pub const HELO_COUNTER_KEY: &str = "helo_domain_counter";

/// Monotonic sequence source.
#[async_trait]
pub trait Counter: Send + Sync {
    async fn next(&self) -> Result<u64>;
}

/// Process-local counter.
#[derive(Default)]
pub struct MemoryCounter {
    value: AtomicU64,
}

#[async_trait]
impl Counter for MemoryCounter {
    async fn next(&self) -> Result<u64> {
        Ok(self.value.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Cluster-wide counter backed by an atomic increment in the shared store.
pub struct SharedCounter {
    conn: KvClient,
    key: String,
}

impl SharedCounter {
    pub fn new(conn: KvClient) -> Self {
        Self {
            conn,
            key: HELO_COUNTER_KEY.to_string(),
        }
    }
}

#[async_trait]
impl Counter for SharedCounter {
    async fn next(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.incr(&self.key, 1u64).await?;
        Ok(n)
    }
}

/// Rotates HELO domains with modulo distribution over the counter.
pub struct HeloRotator {
    domains: Vec<String>,
    counter: Arc<dyn Counter>,
}

impl HeloRotator {
    /// The domain list is required; an empty list is a configuration error.
    pub fn new(domains: Vec<String>, counter: Arc<dyn Counter>) -> Result<Self> {
        if domains.is_empty() {
            return Err(CheckerError::Config("HELO domain list is empty".into()));
        }
        Ok(Self { domains, counter })
    }

    pub async fn next(&self) -> Result<String> {
        let n = self.counter.next().await?;
        Ok(self.domains[(n % self.domains.len() as u64) as usize].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn rotation_cycles_through_list() {
        let rotator = HeloRotator::new(
            vec!["a.test".into(), "b.test".into(), "c.test".into()],
            Arc::new(MemoryCounter::default()),
        )
        .unwrap();

        // Counter starts at 1, so the first greeting uses index 1.
        assert_eq!(rotator.next().await.unwrap(), "b.test");
        assert_eq!(rotator.next().await.unwrap(), "c.test");
        assert_eq!(rotator.next().await.unwrap(), "a.test");
        assert_eq!(rotator.next().await.unwrap(), "b.test");
    }

    #[tokio::test]
    async fn rotation_is_uniform_over_full_cycles() {
        let domains = vec!["a.test".into(), "b.test".into(), "c.test".into()];
        let rotator =
            HeloRotator::new(domains.clone(), Arc::new(MemoryCounter::default())).unwrap();

        let mut counts = std::collections::HashMap::new();
        for _ in 0..30 {
            *counts.entry(rotator.next().await.unwrap()).or_insert(0) += 1;
        }
        for domain in &domains {
            assert_eq!(counts[domain], 10);
        }
    }

    #[test]
    fn empty_list_is_rejected() {
        let err = HeloRotator::new(Vec::new(), Arc::new(MemoryCounter::default()));
        assert!(matches!(err, Err(CheckerError::Config(_))));
    }
}

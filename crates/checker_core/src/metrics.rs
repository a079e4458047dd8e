//! Engine counters surfaced through the `/metrics` exposition.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared across the prober, worker pool and webhook
/// dispatcher.
#[derive(Debug, Default)]
pub struct Metrics {
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    emails_checked: AtomicU64,
    throttled_domains: AtomicU64,
    rbl_restrictions: AtomicU64,
    temporary_errors: AtomicU64,
    webhook_attempts: AtomicU64,
    webhook_failures: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub emails_checked: u64,
    pub throttled_domains: u64,
    pub rbl_restrictions: u64,
    pub temporary_errors: u64,
    pub webhook_attempts: u64,
    pub webhook_failures: u64,
}

impl Metrics {
    pub fn inc_tasks_processed(&self) {
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_emails_checked(&self, n: u64) {
        self.emails_checked.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_throttled_domains(&self) {
        self.throttled_domains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rbl_restrictions(&self) {
        self.rbl_restrictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_temporary_errors(&self) {
        self.temporary_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_attempts(&self) {
        self.webhook_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_failures(&self) {
        self.webhook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            emails_checked: self.emails_checked.load(Ordering::Relaxed),
            throttled_domains: self.throttled_domains.load(Ordering::Relaxed),
            rbl_restrictions: self.rbl_restrictions.load(Ordering::Relaxed),
            temporary_errors: self.temporary_errors.load(Ordering::Relaxed),
            webhook_attempts: self.webhook_attempts.load(Ordering::Relaxed),
            webhook_failures: self.webhook_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::default();
        metrics.inc_tasks_processed();
        metrics.inc_tasks_processed();
        metrics.add_emails_checked(5);
        metrics.inc_rbl_restrictions();

        let snap = metrics.snapshot();
        assert_eq!(snap.tasks_processed, 2);
        assert_eq!(snap.emails_checked, 5);
        assert_eq!(snap.rbl_restrictions, 1);
        assert_eq!(snap.webhook_attempts, 0);
    }
}

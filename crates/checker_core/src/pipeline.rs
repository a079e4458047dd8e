//! Validator pipeline: syntax -> disposable -> MX -> SMTP.
//!
//! Each email is normalized, served from the result cache when possible,
//! and otherwise pushed through the stages. A batch fans out over a
//! bounded set of concurrent jobs and results are reassembled in input
//! order.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::cache::CacheProvider;
use crate::disposable::DisposableOracle;
use crate::mx::MxLookup;
use crate::smtp::EmailProber;
use crate::{syntax, CheckerConfig, EmailReport};

/// Orchestrates the validation stages for single emails and batches.
pub struct EmailChecker {
    config: CheckerConfig,
    cache: Arc<dyn CacheProvider>,
    resolver: Arc<dyn MxLookup>,
    oracle: Arc<dyn DisposableOracle>,
    prober: Arc<dyn EmailProber>,
}

impl EmailChecker {
    pub fn new(
        config: CheckerConfig,
        cache: Arc<dyn CacheProvider>,
        resolver: Arc<dyn MxLookup>,
        oracle: Arc<dyn DisposableOracle>,
        prober: Arc<dyn EmailProber>,
    ) -> Self {
        Self {
            config,
            cache,
            resolver,
            oracle,
            prober,
        }
    }

    /// Process a batch with at most `max_workers` emails in flight.
    /// The returned reports align with the input by index.
    pub async fn process_emails(&self, emails: &[String]) -> Vec<EmailReport> {
        let workers = self.config.max_workers.max(1);
        let mut indexed: Vec<(usize, EmailReport)> = stream::iter(emails.to_vec().into_iter().enumerate())
            .map(|(i, email)| async move { (i, self.process_email(&email).await) })
            .buffer_unordered(workers)
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, report)| report).collect()
    }

    /// Validate a single email, consulting and updating the result cache.
    #[instrument(skip(self), fields(email = %email))]
    pub async fn process_email(&self, email: &str) -> EmailReport {
        let email = email.trim().to_lowercase();

        if let Some(cached) = self.cache.get(&email).await {
            match serde_json::from_str::<EmailReport>(&cached) {
                Ok(report) => {
                    debug!("report served from cache");
                    return report;
                }
                Err(err) => warn!(%err, "discarding unreadable cached report"),
            }
        }

        let report = self.build_report(&email).await;

        if let Some(ttl) = self.cache_ttl(&report) {
            match serde_json::to_string(&report) {
                Ok(json) => self.cache.set(&email, json, ttl).await,
                Err(err) => warn!(%err, "failed to serialize report for caching"),
            }
        }

        report
    }

    async fn build_report(&self, email: &str) -> EmailReport {
        let mut report = EmailReport::new(email.to_string());

        if !syntax::is_valid_email(email) {
            debug!("invalid email format");
            return report;
        }
        report.valid = true;

        let Some((_, domain)) = syntax::split_address(email) else {
            report.valid = false;
            return report;
        };
        report.disposable = self.oracle.is_disposable(domain);

        match self.resolver.get_mx(domain).await {
            Ok(records) => {
                report.mx.valid = !records.is_empty();
                report.mx.records = records;
            }
            Err(err) => {
                debug!(%err, "MX lookup failed");
                report.mx.error = Some(err.to_string());
                return report;
            }
        }

        if report.mx.valid {
            let outcome = self.prober.check_email(email, &report.mx.records).await;
            // Existence stays unknown when throttling prevented the probe.
            if outcome.category != "throttled" {
                report.exists = Some(outcome.exists);
            }
            report.smtp_error = outcome.smtp_error;
            report.error_category = outcome.category;
            report.permanent_error = outcome.permanent;
            report.ttl = outcome.ttl;
        }

        report
    }

    /// Definitive results are cached; temporary failures (including
    /// throttled skips) are not, so the next submission re-probes once
    /// the throttle and retry windows allow it.
    fn cache_ttl(&self, report: &EmailReport) -> Option<Duration> {
        if report.exists == Some(true) {
            return Some(self.config.exist_ttl);
        }
        let definitive_negative = !report.valid
            || report.mx.error.is_some()
            || !report.mx.valid
            || report.permanent_error;
        definitive_negative.then_some(self.config.not_exist_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::smtp::ProbeOutcome;
    use crate::{CheckerError, DomainList, MxRecord, Result};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeResolver {
        records: Vec<MxRecord>,
        error: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn with_records() -> Self {
            Self {
                records: vec![MxRecord {
                    host: "mx.good.test".into(),
                    priority: 10,
                    ttl: 3600,
                }],
                error: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                records: Vec::new(),
                error: Some(message.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MxLookup for FakeResolver {
        async fn get_mx(&self, _domain: &str) -> Result<Vec<MxRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(message) => Err(CheckerError::Dns(message.clone())),
                None => Ok(self.records.clone()),
            }
        }
    }

    struct FakeProber {
        outcome: ProbeOutcome,
        calls: AtomicUsize,
    }

    impl FakeProber {
        fn returning(outcome: ProbeOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmailProber for FakeProber {
        async fn check_email(&self, _email: &str, _mx: &[MxRecord]) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn checker(
        resolver: Arc<FakeResolver>,
        prober: Arc<FakeProber>,
    ) -> (EmailChecker, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let checker = EmailChecker::new(
            CheckerConfig::default(),
            cache.clone(),
            resolver,
            Arc::new(DomainList::new(vec!["trash.test".into()], Vec::new())),
            prober,
        );
        (checker, cache)
    }

    #[tokio::test]
    async fn deliverable_email_full_pipeline() {
        let resolver = Arc::new(FakeResolver::with_records());
        let prober = Arc::new(FakeProber::returning(ProbeOutcome {
            exists: true,
            ..Default::default()
        }));
        let (checker, _) = checker(resolver, prober.clone());

        let report = checker.process_email("A@Good.Test ").await;
        assert_eq!(report.email, "a@good.test");
        assert!(report.valid);
        assert!(!report.disposable);
        assert!(report.mx.valid);
        assert_eq!(report.exists, Some(true));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_syntax_skips_dns_and_smtp() {
        let resolver = Arc::new(FakeResolver::with_records());
        let prober = Arc::new(FakeProber::returning(ProbeOutcome::default()));
        let (checker, _) = checker(resolver.clone(), prober.clone());

        let report = checker.process_email("not-an-email").await;
        assert!(!report.valid);
        assert_eq!(report.exists, None);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mx_failure_reported_without_probe() {
        let resolver = Arc::new(FakeResolver::failing("NXDOMAIN"));
        let prober = Arc::new(FakeProber::returning(ProbeOutcome::default()));
        let (checker, _) = checker(resolver, prober.clone());

        let report = checker.process_email("x@no-mx.test").await;
        assert!(report.valid);
        assert!(!report.mx.valid);
        assert!(report.mx.error.as_deref().unwrap_or_default().contains("NXDOMAIN"));
        assert_eq!(report.exists, None);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disposable_domain_is_flagged() {
        let resolver = Arc::new(FakeResolver::with_records());
        let prober = Arc::new(FakeProber::returning(ProbeOutcome {
            exists: false,
            ..Default::default()
        }));
        let (checker, _) = checker(resolver, prober);

        let report = checker.process_email("spam@trash.test").await;
        assert!(report.disposable);
    }

    #[tokio::test]
    async fn cached_report_short_circuits_second_run() {
        let resolver = Arc::new(FakeResolver::with_records());
        let prober = Arc::new(FakeProber::returning(ProbeOutcome {
            exists: true,
            ..Default::default()
        }));
        let (checker, _) = checker(resolver, prober.clone());

        let first = checker.process_email("a@good.test").await;
        let second = checker.process_email("a@good.test").await;
        assert_eq!(first, second);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn temporary_failures_are_not_cached() {
        let resolver = Arc::new(FakeResolver::with_records());
        let prober = Arc::new(FakeProber::returning(ProbeOutcome {
            exists: false,
            smtp_error: "451 4.7.1 greylisted".into(),
            category: "server_error".into(),
            permanent: false,
            ttl: 7200,
        }));
        let (checker, cache) = checker(resolver, prober.clone());

        let report = checker.process_email("y@greylist.test").await;
        assert_eq!(report.error_category, "server_error");
        assert_eq!(report.ttl, 7200);
        assert!(cache.get("y@greylist.test").await.is_none());

        checker.process_email("y@greylist.test").await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn throttled_probe_leaves_existence_unknown() {
        let resolver = Arc::new(FakeResolver::with_records());
        let prober = Arc::new(FakeProber::returning(ProbeOutcome {
            exists: false,
            smtp_error: "domain throttled".into(),
            category: "throttled".into(),
            permanent: false,
            ttl: 0,
        }));
        let (checker, _) = checker(resolver, prober);

        let report = checker.process_email("u@rbl.test").await;
        assert_eq!(report.exists, None);
        assert_eq!(report.error_category, "throttled");
    }

    #[tokio::test]
    async fn batch_results_align_with_input_order() {
        let resolver = Arc::new(FakeResolver::with_records());
        let prober = Arc::new(FakeProber::returning(ProbeOutcome {
            exists: true,
            ..Default::default()
        }));
        let (checker, _) = checker(resolver, prober);

        let emails: Vec<String> = (0..25).map(|i| format!("user{i}@good.test")).collect();
        let reports = checker.process_emails(&emails).await;
        assert_eq!(reports.len(), emails.len());
        for (email, report) in emails.iter().zip(&reports) {
            assert_eq!(&report.email, email);
        }
    }
}

//! SMTP mailbox probing.
//!
//! For one email the prober walks the MX hosts in priority order and the
//! ports 25, 587 and 465, greets with a rotated HELO domain and issues
//! `MAIL FROM` / `RCPT TO`. Reply codes are classified into permanent and
//! temporary categories with retry hints; RBL rejections throttle the
//! domain and stop the walk immediately.

pub mod client;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::helo::HeloRotator;
use crate::metrics::Metrics;
use crate::throttle::ThrottleManager;
use crate::MxRecord;
use client::{ClientError, Reply, SmtpClient};

/// Probe ports in fixed order: plain submission, STARTTLS submission,
/// implicit TLS.
pub const PORTS: [u16; 3] = [25, 587, 465];

/// Outcome of probing one email.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    pub exists: bool,
    pub smtp_error: String,
    pub category: String,
    pub permanent: bool,
    /// Retry hint in seconds for temporary classifications.
    pub ttl: i64,
}

impl ProbeOutcome {
    fn throttled() -> Self {
        Self {
            smtp_error: "domain throttled".into(),
            category: "throttled".into(),
            ..Self::default()
        }
    }
}

/// Seam for the validator pipeline; tests construct fakes.
#[async_trait]
pub trait EmailProber: Send + Sync {
    async fn check_email(&self, email: &str, mx_records: &[MxRecord]) -> ProbeOutcome;
}

/// Retry tuning for a single host:port attempt loop.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Ports walked per MX host, in order.
    pub ports: Vec<u16>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            ports: PORTS.to_vec(),
        }
    }
}

pub struct SmtpProber {
    helo: Arc<HeloRotator>,
    throttle: Arc<ThrottleManager>,
    config: ProberConfig,
    tls: Option<TlsConnector>,
    metrics: Arc<Metrics>,
}

impl SmtpProber {
    pub fn new(
        helo: Arc<HeloRotator>,
        throttle: Arc<ThrottleManager>,
        config: ProberConfig,
    ) -> Self {
        let tls = match client::tls_connector() {
            Ok(connector) => Some(connector),
            Err(err) => {
                warn!(%err, "TLS unavailable, ports 465/587 will probe in plain text only");
                None
            }
        };
        Self {
            helo,
            throttle,
            config,
            tls,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn attempt(&self, email: &str, host: &str, port: u16) -> Result<(), AttemptError> {
        let helo_domain = self
            .helo
            .next()
            .await
            .map_err(|e| AttemptError::Transport {
                message: format!("failed to get HELO domain: {e}"),
                retryable: false,
            })?;

        let mut client = match (&self.tls, port) {
            (Some(tls), 465) => SmtpClient::connect_tls(host, port, tls).await?,
            _ => SmtpClient::connect(host, port).await?,
        };

        let banner = client.read_reply().await?;
        if !banner.is_positive() {
            return Err(AttemptError::Rejected(banner));
        }

        let ehlo_cmd = format!("EHLO {helo_domain}");
        let mut greeting = client.command(&ehlo_cmd).await?;
        if !greeting.is_positive() {
            // Older servers only understand HELO.
            greeting = client.command(&format!("HELO {helo_domain}")).await?;
            if !greeting.is_positive() {
                client.quit().await;
                return Err(AttemptError::Rejected(greeting));
            }
        }

        if port == 587 && !client.is_tls() && greeting.has_capability("STARTTLS") {
            if let Some(tls) = &self.tls {
                let reply = client.command("STARTTLS").await?;
                if reply.code == 220 {
                    client.upgrade_tls(host, tls).await?;
                    let reply = client.command(&ehlo_cmd).await?;
                    if !reply.is_positive() {
                        client.quit().await;
                        return Err(AttemptError::Rejected(reply));
                    }
                }
            }
        }

        let mail = client
            .command(&format!("MAIL FROM:<test@{helo_domain}>"))
            .await?;
        if !mail.is_positive() {
            client.quit().await;
            return Err(AttemptError::Rejected(mail));
        }

        let rcpt = client.command(&format!("RCPT TO:<{email}>")).await?;
        client.quit().await;
        if !rcpt.is_positive() {
            return Err(AttemptError::Rejected(rcpt));
        }
        Ok(())
    }

    /// Up to `max_retries` attempts with a pause in between; only
    /// transport-level timeouts and refusals are retried.
    async fn attempt_with_retry(&self, email: &str, host: &str, port: u16) -> Result<(), AttemptError> {
        let mut last = AttemptError::Transport {
            message: "max retries exceeded".into(),
            retryable: false,
        };
        for attempt in 0..self.config.max_retries {
            match self.attempt(email, host, port).await {
                Ok(()) => return Ok(()),
                Err(err @ AttemptError::Transport { retryable: true, .. }) => {
                    debug!(%host, port, attempt, "transport error, retrying");
                    last = err;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }
}

enum AttemptError {
    /// The server replied with a classifiable SMTP error.
    Rejected(Reply),
    /// The conversation never produced a reply worth classifying.
    Transport { message: String, retryable: bool },
}

impl From<ClientError> for AttemptError {
    fn from(err: ClientError) -> Self {
        Self::Transport {
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[async_trait]
impl EmailProber for SmtpProber {
    async fn check_email(&self, email: &str, mx_records: &[MxRecord]) -> ProbeOutcome {
        let domain = email.split('@').nth(1).unwrap_or_default();

        if self.throttle.is_throttled(domain).await {
            debug!(%domain, "domain is throttled, skipping checks");
            return ProbeOutcome::throttled();
        }

        let mut max_ttl: i64 = 0;
        let mut final_error = String::new();
        let mut final_category = String::new();
        let mut temp_errors = 0usize;

        for mx in mx_records {
            for &port in &self.config.ports {
                debug!(host = %mx.host, port, %email, "probing");

                let rejection = match self.attempt_with_retry(email, &mx.host, port).await {
                    Ok(()) => {
                        return ProbeOutcome {
                            exists: true,
                            ..ProbeOutcome::default()
                        }
                    }
                    Err(AttemptError::Transport { message, .. }) => {
                        debug!(host = %mx.host, port, %message, "transport failure");
                        continue;
                    }
                    Err(AttemptError::Rejected(reply)) => reply,
                };

                let classified = classify_reply(&rejection);
                debug!(
                    error = %rejection.to_error_string(),
                    category = %classified.category,
                    "SMTP rejection"
                );

                if classified.category == "rbl_restriction" {
                    self.throttle
                        .throttle_domain_with_ttl(domain, Duration::from_secs(60))
                        .await;
                    self.metrics.inc_rbl_restrictions();
                    warn!(%domain, "RBL restriction, domain throttled for 60s");
                    return ProbeOutcome {
                        exists: false,
                        smtp_error: "rbl restriction".into(),
                        category: classified.category,
                        permanent: false,
                        ttl: 60,
                    };
                }

                if classified.permanent {
                    return ProbeOutcome {
                        exists: false,
                        smtp_error: rejection.to_error_string(),
                        category: classified.category,
                        permanent: true,
                        ttl: 0,
                    };
                }

                temp_errors += 1;
                self.metrics.inc_temporary_errors();
                if classified.ttl > max_ttl {
                    max_ttl = classified.ttl;
                    final_error = rejection.to_error_string();
                    final_category = classified.category;
                }
            }
        }

        if temp_errors > 0 && temp_errors == mx_records.len() * self.config.ports.len() {
            warn!(%domain, "all MX attempts returned temporary errors, throttling");
            self.metrics.inc_throttled_domains();
            self.throttle.throttle_domain(domain).await;
            self.throttle.schedule_retry(email, 1).await;
            return ProbeOutcome {
                exists: false,
                smtp_error: "all MX temporary errors".into(),
                category: "temporary".into(),
                permanent: false,
                ttl: max_ttl,
            };
        }

        if !final_error.is_empty() {
            return ProbeOutcome {
                exists: false,
                smtp_error: final_error,
                category: final_category,
                permanent: false,
                ttl: max_ttl,
            };
        }

        ProbeOutcome::default()
    }
}

pub(crate) struct Classified {
    pub category: String,
    pub permanent: bool,
    pub ttl: i64,
}

/// Classify a rejection by reply code, with the RBL special case keyed on
/// the enhanced status code.
pub(crate) fn classify_reply(reply: &Reply) -> Classified {
    if reply.enhanced.as_deref() == Some("5.7.1") && reply.message.contains("RBL Restriction") {
        return Classified {
            category: "rbl_restriction".into(),
            permanent: false,
            ttl: 60,
        };
    }

    match reply.code {
        500..=599 => {
            let category = match reply.code {
                550 | 551 => "mailbox_not_found",
                552 => "mailbox_full",
                553 | 501 => "invalid_address",
                554 => "transaction_failed",
                _ => "permanent_error",
            };
            Classified {
                category: category.into(),
                permanent: true,
                ttl: 0,
            }
        }
        400..=499 => {
            let category = match reply.code {
                421 | 450 => "server_unavailable",
                451 => "server_error",
                452 => "storage_limit",
                _ => "temporary_error",
            };
            Classified {
                category: category.into(),
                permanent: false,
                ttl: temporary_ttl(reply.code),
            }
        }
        _ => Classified {
            category: "unknown_error".into(),
            permanent: true,
            ttl: 0,
        },
    }
}

fn temporary_ttl(code: u16) -> i64 {
    match code {
        421 => 1800,
        450 => 3600,
        451 => 7200,
        452 => 14400,
        _ => 3600,
    }
}

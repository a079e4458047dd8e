//! # checker_core
//!
//! Distributed bulk email validation engine. A batch of addresses moves
//! through a four-stage pipeline (syntax, disposable-domain detection, MX
//! lookup, SMTP probe) driven by a pool of workers that share a task queue,
//! a result cache and per-task locks through an external key-value store,
//! so any node can pick up any task.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use checker_core::{CheckerConfig, EmailChecker};
//! use checker_core::cache::MemoryCache;
//! use checker_core::disposable::DomainList;
//! use checker_core::helo::{HeloRotator, MemoryCounter};
//! use checker_core::mx::MxResolver;
//! use checker_core::smtp::SmtpProber;
//! use checker_core::throttle::ThrottleManager;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = CheckerConfig::default();
//! let cache = Arc::new(MemoryCache::new());
//! let throttle = Arc::new(ThrottleManager::new(cache.clone()));
//! let helo = Arc::new(HeloRotator::new(
//!     vec!["relay-one.example".into(), "relay-two.example".into()],
//!     Arc::new(MemoryCounter::default()),
//! )?);
//! let resolver = Arc::new(MxResolver::new("1.1.1.1".parse()?, cache.clone(), &config)?);
//! let prober = Arc::new(SmtpProber::new(helo, throttle.clone(), Default::default()));
//! let oracle = Arc::new(DomainList::default());
//!
//! let checker = EmailChecker::new(config, cache, resolver, oracle, prober);
//! let reports = checker.process_emails(&["user@example.com".to_string()]).await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod disposable;
pub mod helo;
pub mod lock;
pub mod metrics;
pub mod mx;
pub mod pipeline;
pub mod smtp;
pub mod storage;
pub mod syntax;
pub mod throttle;
pub mod webhook;
pub mod worker;

mod kv;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use disposable::{DisposableOracle, DomainList};
pub use kv::KvClient;
pub use pipeline::EmailChecker;

/// Engine configuration shared by the pipeline, resolver and worker pool.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Number of concurrent per-email jobs within a task and of outer workers.
    pub max_workers: usize,
    /// Lifetime of per-domain MX entries in the local cache.
    pub domain_cache_ttl: Duration,
    /// Lifetime of MX entries in the shared cache.
    pub mx_cache_ttl: Duration,
    /// Result cache TTL when the mailbox was confirmed to exist.
    pub exist_ttl: Duration,
    /// Result cache TTL for definitive negative results.
    pub not_exist_ttl: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            domain_cache_ttl: Duration::from_secs(24 * 3600),
            mx_cache_ttl: Duration::from_secs(3600),
            exist_ttl: Duration::from_secs(720 * 3600),
            not_exist_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Task lifecycle states. Transitions are strictly
/// `pending -> processing -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A batch of emails submitted together with a shared lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub emails: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<EmailReport>,
    pub created_at: DateTime<Utc>,
    /// Owning API key; empty in unauthenticated local mode.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

impl Task {
    pub fn new(id: String, emails: Vec<String>, api_key: String) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            emails,
            results: Vec::new(),
            created_at: Utc::now(),
            api_key,
            webhook: None,
        }
    }
}

/// Webhook delivery settings attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Human-readable TTL such as `"30s"`, `"5m"` or `"2h"`.
    pub ttl: String,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Result of processing a single email address.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmailReport {
    pub email: String,
    pub valid: bool,
    pub disposable: bool,
    /// Tri-state existence: absent when no SMTP probe ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    pub mx: MxStats,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub permanent_error: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_category: String,
    /// Retry hint in seconds for temporary failures.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub smtp_error: String,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl EmailReport {
    pub fn new(email: String) -> Self {
        Self {
            email,
            ..Self::default()
        }
    }
}

/// MX lookup outcome for a domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MxStats {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<MxRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A single MX record; `ttl` is a retry hint derived from the priority,
/// not the record's own DNS TTL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MxRecord {
    pub host: String,
    pub priority: u16,
    pub ttl: i64,
}

/// Billing model of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    PayAsYouGo,
    Monthly,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PayAsYouGo => "pay_as_you_go",
            Self::Monthly => "monthly",
        }
    }
}

/// API key with its usage accounting. Invariant:
/// `remaining_checks = initial_checks - used_checks >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub initial_checks: i64,
    pub used_checks: i64,
    pub remaining_checks: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_topup: Option<DateTime<Utc>>,
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("task not found")]
    TaskNotFound,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("api key expired")]
    KeyExpired,
    #[error("quota exhausted")]
    QuotaExhausted,
    #[error("failed to acquire lock for {0}")]
    LockUnavailable(String),
    #[error("MX lookup failed: {0}")]
    Dns(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("key-value store error: {0}")]
    Kv(#[from] redis::RedisError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CheckerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn task_roundtrip_preserves_fields() {
        let mut task = Task::new("id-1".into(), vec!["a@example.com".into()], "key".into());
        task.status = TaskStatus::Completed;
        task.results = vec![EmailReport::new("a@example.com".into())];

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.status, TaskStatus::Completed);
        assert_eq!(back.emails, task.emails);
        assert_eq!(back.results.len(), 1);
        assert_eq!(back.api_key, "key");
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::from_str::<TaskStatus>("\"completed\"").unwrap(),
            TaskStatus::Completed
        );
    }

    #[test]
    fn exists_absent_when_unknown() {
        let report = EmailReport::new("a@example.com".into());
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("exists"));

        let mut confirmed = report.clone();
        confirmed.exists = Some(false);
        let json = serde_json::to_string(&confirmed).unwrap();
        assert!(json.contains("\"exists\":false"));
    }

    #[test]
    fn report_roundtrip_is_identity() {
        let report = EmailReport {
            email: "user@mail.test".into(),
            valid: true,
            disposable: false,
            exists: Some(true),
            mx: MxStats {
                valid: true,
                records: vec![MxRecord {
                    host: "mx.mail.test".into(),
                    priority: 10,
                    ttl: 3600,
                }],
                error: None,
            },
            permanent_error: false,
            error_category: String::new(),
            ttl: 0,
            smtp_error: String::new(),
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: EmailReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn key_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&KeyType::PayAsYouGo).unwrap(),
            "\"pay_as_you_go\""
        );
        assert_eq!(KeyType::Monthly.as_str(), "monthly");
    }
}

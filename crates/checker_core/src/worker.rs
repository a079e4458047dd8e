//! Worker pool driving the task lifecycle.
//!
//! Each worker dequeues under an atomic pop-and-lock, marks the task
//! processing, keeps the lock fresh in the background, runs the pipeline
//! and persists the terminal state. Quota is decremented for results that
//! carry an SMTP verdict, then the webhook fires. Losing the lock mid-run
//! abandons the task; the stalled-task scan re-queues it.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthService;
use crate::lock::{self, DistributedLock};
use crate::metrics::Metrics;
use crate::pipeline::EmailChecker;
use crate::storage::{RedisStore, TaskStore};
use crate::webhook::WebhookDispatcher;
use crate::{KvClient, Result, Task, TaskStatus};

/// Idle pause when the queue is empty.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// TTL of the per-task processing lock.
const TASK_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Interval of the stalled-task recovery scan.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval of the expired-key sweeper.
const KEY_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

pub struct WorkerPool {
    store: Arc<dyn TaskStore>,
    checker: Arc<EmailChecker>,
    webhooks: Arc<WebhookDispatcher>,
    auth: Option<Arc<AuthService>>,
    kv: Option<KvClient>,
    metrics: Arc<Metrics>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        checker: Arc<EmailChecker>,
        webhooks: Arc<WebhookDispatcher>,
        auth: Option<Arc<AuthService>>,
        kv: Option<KvClient>,
        metrics: Arc<Metrics>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            checker,
            webhooks,
            auth,
            kv,
            metrics,
            workers: workers.max(1),
        }
    }

    /// Spawn the worker loops and maintenance tasks.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.workers + 2);
        for worker_id in 0..self.workers {
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id).await;
            }));
        }
        handles.push(self.spawn_key_sweeper());
        if let Some(handle) = self.spawn_stalled_recovery() {
            handles.push(handle);
        }
        info!(workers = self.workers, "worker pool started");
        handles
    }

    async fn worker_loop(&self, worker_id: usize) {
        loop {
            let token = format!("worker:{}", Uuid::new_v4());
            let task = match self.store.dequeue_task(&token).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tokio::time::sleep(IDLE_WAIT).await;
                    continue;
                }
                Err(err) => {
                    warn!(worker_id, %err, "dequeue failed");
                    tokio::time::sleep(IDLE_WAIT).await;
                    continue;
                }
            };

            debug!(worker_id, task_id = %task.id, "task dequeued");
            if let Err(err) = self.process_task(task, &token).await {
                error!(worker_id, %err, "task processing failed");
                self.metrics.inc_tasks_failed();
            }
        }
    }

    /// Run one task to its terminal state under a refreshed lock. The
    /// worker token is the one the dequeue step wrote into the lock entry,
    /// so release stays scoped to this holder.
    pub async fn process_task(&self, mut task: Task, worker_token: &str) -> Result<()> {
        let lock = Arc::new(DistributedLock::with_token(
            self.kv.clone(),
            format!("lock:task:{}", task.id),
            worker_token,
            TASK_LOCK_TTL,
        ));
        let refresher = lock::start_refresh(lock.clone());
        let mut lock_lost = refresher.failure_signal();

        task.status = TaskStatus::Processing;
        self.store.update_task(&task).await?;

        let results = tokio::select! {
            results = self.checker.process_emails(&task.emails) => results,
            _ = lock_lost.changed() => {
                // Another worker will pick the task up through recovery;
                // per-email cache entries written so far stay valid.
                warn!(task_id = %task.id, "lock lost, abandoning task");
                refresher.stop();
                return Ok(());
            }
        };
        refresher.stop();

        task.status = TaskStatus::Completed;
        task.results = results;
        self.store.update_task(&task).await?;
        self.metrics.inc_tasks_processed();
        self.metrics.add_emails_checked(task.emails.len() as u64);
        info!(task_id = %task.id, results = task.results.len(), "task completed");

        self.settle_quota(&task).await;
        if task.webhook.is_some() {
            self.webhooks.trigger(&task).await;
        }

        lock.release().await;
        Ok(())
    }

    /// Bill the owning key for every result that carries an SMTP verdict;
    /// syntactic and DNS rejects are free.
    async fn settle_quota(&self, task: &Task) {
        let Some(auth) = &self.auth else {
            return;
        };
        if task.api_key.is_empty() || task.results.is_empty() {
            return;
        }
        let billable = task
            .results
            .iter()
            .filter(|report| report.exists.is_some())
            .count() as i64;
        if billable == 0 {
            return;
        }
        if let Err(err) = auth.decrement(&task.api_key, billable).await {
            error!(task_id = %task.id, %err, "failed to decrement quota");
        }
    }

    fn spawn_stalled_recovery(&self) -> Option<JoinHandle<()>> {
        let kv = self.kv.clone()?;
        let cache = self.store.cache();
        let store = RedisStore::new(kv, cache);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECOVERY_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = store.recover_stalled_tasks().await {
                    warn!(%err, "stalled task recovery failed");
                }
            }
        }))
    }

    fn spawn_key_sweeper(&self) -> JoinHandle<()> {
        let auth = self.auth.clone();
        tokio::spawn(async move {
            let Some(auth) = auth else {
                return;
            };
            let mut ticker = tokio::time::interval(KEY_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = auth.sweep_expired_keys().await {
                    warn!(%err, "expired key sweep failed");
                }
            }
        })
    }
}

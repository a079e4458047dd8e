//! Distributed per-key locking.
//!
//! A lock is an NX-set entry carrying a unique token with a TTL. Release
//! compares the token before deleting so a lock refreshed by a later owner
//! is never removed by a stale holder. In standalone mode every operation
//! succeeds without touching the store.

use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::KvClient;

/// Interval between background lock refreshes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
end
return 0
"#;

pub struct DistributedLock {
    conn: Option<KvClient>,
    key: String,
    token: String,
    ttl: Duration,
}

impl DistributedLock {
    /// `conn = None` selects standalone mode where locking is bypassed.
    pub fn new(conn: Option<KvClient>, key: impl Into<String>, ttl: Duration) -> Self {
        Self::with_token(conn, key, Uuid::new_v4().to_string(), ttl)
    }

    /// Adopt a lock whose entry was written elsewhere with a known token,
    /// e.g. by the atomic dequeue script.
    pub fn with_token(
        conn: Option<KvClient>,
        key: impl Into<String>,
        token: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            conn,
            key: key.into(),
            token: token.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Try to take the lock. Always succeeds in standalone mode.
    pub async fn acquire(&self) -> bool {
        let Some(conn) = &self.conn else {
            return true;
        };
        let mut conn = conn.clone();
        let result: Result<bool, _> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(key = %self.key, %err, "lock acquire failed");
                false
            }
        }
    }

    /// Atomically delete the entry if the token still matches.
    pub async fn release(&self) {
        let Some(conn) = &self.conn else {
            return;
        };
        let mut conn = conn.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        if let Err(err) = script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<i64>(&mut conn)
            .await
        {
            warn!(key = %self.key, %err, "lock release failed");
        }
    }

    /// Extend the TTL. Returns false when the entry is gone or the store
    /// is unreachable.
    pub async fn refresh(&self) -> bool {
        let Some(conn) = &self.conn else {
            return true;
        };
        let mut conn = conn.clone();
        match conn
            .expire::<_, bool>(&self.key, self.ttl.as_secs().max(1) as i64)
            .await
        {
            Ok(extended) => extended,
            Err(err) => {
                warn!(key = %self.key, %err, "lock refresh failed");
                false
            }
        }
    }
}

/// Handle over a background refresher. `failed()` flips when a refresh
/// did not go through, signalling the holder to abandon its work.
pub struct RefreshHandle {
    handle: JoinHandle<()>,
    failed_rx: watch::Receiver<bool>,
}

impl RefreshHandle {
    pub fn failure_signal(&self) -> watch::Receiver<bool> {
        self.failed_rx.clone()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a task refreshing the lock every [`REFRESH_INTERVAL`] until the
/// handle is dropped or a refresh fails.
pub fn start_refresh(lock: Arc<DistributedLock>) -> RefreshHandle {
    let (failed_tx, failed_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if !lock.refresh().await {
                warn!(key = %lock.key(), "lock refresh failed, stopping refresher");
                let _ = failed_tx.send(true);
                return;
            }
            debug!(key = %lock.key(), "lock refreshed");
        }
    });
    RefreshHandle { handle, failed_rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standalone_mode_bypasses_store() {
        let lock = DistributedLock::new(None, "lock:task:t1", Duration::from_secs(300));
        assert!(lock.acquire().await);
        assert!(lock.refresh().await);
        lock.release().await;
    }

    #[test]
    fn tokens_are_unique_per_instance() {
        let a = DistributedLock::new(None, "k", Duration::from_secs(1));
        let b = DistributedLock::new(None, "k", Duration::from_secs(1));
        assert_ne!(a.token(), b.token());
    }

    #[tokio::test]
    async fn refresher_signal_starts_clear() {
        let lock = Arc::new(DistributedLock::new(
            None,
            "lock:task:t2",
            Duration::from_secs(300),
        ));
        let handle = start_refresh(lock);
        assert!(!*handle.failure_signal().borrow());
        handle.stop();
    }
}

//! Task persistence and the shared FIFO queue.
//!
//! Tasks are stored under `task:<id>`; queued work is a list of task ids
//! at `email_checker:tasks`. Dequeue on the shared backend is a
//! server-side script that pops the tail, takes the per-task lock with
//! the worker's token and pushes the id back to the head if the lock is
//! already held. The in-process backend is a mutexed deque.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::CacheProvider;
use crate::{CheckerError, KvClient, Result, Task};

/// Queue of pending task ids in the shared store.
pub const TASK_QUEUE_KEY: &str = "email_checker:tasks";

/// Lifetime of a persisted task after its last write.
pub const TASK_TTL: Duration = Duration::from_secs(24 * 3600);

/// TTL of the per-task lock taken on dequeue, in seconds.
pub const DEQUEUE_LOCK_TTL_SECS: u64 = 300;

/// Locks below this remaining TTL are considered stalled.
const STALLED_LOCK_FLOOR_SECS: i64 = 60;

/// Pop the oldest queued entry and take its lock in one server-side step.
/// The entry may be a bare task id or a full task document from older
/// writers; both resolve to the id.
const DEQUEUE_SCRIPT: &str = r#"
local item = redis.call('RPOP', KEYS[1])
if not item then return nil end
local id = item
local ok, decoded = pcall(cjson.decode, item)
if ok and type(decoded) == 'table' and decoded.id then
    id = decoded.id
end
local lock_key = 'lock:task:' .. id
if redis.call('SET', lock_key, ARGV[1], 'NX', 'EX', ARGV[2]) then
    return id
else
    redis.call('LPUSH', KEYS[1], item)
    return nil
end
"#;

/// Re-queue every task whose lock TTL is missing or nearly expired.
const RECOVERY_SCRIPT: &str = r#"
local requeued = 0
local locks = redis.call('KEYS', 'lock:task:*')
for _, lock_key in ipairs(locks) do
    local ttl = redis.call('TTL', lock_key)
    if ttl == -1 or ttl < tonumber(ARGV[1]) then
        local task_id = string.sub(lock_key, 11)
        redis.call('LPUSH', KEYS[1], task_id)
        redis.call('DEL', lock_key)
        requeued = requeued + 1
    end
end
return requeued
"#;

/// Persistence operations shared by the HTTP surface and the worker pool.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Task>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn enqueue_task(&self, task: &Task) -> Result<()>;
    /// Atomically pop the oldest queued task and lock it with the worker's
    /// token. `None` when the queue is empty or the head is locked.
    async fn dequeue_task(&self, worker_token: &str) -> Result<Option<Task>>;
    fn cache(&self) -> Arc<dyn CacheProvider>;
}

/// In-process store for standalone deployments.
pub struct MemoryStore {
    tasks: Mutex<HashMap<String, Task>>,
    queue: Mutex<VecDeque<String>>,
    cache: Arc<dyn CacheProvider>,
}

impl MemoryStore {
    pub fn new(cache: Arc<dyn CacheProvider>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            cache,
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let tasks = self.tasks.lock().await;
        tasks.get(id).cloned().ok_or(CheckerError::TaskNotFound)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.save_task(task).await
    }

    async fn enqueue_task(&self, task: &Task) -> Result<()> {
        let mut queue = self.queue.lock().await;
        queue.push_back(task.id.clone());
        Ok(())
    }

    async fn dequeue_task(&self, _worker_token: &str) -> Result<Option<Task>> {
        let id = {
            let mut queue = self.queue.lock().await;
            queue.pop_front()
        };
        match id {
            Some(id) => Ok(Some(self.get_task(&id).await?)),
            None => Ok(None),
        }
    }

    fn cache(&self) -> Arc<dyn CacheProvider> {
        self.cache.clone()
    }
}

/// Shared store for cluster deployments.
pub struct RedisStore {
    conn: KvClient,
    cache: Arc<dyn CacheProvider>,
}

impl RedisStore {
    pub fn new(conn: KvClient, cache: Arc<dyn CacheProvider>) -> Self {
        Self { conn, cache }
    }

    /// Scan for stalled locks and re-queue their tasks. Returns the number
    /// of tasks recovered.
    pub async fn recover_stalled_tasks(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RECOVERY_SCRIPT);
        let requeued: i64 = script
            .key(TASK_QUEUE_KEY)
            .arg(STALLED_LOCK_FLOOR_SECS)
            .invoke_async(&mut conn)
            .await?;
        if requeued > 0 {
            info!(requeued, "re-queued stalled tasks");
        }
        Ok(requeued)
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(task)?;
        conn.set_ex::<_, _, ()>(format!("task:{}", task.id), data, TASK_TTL.as_secs())
            .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(format!("task:{id}")).await?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(CheckerError::TaskNotFound),
        }
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.save_task(task).await
    }

    async fn enqueue_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(TASK_QUEUE_KEY, &task.id).await?;
        debug!(task_id = %task.id, "task enqueued");
        Ok(())
    }

    async fn dequeue_task(&self, worker_token: &str) -> Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(DEQUEUE_SCRIPT);
        let id: Option<String> = script
            .key(TASK_QUEUE_KEY)
            .arg(worker_token)
            .arg(DEQUEUE_LOCK_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };
        match self.get_task(&id).await {
            Ok(task) => Ok(Some(task)),
            Err(CheckerError::TaskNotFound) => {
                // The task record expired while queued; drop the stale lock.
                warn!(task_id = %id, "queued task no longer exists");
                let _ = conn.del::<_, ()>(format!("lock:task:{id}")).await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn cache(&self) -> Arc<dyn CacheProvider> {
        self.cache.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::TaskStatus;
    use pretty_assertions::assert_eq;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(MemoryCache::new()))
    }

    fn task(id: &str) -> Task {
        Task::new(id.into(), vec![format!("user@{id}.test")], String::new())
    }

    #[tokio::test]
    async fn save_then_get_roundtrips() {
        let store = store();
        store.save_task(&task("t1")).await.unwrap();
        let loaded = store.get_task("t1").await.unwrap();
        assert_eq!(loaded.id, "t1");
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn get_unknown_task_is_not_found() {
        let err = store().get_task("missing").await.unwrap_err();
        assert!(matches!(err, CheckerError::TaskNotFound));
    }

    #[tokio::test]
    async fn update_observes_latest_write() {
        let store = store();
        let mut t = task("t1");
        store.save_task(&t).await.unwrap();

        t.status = TaskStatus::Completed;
        store.update_task(&t).await.unwrap();
        assert_eq!(store.get_task("t1").await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let store = store();
        for id in ["a", "b", "c"] {
            let t = task(id);
            store.save_task(&t).await.unwrap();
            store.enqueue_task(&t).await.unwrap();
        }

        assert_eq!(store.dequeue_task("w").await.unwrap().unwrap().id, "a");
        assert_eq!(store.dequeue_task("w").await.unwrap().unwrap().id, "b");
        assert_eq!(store.dequeue_task("w").await.unwrap().unwrap().id, "c");
        assert!(store.dequeue_task("w").await.unwrap().is_none());
    }
}

//! # Pending Queue — FIFO of Jobs Awaiting Assignment
//!
//! Holds job ids only; the job store remains the source of truth. The
//! dispatcher tolerates stale entries (ids whose job is no longer PENDING),
//! so the queue needs no transactional coupling with the store.
//!
//! Two backends: [`MemoryQueue`] (default, process-local) and
//! [`RedisQueue`] (survives gateway restarts, selected via `--redis-url`).
//! Both are strictly FIFO; compensation re-enqueues land at the tail.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub type SharedQueue = Arc<dyn PendingQueue>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait PendingQueue: Send + Sync {
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError>;
    async fn dequeue(&self) -> Result<Option<String>, QueueError>;
    async fn peek(&self) -> Result<Option<String>, QueueError>;
    async fn size(&self) -> Result<u64, QueueError>;
    /// Remove a specific id (used when a PENDING job is canceled).
    /// Returns true if an entry was removed.
    async fn remove(&self, job_id: &str) -> Result<bool, QueueError>;
}

// ── Memory backend ──────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PendingQueue for MemoryQueue {
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError> {
        self.lock().push_back(job_id.to_string());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<String>, QueueError> {
        Ok(self.lock().pop_front())
    }

    async fn peek(&self) -> Result<Option<String>, QueueError> {
        Ok(self.lock().front().cloned())
    }

    async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.lock().len() as u64)
    }

    async fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|id| id != job_id);
        Ok(items.len() < before)
    }
}

// ── Redis backend ───────────────────────────────────────────────

/// FIFO over a single Redis list: `LPUSH` at the head, `RPOP` from the
/// tail, so arrival order is preserved.
pub struct RedisQueue {
    conn: redis::aio::ConnectionManager,
    key: String,
}

impl RedisQueue {
    pub const DEFAULT_KEY: &'static str = "skybridge:pending";

    pub async fn connect(redis_url: &str, key: Option<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisQueue {
            conn,
            key: key.unwrap_or_else(|| Self::DEFAULT_KEY.to_string()),
        })
    }

    fn backend(e: redis::RedisError) -> QueueError {
        QueueError::Backend(anyhow::Error::new(e))
    }
}

#[async_trait]
impl PendingQueue for RedisQueue {
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(job_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::backend)
    }

    async fn dequeue(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("RPOP")
            .arg(&self.key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(Self::backend)
    }

    async fn peek(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("LINDEX")
            .arg(&self.key)
            .arg(-1)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(Self::backend)
    }

    async fn size(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(&self.key)
            .query_async::<u64>(&mut conn)
            .await
            .map_err(Self::backend)
    }

    async fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.key)
            .arg(0)
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .map_err(Self::backend)?;
        Ok(removed > 0)
    }
}

//! Job queue and live-status key space.
//!
//! The queue is a FIFO of JSON-encoded job descriptors; the backing store's
//! atomic list pop gives each element exactly one consumer, so workers
//! scale horizontally. Live status is an overwrite-in-place per-item key
//! read by the serving surface as a detail view.

mod memory;
mod redis;

pub use memory::{InMemoryJobQueue, InMemoryLiveStatusStore};
pub use redis::{RedisJobQueue, RedisLiveStatusStore};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::{LiveStatus, TranscodeJob, WorkerHealth};

/// Key holding the FIFO of pending jobs.
pub const JOBS_KEY: &str = "jobs";
/// Key prefix for per-item live status.
pub const STATUS_KEY_PREFIX: &str = "video_status:";
/// Key holding the worker heartbeat.
pub const HEALTH_KEY: &str = "worker_health";

pub fn status_key(item_id: &str) -> String {
    format!("{STATUS_KEY_PREFIX}{item_id}")
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job to the tail of the queue.
    async fn push(&self, job: &TranscodeJob) -> Result<()>;

    /// Pop from the head, blocking up to `timeout`. `None` on timeout.
    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<TranscodeJob>>;
}

#[async_trait]
pub trait LiveStatusStore: Send + Sync {
    async fn publish(&self, item_id: &str, status: &LiveStatus) -> Result<()>;

    async fn fetch(&self, item_id: &str) -> Result<Option<LiveStatus>>;

    async fn clear(&self, item_id: &str) -> Result<()>;

    async fn publish_heartbeat(&self, health: &WorkerHealth) -> Result<()>;

    async fn fetch_heartbeat(&self) -> Result<Option<WorkerHealth>>;
}

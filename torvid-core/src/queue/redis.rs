use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::types::{LiveStatus, TranscodeJob, WorkerHealth};

use super::{HEALTH_KEY, JOBS_KEY, JobQueue, LiveStatusStore, status_key};

async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    info!("connecting to Redis at {}", redis_url);

    let client = redis::Client::open(redis_url)
        .map_err(|e| PipelineError::Queue(format!("failed to create Redis client: {e}")))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| PipelineError::Queue(format!("failed to connect to Redis: {e}")))
}

/// Redis list-backed job queue (`RPUSH`/`BLPOP`).
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue").finish()
    }
}

impl RedisJobQueue {
    pub async fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, job: &TranscodeJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        debug!("queue PUSH for {}", job.item_id);

        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(JOBS_KEY, payload)
            .await
            .map_err(|e| PipelineError::Queue(format!("RPUSH failed: {e}")))?;
        Ok(())
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<TranscodeJob>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .blpop(JOBS_KEY, timeout.as_secs_f64())
            .await
            .map_err(|e| PipelineError::Queue(format!("BLPOP failed: {e}")))?;

        match popped {
            Some((_, payload)) => {
                let job: TranscodeJob = serde_json::from_str(&payload)?;
                debug!("queue POP for {}", job.item_id);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

/// Redis-backed live status and heartbeat keys.
#[derive(Clone)]
pub struct RedisLiveStatusStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisLiveStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLiveStatusStore").finish()
    }
}

impl RedisLiveStatusStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }

    async fn set_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, payload)
            .await
            .map_err(|e| PipelineError::Queue(format!("SET {key} failed: {e}")))?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| PipelineError::Queue(format!("GET {key} failed: {e}")))?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }
}

#[async_trait]
impl LiveStatusStore for RedisLiveStatusStore {
    async fn publish(&self, item_id: &str, status: &LiveStatus) -> Result<()> {
        self.set_json(&status_key(item_id), status).await
    }

    async fn fetch(&self, item_id: &str) -> Result<Option<LiveStatus>> {
        self.get_json(&status_key(item_id)).await
    }

    async fn clear(&self, item_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(status_key(item_id))
            .await
            .map_err(|e| PipelineError::Queue(format!("DEL failed: {e}")))?;
        Ok(())
    }

    async fn publish_heartbeat(&self, health: &WorkerHealth) -> Result<()> {
        self.set_json(HEALTH_KEY, health).await
    }

    async fn fetch_heartbeat(&self) -> Result<Option<WorkerHealth>> {
        self.get_json(HEALTH_KEY).await
    }
}

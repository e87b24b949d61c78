use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::Result;
use crate::types::{LiveStatus, TranscodeJob, WorkerHealth};

use super::{JobQueue, LiveStatusStore};

/// Process-local queue with the same blocking-pop semantics as the Redis
/// implementation. Used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<VecDeque<TranscodeJob>>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, job: &TranscodeJob) -> Result<()> {
        self.jobs
            .lock()
            .expect("queue mutex poisoned")
            .push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<TranscodeJob>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.jobs.lock().expect("queue mutex poisoned").pop_front() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

/// Process-local live status map.
#[derive(Debug, Default)]
pub struct InMemoryLiveStatusStore {
    statuses: Mutex<HashMap<String, LiveStatus>>,
    heartbeat: Mutex<Option<WorkerHealth>>,
}

impl InMemoryLiveStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LiveStatusStore for InMemoryLiveStatusStore {
    async fn publish(&self, item_id: &str, status: &LiveStatus) -> Result<()> {
        self.statuses
            .lock()
            .expect("status mutex poisoned")
            .insert(item_id.to_string(), status.clone());
        Ok(())
    }

    async fn fetch(&self, item_id: &str) -> Result<Option<LiveStatus>> {
        Ok(self
            .statuses
            .lock()
            .expect("status mutex poisoned")
            .get(item_id)
            .cloned())
    }

    async fn clear(&self, item_id: &str) -> Result<()> {
        self.statuses
            .lock()
            .expect("status mutex poisoned")
            .remove(item_id);
        Ok(())
    }

    async fn publish_heartbeat(&self, health: &WorkerHealth) -> Result<()> {
        *self.heartbeat.lock().expect("heartbeat mutex poisoned") = Some(health.clone());
        Ok(())
    }

    async fn fetch_heartbeat(&self) -> Result<Option<WorkerHealth>> {
        Ok(self
            .heartbeat
            .lock()
            .expect("heartbeat mutex poisoned")
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobKind, TranscodeOptions};
    use std::path::PathBuf;

    fn job(id: &str) -> TranscodeJob {
        TranscodeJob {
            kind: JobKind::HlsLadder,
            item_id: id.to_string(),
            input_path: PathBuf::from("/in.mkv"),
            output_dir: PathBuf::from("/out"),
            options: TranscodeOptions::default(),
        }
    }

    #[tokio::test]
    async fn pop_is_fifo() {
        let queue = InMemoryJobQueue::new();
        queue.push(&job("a")).await.unwrap();
        queue.push(&job("b")).await.unwrap();

        let first = queue
            .pop_blocking(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.item_id, "a");

        let second = queue
            .pop_blocking(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.item_id, "b");
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let queue = InMemoryJobQueue::new();
        let popped = queue.pop_blocking(Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::new());
        let pusher = queue.clone();

        let waiter = tokio::spawn(async move {
            queue.pop_blocking(Duration::from_secs(5)).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        pusher.push(&job("late")).await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.item_id, "late");
    }
}

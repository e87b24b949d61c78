use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::types::{MediaRecord, MediaStatus, download_percent};

use super::{MediaRecordStore, check_transition};

/// Record store held entirely in memory. Backs tests and single-process
/// development runs; the production store is Postgres.
#[derive(Debug, Default)]
pub struct InMemoryMediaRecordStore {
    records: RwLock<HashMap<String, MediaRecord>>,
}

impl InMemoryMediaRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut MediaRecord) -> Result<()>,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        f(record)?;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl MediaRecordStore for InMemoryMediaRecordStore {
    async fn put(&self, record: &MediaRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MediaRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<MediaRecord>> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn list_by_status(&self, status: MediaStatus) -> Result<Vec<MediaRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<MediaRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.downloader_handle.as_deref() == Some(handle))
            .cloned())
    }

    async fn set_status(&self, id: &str, status: MediaStatus) -> Result<()> {
        self.mutate(id, |record| {
            if let Err(e) = check_transition(id, record.status, status) {
                warn!("refusing status write: {e}");
                return Err(e);
            }
            record.status = status;
            Ok(())
        })
        .await
    }

    async fn set_error(&self, id: &str, message: &str) -> Result<()> {
        self.mutate(id, |record| {
            record.status = MediaStatus::Error;
            record.error_message = Some(message.to_string());
            Ok(())
        })
        .await
    }

    async fn update_download(
        &self,
        id: &str,
        downloaded_bytes: i64,
        total_bytes: i64,
        download_path: Option<&Path>,
    ) -> Result<()> {
        self.mutate(id, |record| {
            record.downloaded_bytes = downloaded_bytes;
            record.total_bytes = total_bytes;
            record.download_progress = download_percent(downloaded_bytes, total_bytes);
            if let Some(path) = download_path {
                record.download_path = Some(path.to_path_buf());
            }
            Ok(())
        })
        .await
    }

    async fn set_downloader_handle(&self, id: &str, handle: &str) -> Result<()> {
        self.mutate(id, |record| {
            record.downloader_handle = Some(handle.to_string());
            Ok(())
        })
        .await
    }

    async fn bind_source_video(&self, id: &str, path: &Path) -> Result<()> {
        self.mutate(id, |record| {
            record.source_video_path = Some(path.to_path_buf());
            Ok(())
        })
        .await
    }

    async fn set_transcode_progress(&self, id: &str, progress: f64) -> Result<()> {
        self.mutate(id, |record| {
            record.transcode_progress = progress.clamp(0.0, 100.0);
            Ok(())
        })
        .await
    }

    async fn set_available_rungs(&self, id: &str, rungs: &[String]) -> Result<()> {
        self.mutate(id, |record| {
            record.available_rungs = rungs.to_vec();
            Ok(())
        })
        .await
    }

    async fn mark_ready(&self, id: &str, rungs: &[String]) -> Result<()> {
        self.mutate(id, |record| {
            check_transition(id, record.status, MediaStatus::Ready)?;
            record.status = MediaStatus::Ready;
            record.transcode_progress = 100.0;
            record.available_rungs = rungs.to_vec();
            Ok(())
        })
        .await
    }

    async fn set_transcoded_path(&self, id: &str, path: &Path, fully: bool) -> Result<()> {
        self.mutate(id, |record| {
            record.transcoded_path = Some(path.to_path_buf());
            record.fully_transcoded = fully;
            Ok(())
        })
        .await
    }

    async fn touch_last_watched(&self, id: &str) -> Result<()> {
        self.mutate(id, |record| {
            record.last_watched_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }
}

//! Durable per-item media records.
//!
//! Field ownership is split between writers: the monitor owns the download
//! columns and the DOWNLOADING -> TRANSCODING transition, the worker owns
//! transcode progress, available rungs, and the READY/ERROR outcomes, the
//! serving surface owns `last_watched_at`. Every write is single-row, so
//! last-writer-wins is correctness-preserving.

mod memory;
mod postgres;

pub use memory::InMemoryMediaRecordStore;
pub use postgres::PostgresMediaRecordStore;

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::types::{MediaRecord, MediaStatus};

#[async_trait]
pub trait MediaRecordStore: Send + Sync {
    /// Insert a fresh record; replaces any existing row for the same id.
    async fn put(&self, record: &MediaRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<MediaRecord>>;

    async fn list(&self) -> Result<Vec<MediaRecord>>;

    async fn list_by_status(&self, status: MediaStatus) -> Result<Vec<MediaRecord>>;

    async fn find_by_handle(&self, handle: &str) -> Result<Option<MediaRecord>>;

    /// Transition `id` to `status`, refusing illegal transitions with
    /// [`crate::error::PipelineError::IllegalTransition`].
    async fn set_status(&self, id: &str, status: MediaStatus) -> Result<()>;

    /// Move to ERROR and record the human-readable message.
    async fn set_error(&self, id: &str, message: &str) -> Result<()>;

    /// Monitor-owned: byte counters, derived percentage, download directory.
    async fn update_download(
        &self,
        id: &str,
        downloaded_bytes: i64,
        total_bytes: i64,
        download_path: Option<&Path>,
    ) -> Result<()>;

    async fn set_downloader_handle(&self, id: &str, handle: &str) -> Result<()>;

    /// Bind the located video file. Required before TRANSCODING.
    async fn bind_source_video(&self, id: &str, path: &Path) -> Result<()>;

    /// Worker-owned transcode columns.
    async fn set_transcode_progress(&self, id: &str, progress: f64) -> Result<()>;

    async fn set_available_rungs(&self, id: &str, rungs: &[String]) -> Result<()>;

    /// Terminal success: READY, progress 100, final rung set.
    async fn mark_ready(&self, id: &str, rungs: &[String]) -> Result<()>;

    async fn set_transcoded_path(&self, id: &str, path: &Path, fully: bool) -> Result<()>;

    async fn touch_last_watched(&self, id: &str) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Validate a status transition against the state machine, shared by all
/// store implementations.
pub(crate) fn check_transition(
    id: &str,
    from: MediaStatus,
    to: MediaStatus,
) -> Result<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(crate::error::PipelineError::IllegalTransition {
            id: id.to_string(),
            from,
            to,
        })
    }
}

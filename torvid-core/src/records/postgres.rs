use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::types::{MediaRecord, MediaStatus, download_percent};

use super::{MediaRecordStore, check_transition};

/// PostgreSQL-backed record store. Uses the runtime query API so the crate
/// builds without a reachable database.
#[derive(Debug, Clone)]
pub struct PostgresMediaRecordStore {
    pool: PgPool,
}

const ALL_COLUMNS: &str = "id, status, title, downloader_handle, source_uri, selected_rung, \
     total_bytes, downloaded_bytes, download_progress, download_path, source_video_path, \
     transcode_progress, available_rungs, transcoded_path, fully_transcoded, error_message, \
     last_watched_at, created_at, updated_at";

impl PostgresMediaRecordStore {
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Store(format!("migration failed: {e}")))?;
        info!("media record store ready");
        Ok(Self { pool })
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, id: &str) -> Result<MediaStatus> {
        let row = sqlx::query("SELECT status FROM media_records WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_err)?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        let status: String = row.try_get("status").map_err(store_err)?;
        MediaStatus::parse(&status)
            .ok_or_else(|| PipelineError::Store(format!("unknown status in row: {status}")))
    }
}

fn store_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Store(e.to_string())
}

fn require_row(id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(PipelineError::NotFound(id.to_string()))
    } else {
        Ok(())
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn record_from_row(row: &PgRow) -> Result<MediaRecord> {
    let status: String = row.try_get("status").map_err(store_err)?;
    let status = MediaStatus::parse(&status)
        .ok_or_else(|| PipelineError::Store(format!("unknown status in row: {status}")))?;

    let path = |col: &str| -> Result<Option<PathBuf>> {
        let value: Option<String> = row.try_get(col).map_err(store_err)?;
        Ok(value.map(PathBuf::from))
    };

    Ok(MediaRecord {
        id: row.try_get("id").map_err(store_err)?,
        status,
        title: row.try_get("title").map_err(store_err)?,
        downloader_handle: row.try_get("downloader_handle").map_err(store_err)?,
        source_uri: row.try_get("source_uri").map_err(store_err)?,
        selected_rung: row.try_get("selected_rung").map_err(store_err)?,
        total_bytes: row.try_get("total_bytes").map_err(store_err)?,
        downloaded_bytes: row.try_get("downloaded_bytes").map_err(store_err)?,
        download_progress: row.try_get("download_progress").map_err(store_err)?,
        download_path: path("download_path")?,
        source_video_path: path("source_video_path")?,
        transcode_progress: row.try_get("transcode_progress").map_err(store_err)?,
        available_rungs: row.try_get("available_rungs").map_err(store_err)?,
        transcoded_path: path("transcoded_path")?,
        fully_transcoded: row.try_get("fully_transcoded").map_err(store_err)?,
        error_message: row.try_get("error_message").map_err(store_err)?,
        last_watched_at: row
            .try_get::<Option<DateTime<Utc>>, _>("last_watched_at")
            .map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
    })
}

#[async_trait]
impl MediaRecordStore for PostgresMediaRecordStore {
    async fn put(&self, record: &MediaRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO media_records (
                id, status, title, downloader_handle, source_uri, selected_rung,
                total_bytes, downloaded_bytes, download_progress, download_path,
                source_video_path, transcode_progress, available_rungs,
                transcoded_path, fully_transcoded, error_message, last_watched_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                title = EXCLUDED.title,
                downloader_handle = EXCLUDED.downloader_handle,
                source_uri = EXCLUDED.source_uri,
                selected_rung = EXCLUDED.selected_rung,
                total_bytes = EXCLUDED.total_bytes,
                downloaded_bytes = EXCLUDED.downloaded_bytes,
                download_progress = EXCLUDED.download_progress,
                download_path = EXCLUDED.download_path,
                source_video_path = EXCLUDED.source_video_path,
                transcode_progress = EXCLUDED.transcode_progress,
                available_rungs = EXCLUDED.available_rungs,
                transcoded_path = EXCLUDED.transcoded_path,
                fully_transcoded = EXCLUDED.fully_transcoded,
                error_message = EXCLUDED.error_message,
                last_watched_at = EXCLUDED.last_watched_at,
                updated_at = NOW()",
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(&record.title)
        .bind(&record.downloader_handle)
        .bind(&record.source_uri)
        .bind(&record.selected_rung)
        .bind(record.total_bytes)
        .bind(record.downloaded_bytes)
        .bind(record.download_progress)
        .bind(record.download_path.as_deref().map(path_str))
        .bind(record.source_video_path.as_deref().map(path_str))
        .bind(record.transcode_progress)
        .bind(&record.available_rungs)
        .bind(record.transcoded_path.as_deref().map(path_str))
        .bind(record.fully_transcoded)
        .bind(&record.error_message)
        .bind(record.last_watched_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.pool())
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MediaRecord>> {
        let sql = format!("SELECT {ALL_COLUMNS} FROM media_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_err)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<MediaRecord>> {
        let sql = format!("SELECT {ALL_COLUMNS} FROM media_records ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(self.pool())
            .await
            .map_err(store_err)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_by_status(&self, status: MediaStatus) -> Result<Vec<MediaRecord>> {
        let sql = format!("SELECT {ALL_COLUMNS} FROM media_records WHERE status = $1");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(self.pool())
            .await
            .map_err(store_err)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<MediaRecord>> {
        let sql = format!("SELECT {ALL_COLUMNS} FROM media_records WHERE downloader_handle = $1");
        let row = sqlx::query(&sql)
            .bind(handle)
            .fetch_optional(self.pool())
            .await
            .map_err(store_err)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn set_status(&self, id: &str, status: MediaStatus) -> Result<()> {
        let current = self.current_status(id).await?;
        if let Err(e) = check_transition(id, current, status) {
            warn!("refusing status write: {e}");
            return Err(e);
        }

        // Guard against racing writers by requiring the status we just read.
        let result = sqlx::query(
            "UPDATE media_records SET status = $1, updated_at = NOW()
             WHERE id = $2 AND status = $3",
        )
        .bind(status.as_str())
        .bind(id)
        .bind(current.as_str())
        .execute(self.pool())
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            warn!("status of {id} changed underneath a transition to {status:?}");
        }
        Ok(())
    }

    async fn set_error(&self, id: &str, message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE media_records SET status = 'ERROR', error_message = $1, updated_at = NOW()
             WHERE id = $2",
        )
        .bind(message)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn update_download(
        &self,
        id: &str,
        downloaded_bytes: i64,
        total_bytes: i64,
        download_path: Option<&Path>,
    ) -> Result<()> {
        let progress = download_percent(downloaded_bytes, total_bytes);
        let result = sqlx::query(
            "UPDATE media_records SET
                downloaded_bytes = $1,
                total_bytes = $2,
                download_progress = $3,
                download_path = COALESCE($4, download_path),
                updated_at = NOW()
             WHERE id = $5",
        )
        .bind(downloaded_bytes)
        .bind(total_bytes)
        .bind(progress)
        .bind(download_path.map(path_str))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn set_downloader_handle(&self, id: &str, handle: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE media_records SET downloader_handle = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(handle)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn bind_source_video(&self, id: &str, path: &Path) -> Result<()> {
        let result = sqlx::query(
            "UPDATE media_records SET source_video_path = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(path_str(path))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn set_transcode_progress(&self, id: &str, progress: f64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE media_records SET transcode_progress = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(progress.clamp(0.0, 100.0))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn set_available_rungs(&self, id: &str, rungs: &[String]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE media_records SET available_rungs = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(rungs.to_vec())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn mark_ready(&self, id: &str, rungs: &[String]) -> Result<()> {
        let current = self.current_status(id).await?;
        check_transition(id, current, MediaStatus::Ready)?;

        let result = sqlx::query(
            "UPDATE media_records SET
                status = 'READY',
                transcode_progress = 100,
                available_rungs = $1,
                updated_at = NOW()
             WHERE id = $2",
        )
        .bind(rungs.to_vec())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn set_transcoded_path(&self, id: &str, path: &Path, fully: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE media_records SET
                transcoded_path = $1,
                fully_transcoded = $2,
                updated_at = NOW()
             WHERE id = $3",
        )
        .bind(path_str(path))
        .bind(fully)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn touch_last_watched(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE media_records SET last_watched_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(store_err)?;
        require_row(id, result.rows_affected())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM media_records WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

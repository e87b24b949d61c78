use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use torvid_core::downloader::AddUriOptions;
use torvid_core::playlist;
use torvid_core::types::{MediaRecord, MediaStatus};

use crate::errors::{AppError, AppResult};
use crate::hls_handlers::checked_id;
use crate::state::AppState;

/// Heartbeats older than this mean the worker is gone.
const HEARTBEAT_MAX_AGE_SECS: i64 = 90;

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub magnet_uri: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rung: Option<String>,
}

/// A media record enriched with the streamability flag the UI renders.
#[derive(Debug, Serialize)]
pub struct LibraryItemView {
    #[serde(flatten)]
    pub record: MediaRecord,
    pub can_stream: bool,
    /// Which streamability rule produced `can_stream`.
    pub can_stream_heuristic: &'static str,
}

async fn item_view(state: &AppState, record: MediaRecord) -> LibraryItemView {
    let hls_dir = state.settings.hls_dir(&record.id);
    let can_stream = playlist::can_stream(&hls_dir).await;
    LibraryItemView {
        record,
        can_stream,
        can_stream_heuristic: "extinf",
    }
}

/// The request-download command: create (or reset) the record and hand the
/// magnet to the downloader.
pub async fn request_download_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DownloadRequest>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;

    if let Some(existing) = state.records.get(&id).await? {
        if !existing.status.is_terminal() {
            return Err(AppError::conflict(format!(
                "{id} is already {}",
                existing.status.as_str()
            )));
        }
        // Terminal records are reset by the explicit re-download command.
        info!("resetting {} for re-download", id);
    }

    let mut record = MediaRecord::new(&id);
    record.title = request.title.clone();
    record.source_uri = Some(request.magnet_uri.clone());
    record.selected_rung = request.rung.clone();
    state.records.put(&record).await?;

    let options = AddUriOptions {
        dir: Some(state.settings.download_root.join(&id)),
    };
    let handle = match state
        .downloader
        .add_uri(vec![request.magnet_uri], options)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            state
                .records
                .set_error(&id, "downloader rejected the request")
                .await?;
            return Err(e.into());
        }
    };

    state.records.set_downloader_handle(&id, &handle).await?;
    state
        .records
        .set_status(&id, MediaStatus::Downloading)
        .await?;

    let record = state
        .records
        .get(&id)
        .await?
        .ok_or_else(|| AppError::internal("record vanished during creation"))?;

    Ok((StatusCode::ACCEPTED, Json(item_view(&state, record).await)).into_response())
}

pub async fn list_media_handler(State(state): State<AppState>) -> AppResult<Response> {
    let records = state.records.list().await?;
    let mut views = Vec::with_capacity(records.len());
    for record in records {
        views.push(item_view(&state, record).await);
    }
    Ok(Json(views).into_response())
}

pub async fn get_media_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let mut record = state
        .records
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no media record for {id}")))?;

    // For an active download, show numbers fresher than the last monitor
    // tick. View-only: the monitor stays the sole writer of these fields.
    if record.status == MediaStatus::Downloading
        && let Some(handle) = &record.downloader_handle
    {
        match state.downloader.tell_status(handle).await {
            Ok(snapshot) => {
                record.downloaded_bytes = snapshot.completed_length as i64;
                record.total_bytes = snapshot.total_length as i64;
                record.download_progress = torvid_core::types::download_percent(
                    record.downloaded_bytes,
                    record.total_bytes,
                );
            }
            Err(e) => warn!("tellStatus for {id} failed, serving stored progress: {e}"),
        }
    }

    Ok(Json(item_view(&state, record).await).into_response())
}

/// Live status detail view, straight from the key-value store.
pub async fn live_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let status = state
        .live
        .fetch(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no live status for {id}")))?;
    Ok(Json(status).into_response())
}

/// Stream entry point: 409 while downloading, 202 with progress while
/// transcoding, 200 with playback URLs once any rung playlist is live.
pub async fn stream_entry_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let record = state
        .records
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no media record for {id}")))?;

    let hls_dir = state.settings.hls_dir(&id);
    if playlist::can_stream(&hls_dir).await {
        if let Err(e) = state.records.touch_last_watched(&id).await {
            warn!("failed to update last_watched_at for {id}: {e}");
        }

        let subtitles = list_subtitles(&hls_dir).await;
        let mp4_fallback = record
            .transcoded_path
            .is_some()
            .then(|| format!("/stream/{id}/fallback.mp4"));

        return Ok(Json(json!({
            "master_url": format!("/stream/{id}/master.m3u8"),
            "subtitles": subtitles,
            "mp4_fallback": mp4_fallback,
            "available_rungs": record.available_rungs,
        }))
        .into_response());
    }

    match record.status {
        MediaStatus::Requested | MediaStatus::Downloading => Err(AppError::conflict(format!(
            "{id} is still downloading ({:.2}%)",
            record.download_progress
        ))),
        MediaStatus::DownloadComplete | MediaStatus::Transcoding => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": record.status.as_str(),
                "progress": record.transcode_progress,
            })),
        )
            .into_response()),
        MediaStatus::Error => Err(AppError::conflict(
            record
                .error_message
                .unwrap_or_else(|| "item is in an error state".to_string()),
        )),
        // READY but nothing on disk: the output was removed out of band.
        MediaStatus::Ready => Err(AppError::not_found(format!(
            "no playable output on disk for {id}"
        ))),
    }
}

/// Delete cascade: best-effort downloader removal, then the record.
pub async fn delete_media_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let id = checked_id(&id)?;
    let record = state
        .records
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no media record for {id}")))?;

    if let Some(handle) = &record.downloader_handle {
        if let Err(e) = state.downloader.remove(handle).await {
            warn!("downloader remove for {id} failed (continuing): {e}");
        }
    }

    state.records.delete(&id).await?;
    let _ = state.live.clear(&id).await;
    info!("deleted media record {id}");
    Ok(StatusCode::NO_CONTENT)
}

/// Worker heartbeat: 200 while fresh, 503 when stale or absent.
pub async fn health_handler(State(state): State<AppState>) -> AppResult<Response> {
    match state.live.fetch_heartbeat().await? {
        Some(health)
            if (Utc::now() - health.last_seen).num_seconds() < HEARTBEAT_MAX_AGE_SECS =>
        {
            Ok(Json(health).into_response())
        }
        Some(health) => Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "stale",
                "last_seen": health.last_seen,
            })),
        )
            .into_response()),
        None => Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "no heartbeat"})),
        )
            .into_response()),
    }
}

async fn list_subtitles(hls_dir: &std::path::Path) -> Vec<String> {
    let mut subtitles = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(hls_dir.join("subs")).await else {
        return subtitles;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str()
            && name.ends_with(".vtt")
        {
            subtitles.push(name.to_string());
        }
    }
    subtitles.sort();
    subtitles
}

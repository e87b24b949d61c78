use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use std::path::Path as FsPath;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use torvid_core::playlist::{parse_rung_playlist_name, synthesize_master};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Reject identifiers and file names that could escape the media root.
pub fn checked_id(raw: &str) -> Result<String, AppError> {
    if raw.is_empty()
        || raw.contains('/')
        || raw.contains('\\')
        || raw.contains("..")
        || raw.contains('\0')
    {
        return Err(AppError::bad_request("invalid identifier"));
    }
    Ok(raw.to_string())
}

fn checked_file_name(raw: &str) -> Result<&str, AppError> {
    if raw.is_empty() || raw.contains('/') || raw.contains('\\') || raw.contains("..") {
        return Err(AppError::bad_request("invalid file name"));
    }
    Ok(raw)
}

fn build_response(status: StatusCode, content_type: &str, cache: &str, body: Body) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache)
        .body(body)
        .expect("failed to build response")
}

async fn stream_file(
    path: &FsPath,
    content_type: &str,
    cache: &str,
) -> AppResult<Response> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| AppError::not_found("file not found"))?;
    let stream = ReaderStream::new(file);
    Ok(build_response(
        StatusCode::OK,
        content_type,
        cache,
        Body::from_stream(stream),
    ))
}

/// Master playlist, synthesized from whatever rung playlists exist right
/// now. 404 until the first rung playlist appears; `no-cache` because the
/// set of rungs grows while the ladder is still encoding.
pub async fn master_playlist_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let hls_dir = state.settings.hls_dir(&id);

    let master = synthesize_master(&hls_dir)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no streamable rungs for {id}")))?;

    if let Err(e) = state.records.touch_last_watched(&id).await {
        debug!("last_watched_at update skipped for {id}: {e}");
    }

    Ok(build_response(
        StatusCode::OK,
        HLS_CONTENT_TYPE,
        "no-cache",
        Body::from(master),
    ))
}

/// Dispatch for everything else under `/stream/{id}/`. Match order is
/// deterministic: rung playlists first, then segments, then 404.
pub async fn stream_file_handler(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let file = checked_file_name(&file)?;
    let hls_dir = state.settings.hls_dir(&id);

    // 1. Per-rung media playlist: still growing, so never cached.
    if parse_rung_playlist_name(file).is_some() {
        return stream_file(&hls_dir.join(file), HLS_CONTENT_TYPE, "no-cache").await;
    }

    // 2. Segment: immutable by name, cache hard.
    if file.starts_with("output_") && file.ends_with(".ts") {
        return stream_file(
            &hls_dir.join(file),
            SEGMENT_CONTENT_TYPE,
            "public, max-age=31536000",
        )
        .await;
    }

    Err(AppError::not_found(format!("no such stream file: {file}")))
}

pub async fn thumbnail_handler(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let name = checked_file_name(&name)?;
    if !name.ends_with(".png") {
        return Err(AppError::not_found("thumbnails are PNG"));
    }

    let path = state.settings.hls_dir(&id).join("thumbnails").join(name);
    stream_file(&path, "image/png", "public, max-age=86400").await
}

pub async fn subtitle_handler(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let name = checked_file_name(&name)?;
    if !name.ends_with(".vtt") {
        return Err(AppError::not_found("subtitles are WebVTT"));
    }

    let path = state.settings.hls_dir(&id).join("subs").join(name);
    stream_file(&path, "text/vtt", "public, max-age=3600").await
}

/// Range-capable MP4 fallback for clients that cannot play HLS.
pub async fn mp4_fallback_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let id = checked_id(&id)?;
    let record = state
        .records
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no media record for {id}")))?;
    let path = record
        .transcoded_path
        .ok_or_else(|| AppError::not_found(format!("no MP4 output for {id}")))?;

    let file_size = tokio::fs::metadata(&path)
        .await
        .map_err(|_| AppError::not_found("MP4 output missing on disk"))?
        .len();

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        warn!("failed to open {:?}: {e}", path);
        AppError::internal("MP4 output not accessible")
    })?;

    if let Some(range_header) = headers.get(header::RANGE)
        && let Ok(range_str) = range_header.to_str()
        && let Some(range) = parse_range_header(range_str, file_size)
    {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut file = file;
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| AppError::internal(format!("seek failed: {e}")))?;

        let content_length = range.end - range.start + 1;
        let stream = ReaderStream::new(file.take(content_length));

        return Ok(Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_LENGTH, content_length.to_string())
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, file_size),
            )
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CACHE_CONTROL, "private, no-store")
            .body(Body::from_stream(stream))
            .expect("failed to build PARTIAL_CONTENT response"));
    }

    let stream = ReaderStream::new(file);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "private, no-store")
        .body(Body::from_stream(stream))
        .expect("failed to build OK response"))
}

#[derive(Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

fn parse_range_header(range_str: &str, file_size: u64) -> Option<ByteRange> {
    let range_part = range_str.strip_prefix("bytes=")?;
    let (start_str, end_str) = range_part.split_once('-')?;

    let start = if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        file_size.saturating_sub(suffix_len)
    } else {
        start_str.parse().ok()?
    };

    let end = if start_str.is_empty() || end_str.is_empty() {
        file_size.saturating_sub(1)
    } else {
        std::cmp::min(end_str.parse().ok()?, file_size.saturating_sub(1))
    };

    if start <= end && start < file_size {
        Some(ByteRange { start, end })
    } else {
        None
    }
}

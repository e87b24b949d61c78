use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a media item, from catalog request to streamable ladder.
///
/// `Ready` and `Error` are terminal; they are left only through an explicit
/// re-download reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    Requested,
    Downloading,
    DownloadComplete,
    Transcoding,
    Ready,
    Error,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Downloading => "DOWNLOADING",
            Self::DownloadComplete => "DOWNLOAD_COMPLETE",
            Self::Transcoding => "TRANSCODING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUESTED" => Some(Self::Requested),
            "DOWNLOADING" => Some(Self::Downloading),
            "DOWNLOAD_COMPLETE" => Some(Self::DownloadComplete),
            "TRANSCODING" => Some(Self::Transcoding),
            "READY" => Some(Self::Ready),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Any state may move to `Error`. `Ready` and `Error` accept nothing
    /// else; resetting them goes through the re-download command, which
    /// rewrites the record rather than transitioning it.
    pub fn can_transition(&self, to: MediaStatus) -> bool {
        if *self == to {
            return true;
        }
        match (self, to) {
            (_, MediaStatus::Error) => !matches!(self, MediaStatus::Ready),
            (MediaStatus::Requested, MediaStatus::Downloading) => true,
            (MediaStatus::Downloading, MediaStatus::DownloadComplete) => true,
            (MediaStatus::Downloading, MediaStatus::Transcoding) => true,
            (MediaStatus::DownloadComplete, MediaStatus::Transcoding) => true,
            (MediaStatus::Transcoding, MediaStatus::Ready) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

/// Durable per-item record, keyed by the external catalog identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    /// External catalog identifier (opaque, e.g. `tt0111161`).
    pub id: String,
    pub status: MediaStatus,
    /// Display title, used by the title-directed video file walk.
    pub title: Option<String>,
    /// Opaque handle minted by the external downloader.
    pub downloader_handle: Option<String>,
    pub source_uri: Option<String>,
    /// Source quality rung selected from the catalog (input, not output).
    pub selected_rung: Option<String>,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
    /// Percentage in [0, 100], two decimal places.
    pub download_progress: f64,
    /// Directory the downloader writes into.
    pub download_path: Option<PathBuf>,
    /// The specific video file inside `download_path`.
    pub source_video_path: Option<PathBuf>,
    pub transcode_progress: f64,
    /// Output rungs currently advertised as streamable, lowest first.
    pub available_rungs: Vec<String>,
    /// Single-file MP4 output, when the SINGLE_MP4 mode ran.
    pub transcoded_path: Option<PathBuf>,
    pub fully_transcoded: bool,
    pub error_message: Option<String>,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: MediaStatus::Requested,
            title: None,
            downloader_handle: None,
            source_uri: None,
            selected_rung: None,
            total_bytes: 0,
            downloaded_bytes: 0,
            download_progress: 0.0,
            download_path: None,
            source_video_path: None,
            transcode_progress: 0.0,
            available_rungs: Vec::new(),
            transcoded_path: None,
            fully_transcoded: false,
            error_message: None,
            last_watched_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Compute a download percentage with two decimal places.
///
/// Unknown totals (0) report 0 rather than dividing by zero.
pub fn download_percent(downloaded: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let pct = downloaded as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

/// What kind of output a transcode job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    HlsLadder,
    SingleMp4,
}

/// One entry in the adaptive bitrate ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RungSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Video bitrate in bits per second.
    pub video_bitrate: u64,
    /// Audio bitrate in bits per second.
    pub audio_bitrate: u64,
    /// Suffix used in output filenames (`output_<suffix>.m3u8`).
    pub filename_suffix: String,
}

impl RungSpec {
    /// Combined bandwidth advertised in the master playlist.
    pub fn bandwidth(&self) -> u64 {
        self.video_bitrate + self.audio_bitrate
    }
}

/// Encoding knobs carried inside a job; defaults come from [`crate::config::Settings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeOptions {
    pub segment_seconds: u32,
    pub rungs: Vec<RungSpec>,
    pub preset: String,
    pub crf: u32,
    pub enable_thumbnails: bool,
    pub enable_parallel: bool,
    pub max_parallel: usize,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            segment_seconds: 10,
            rungs: Vec::new(),
            preset: "veryfast".to_string(),
            crf: 28,
            enable_thumbnails: true,
            enable_parallel: true,
            max_parallel: 2,
        }
    }
}

/// Ephemeral job descriptor pushed onto the queue by the monitor and
/// consumed exactly once by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub kind: JobKind,
    pub item_id: String,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub options: TranscodeOptions,
}

/// Probe output persisted as `metadata.json` in the item's HLS directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub bitrate: Option<u64>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub file_size: u64,
}

/// Phase reported through the ephemeral live-status key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStage {
    Queued,
    Downloading,
    Transcoding,
    /// At least one rung is streamable (or the whole job finished).
    Ready,
    Error,
    /// Set by the recovery sweeper; tells the monitor to re-enqueue once.
    Recovered,
}

/// Machine-readable error surfaced through live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveError {
    pub code: String,
    pub message: String,
}

/// Ephemeral per-item status, overwritten in place by monitor and worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStatus {
    pub status: LiveStage,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VideoMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_rungs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_for_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LiveError>,
}

impl LiveStatus {
    pub fn stage(status: LiveStage, progress: f64) -> Self {
        Self {
            status,
            progress,
            message: None,
            metadata: None,
            available_rungs: None,
            available_for_streaming: None,
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: LiveStage::Error,
            progress: 0.0,
            message: Some(message.clone()),
            metadata: None,
            available_rungs: None,
            available_for_streaming: None,
            error: Some(LiveError {
                code: code.into(),
                message,
            }),
        }
    }
}

/// Heartbeat published by the worker every 30 seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

impl WorkerHealth {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            last_seen: Utc::now(),
        }
    }
}

//! Thin adapter over the external downloader's JSON-RPC surface.

mod rpc;

pub use rpc::JsonRpcDownloader;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// State the downloader reports for one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
}

impl DownloadState {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "waiting" => Self::Waiting,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "removed" => Self::Removed,
            _ => Self::Error,
        }
    }
}

/// One file inside a download, as announced by the downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFile {
    pub path: PathBuf,
    pub length: u64,
}

/// Point-in-time view of one download.
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    /// Opaque downloader-scoped handle (aria2 calls this a GID).
    pub handle: String,
    pub state: DownloadState,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    /// Directory the download is written into.
    pub dir: Option<PathBuf>,
    pub files: Vec<DownloadFile>,
    pub info_hash: Option<String>,
}

impl DownloadSnapshot {
    pub fn is_complete(&self) -> bool {
        self.state == DownloadState::Complete
            || (self.total_length > 0 && self.completed_length >= self.total_length)
    }
}

/// Options passed alongside `add_uri`.
#[derive(Debug, Clone, Default)]
pub struct AddUriOptions {
    /// Target directory; the downloader's default when absent.
    pub dir: Option<PathBuf>,
}

/// The five RPC calls the pipeline uses. Implemented over JSON-RPC for the
/// real downloader; mocked in monitor tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DownloaderClient: Send + Sync {
    /// Start a download from magnet-style URIs; returns the handle.
    async fn add_uri(&self, uris: Vec<String>, options: AddUriOptions) -> Result<String>;

    async fn tell_status(&self, handle: &str) -> Result<DownloadSnapshot>;

    /// All currently downloading entries.
    async fn tell_active(&self) -> Result<Vec<DownloadSnapshot>>;

    /// A window into stopped (completed, errored, removed) entries.
    async fn tell_stopped(&self, offset: i64, count: u32) -> Result<Vec<DownloadSnapshot>>;

    /// Remove a download; best-effort, callers log failures.
    async fn remove(&self, handle: &str) -> Result<()>;
}

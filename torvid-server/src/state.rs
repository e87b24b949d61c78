use std::sync::Arc;

use torvid_core::Settings;
use torvid_core::downloader::DownloaderClient;
use torvid_core::queue::{JobQueue, LiveStatusStore};
use torvid_core::records::MediaRecordStore;

/// Server application state: each component holds its own typed handle,
/// wired once at process start.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn MediaRecordStore>,
    pub live: Arc<dyn LiveStatusStore>,
    pub queue: Arc<dyn JobQueue>,
    pub downloader: Arc<dyn DownloaderClient>,
    pub settings: Arc<Settings>,
}

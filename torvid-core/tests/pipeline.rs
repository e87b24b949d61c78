//! Pipeline tests wiring the monitor, recovery sweeper, and in-memory
//! stores against a scripted downloader.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

use torvid_core::config::Settings;
use torvid_core::downloader::{
    AddUriOptions, DownloadFile, DownloadSnapshot, DownloadState, DownloaderClient,
};
use torvid_core::error::{PipelineError, Result};
use torvid_core::monitor::DownloadMonitor;
use torvid_core::queue::{InMemoryJobQueue, InMemoryLiveStatusStore, JobQueue, LiveStatusStore};
use torvid_core::records::{InMemoryMediaRecordStore, MediaRecordStore};
use torvid_core::transcode::RecoverySweeper;
use torvid_core::types::{LiveStage, MediaRecord, MediaStatus, VideoMetadata};

/// Downloader stub fed with scripted snapshots.
#[derive(Default)]
struct ScriptedDownloader {
    active: Mutex<Vec<DownloadSnapshot>>,
    stopped: Mutex<Vec<DownloadSnapshot>>,
}

impl ScriptedDownloader {
    fn set_active(&self, snapshots: Vec<DownloadSnapshot>) {
        *self.active.lock().unwrap() = snapshots;
    }

    fn set_stopped(&self, snapshots: Vec<DownloadSnapshot>) {
        *self.stopped.lock().unwrap() = snapshots;
    }
}

#[async_trait]
impl DownloaderClient for ScriptedDownloader {
    async fn add_uri(&self, _uris: Vec<String>, _options: AddUriOptions) -> Result<String> {
        Ok("gid-scripted".to_string())
    }

    async fn tell_status(&self, handle: &str) -> Result<DownloadSnapshot> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .chain(self.stopped.lock().unwrap().iter())
            .find(|s| s.handle == handle)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(handle.to_string()))
    }

    async fn tell_active(&self) -> Result<Vec<DownloadSnapshot>> {
        Ok(self.active.lock().unwrap().clone())
    }

    async fn tell_stopped(&self, _offset: i64, _count: u32) -> Result<Vec<DownloadSnapshot>> {
        Ok(self.stopped.lock().unwrap().clone())
    }

    async fn remove(&self, _handle: &str) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    downloader: Arc<ScriptedDownloader>,
    records: Arc<InMemoryMediaRecordStore>,
    queue: Arc<InMemoryJobQueue>,
    live: Arc<InMemoryLiveStatusStore>,
    monitor: DownloadMonitor,
    media_root: TempDir,
}

fn harness() -> Harness {
    let media_root = TempDir::new().unwrap();
    let downloader = Arc::new(ScriptedDownloader::default());
    let records = Arc::new(InMemoryMediaRecordStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let live = Arc::new(InMemoryLiveStatusStore::new());

    let settings = Settings {
        media_root: media_root.path().to_path_buf(),
        ..Settings::default()
    };

    let monitor = DownloadMonitor::new(
        downloader.clone(),
        records.clone(),
        queue.clone(),
        live.clone(),
        settings,
    );

    Harness {
        downloader,
        records,
        queue,
        live,
        monitor,
        media_root,
    }
}

async fn seed_downloading(records: &InMemoryMediaRecordStore, id: &str, handle: &str) {
    let mut record = MediaRecord::new(id);
    record.status = MediaStatus::Downloading;
    record.downloader_handle = Some(handle.to_string());
    records.put(&record).await.unwrap();
}

async fn write_big_file(path: &Path, len: u64) {
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    let file = tokio::fs::File::create(path).await.unwrap();
    file.set_len(len).await.unwrap();
}

fn snapshot(
    handle: &str,
    state: DownloadState,
    completed: u64,
    total: u64,
    video: Option<(PathBuf, u64)>,
) -> DownloadSnapshot {
    DownloadSnapshot {
        handle: handle.to_string(),
        state,
        total_length: total,
        completed_length: completed,
        download_speed: 0,
        dir: video
            .as_ref()
            .and_then(|(p, _)| p.parent().map(Path::to_path_buf)),
        files: video
            .map(|(path, length)| vec![DownloadFile { path, length }])
            .unwrap_or_default(),
        info_hash: None,
    }
}

const CLOSED: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:10.0,\nseg.ts\n#EXT-X-ENDLIST\n";

async fn write_metadata(dir: &Path, width: u32, height: u32) {
    tokio::fs::create_dir_all(dir).await.unwrap();
    let metadata = VideoMetadata {
        duration_seconds: 1200.0,
        width,
        height,
        bitrate: None,
        fps: None,
        video_codec: Some("h264".into()),
        audio_codec: Some("aac".into()),
        file_size: 1,
    };
    tokio::fs::write(
        dir.join("metadata.json"),
        serde_json::to_vec(&metadata).unwrap(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn progressive_threshold_triggers_once_crossed() {
    let h = harness();
    seed_downloading(&h.records, "tt0111161", "gid1").await;

    let video = h.media_root.path().join("dl/movie.mkv");
    write_big_file(&video, 120_000_000).await;

    // Below the 5%-of-2GB threshold: progress recorded, nothing enqueued.
    h.downloader.set_active(vec![snapshot(
        "gid1",
        DownloadState::Active,
        99_000_000,
        2_000_000_000,
        Some((video.clone(), 1_999_000_000)),
    )]);
    h.monitor.run_tick().await.unwrap();

    let record = h.records.get("tt0111161").await.unwrap().unwrap();
    assert_eq!(record.status, MediaStatus::Downloading);
    assert_eq!(record.downloaded_bytes, 99_000_000);
    assert_eq!(record.download_progress, 4.95);
    assert!(h.queue.is_empty());

    // Crossing 100 MB (= 5% of 2 GB) fires exactly one job.
    h.downloader.set_active(vec![snapshot(
        "gid1",
        DownloadState::Active,
        100_000_000,
        2_000_000_000,
        Some((video.clone(), 1_999_000_000)),
    )]);
    h.monitor.run_tick().await.unwrap();

    let record = h.records.get("tt0111161").await.unwrap().unwrap();
    assert_eq!(record.status, MediaStatus::Transcoding);
    assert_eq!(record.source_video_path, Some(video.clone()));

    let job = h
        .queue
        .pop_blocking(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.item_id, "tt0111161");
    assert_eq!(job.input_path, video);
    assert_eq!(
        job.output_dir,
        h.media_root.path().join("tt0111161_hls")
    );
}

#[tokio::test]
async fn unknown_total_needs_the_absolute_floor() {
    let h = harness();
    seed_downloading(&h.records, "tt1", "gid1").await;

    let video = h.media_root.path().join("dl/movie.mkv");
    write_big_file(&video, 120_000_000).await;

    // total_bytes unknown: 99 MB is not enough.
    h.downloader.set_active(vec![snapshot(
        "gid1",
        DownloadState::Active,
        99_999_999,
        0,
        Some((video.clone(), 120_000_000)),
    )]);
    h.monitor.run_tick().await.unwrap();
    assert!(h.queue.is_empty());

    h.downloader.set_active(vec![snapshot(
        "gid1",
        DownloadState::Active,
        100_000_000,
        0,
        Some((video, 120_000_000)),
    )]);
    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn duplicate_triggers_collapse_to_one_job() {
    let h = harness();
    seed_downloading(&h.records, "tt2", "gid2").await;

    let video = h.media_root.path().join("dl/movie.mkv");
    write_big_file(&video, 500_000_000).await;

    // The same cycle observes the item both active-above-threshold and
    // stopped-complete.
    let active = snapshot(
        "gid2",
        DownloadState::Active,
        500_000_000,
        500_000_000,
        Some((video.clone(), 500_000_000)),
    );
    let stopped = snapshot(
        "gid2",
        DownloadState::Complete,
        500_000_000,
        500_000_000,
        Some((video.clone(), 500_000_000)),
    );
    h.downloader.set_active(vec![active]);
    h.downloader.set_stopped(vec![stopped]);

    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.queue.len(), 1);

    // Nor does the next tick double up while the job is in flight.
    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn stopped_complete_wins_for_downloading_items() {
    let h = harness();
    seed_downloading(&h.records, "tt3", "gid3").await;

    let video = h.media_root.path().join("dl/movie.mkv");
    write_big_file(&video, 200_000_000).await;

    h.downloader.set_stopped(vec![snapshot(
        "gid3",
        DownloadState::Complete,
        200_000_000,
        200_000_000,
        Some((video.clone(), 200_000_000)),
    )]);
    h.monitor.run_tick().await.unwrap();

    let record = h.records.get("tt3").await.unwrap().unwrap();
    assert_eq!(record.status, MediaStatus::Transcoding);
    assert_eq!(record.download_progress, 100.0);
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn completion_sweep_promotes_finished_directories() {
    let h = harness();

    let mut record = MediaRecord::new("tt4");
    record.status = MediaStatus::Transcoding;
    record.transcode_progress = 80.0;
    h.records.put(&record).await.unwrap();

    // 854x480 source: the expected ladder is 360p + 480p.
    let hls = h.media_root.path().join("tt4_hls");
    write_metadata(&hls, 854, 480).await;
    tokio::fs::write(hls.join("output_360p.m3u8"), CLOSED)
        .await
        .unwrap();

    // One of two playlists closed: not finished yet.
    h.monitor.run_tick().await.unwrap();
    let mid = h.records.get("tt4").await.unwrap().unwrap();
    assert_eq!(mid.status, MediaStatus::Transcoding);

    tokio::fs::write(hls.join("output_480p.m3u8"), CLOSED)
        .await
        .unwrap();
    h.monitor.run_tick().await.unwrap();

    let done = h.records.get("tt4").await.unwrap().unwrap();
    assert_eq!(done.status, MediaStatus::Ready);
    assert_eq!(done.transcode_progress, 100.0);
    assert_eq!(done.available_rungs, vec!["360p", "480p"]);

    let live = h.live.fetch("tt4").await.unwrap().unwrap();
    assert_eq!(live.status, LiveStage::Ready);
}

#[tokio::test]
async fn steady_state_tick_is_idempotent() {
    let h = harness();

    let mut record = MediaRecord::new("tt5");
    record.status = MediaStatus::Ready;
    record.transcode_progress = 100.0;
    record.available_rungs = vec!["480p".to_string()];
    h.records.put(&record).await.unwrap();

    let before = h.records.get("tt5").await.unwrap().unwrap();
    h.monitor.run_tick().await.unwrap();
    h.monitor.run_tick().await.unwrap();
    let after = h.records.get("tt5").await.unwrap().unwrap();

    assert_eq!(before.status, after.status);
    assert_eq!(before.transcode_progress, after.transcode_progress);
    assert_eq!(before.available_rungs, after.available_rungs);
    assert_eq!(before.downloaded_bytes, after.downloaded_bytes);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn worker_restart_reenqueues_within_one_tick() {
    let h = harness();

    // Orphaned mid-encode: durable record says TRANSCODING at 42%.
    let source = h.media_root.path().join("dl/movie.mkv");
    write_big_file(&source, 200_000_000).await;

    let mut record = MediaRecord::new("tt6");
    record.status = MediaStatus::Transcoding;
    record.transcode_progress = 42.0;
    record.source_video_path = Some(source.clone());
    h.records.put(&record).await.unwrap();

    let hls = h.media_root.path().join("tt6_hls");
    tokio::fs::create_dir_all(&hls).await.unwrap();
    for name in ["output_480p_000.ts", "output_480p_001.ts", "output_480p_002.ts",
                 "output_720p_000.ts", "output_480p.m3u8"] {
        tokio::fs::write(hls.join(name), b"x").await.unwrap();
    }

    // Worker start: recovery sweep prunes and flags.
    let sweeper = RecoverySweeper::new(h.records.clone(), h.live.clone());
    let recovered = sweeper.sweep(h.media_root.path()).await.unwrap();
    assert_eq!(recovered, vec!["tt6"]);
    assert!(!hls.join("output_480p_000.ts").exists());

    // Monitor restart in the same incident: the single-flight set is
    // rebuilt from TRANSCODING records, yet the recovered flag still
    // forces exactly one re-enqueue.
    h.monitor.restore_in_flight().await.unwrap();
    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.queue.len(), 1);

    let record = h.records.get("tt6").await.unwrap().unwrap();
    assert_eq!(record.status, MediaStatus::Transcoding);
    assert_eq!(record.transcode_progress, 0.0);

    let live = h.live.fetch("tt6").await.unwrap().unwrap();
    assert_eq!(live.status, LiveStage::Queued);

    // And only one: the next tick must not enqueue again.
    h.monitor.run_tick().await.unwrap();
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn missed_completion_sweep_uses_bound_source() {
    let h = harness();

    let source = h.media_root.path().join("dl/movie.mkv");
    write_big_file(&source, 150_000_000).await;

    let mut record = MediaRecord::new("tt7");
    record.status = MediaStatus::Downloading;
    record.source_video_path = Some(source.clone());
    record.total_bytes = 150_000_000;
    h.records.put(&record).await.unwrap();

    h.monitor.run_tick().await.unwrap();

    let record = h.records.get("tt7").await.unwrap().unwrap();
    assert_eq!(record.status, MediaStatus::Transcoding);
    assert_eq!(h.queue.len(), 1);
}

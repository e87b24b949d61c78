//! Periodic reconciliation between the external downloader, the durable
//! media records, and the job queue.

pub mod locate;

use dashmap::DashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::downloader::{DownloadSnapshot, DownloadState, DownloaderClient};
use crate::error::Result;
use crate::playlist::all_rungs_closed;
use crate::queue::{JobQueue, LiveStatusStore};
use crate::records::MediaRecordStore;
use crate::transcode::worker::expected_rungs_for_dir;
use crate::types::{
    JobKind, LiveStage, LiveStatus, MediaRecord, MediaStatus, TranscodeJob, TranscodeOptions,
};

use locate::locate_video_file;

/// Progressive threshold floor: with this many bytes on disk a transcode
/// can start even when the total size is unknown.
pub const PROGRESSIVE_MIN_BYTES: u64 = 100_000_000;

/// Fraction of the total that must be present before a transcode starts.
const PROGRESSIVE_FRACTION: f64 = 0.05;

/// Window size for the stopped-download reconciliation.
const STOPPED_WINDOW: u32 = 100;

/// Bytes needed before a transcode may start on a download of `total`
/// bytes: `max(5% of total, 100 MB)`; just the floor when total is unknown.
pub fn progressive_threshold(total_bytes: i64) -> u64 {
    if total_bytes <= 0 {
        return PROGRESSIVE_MIN_BYTES;
    }
    let fraction = (total_bytes as f64 * PROGRESSIVE_FRACTION) as u64;
    fraction.max(PROGRESSIVE_MIN_BYTES)
}

/// The download monitor. One tick runs four sweeps in order:
///
/// 1. missed completions (records say DOWNLOADING but the file is whole),
/// 2. transcode completions (all expected playlists closed on disk),
/// 3. active-download reconciliation against the downloader,
/// 4. stopped-download reconciliation.
///
/// Duplicate transcode triggers collapse through an in-memory single-flight
/// set: an id is admitted before its job is enqueued and released only when
/// its record reaches READY or ERROR. The set is rebuilt from records in
/// TRANSCODING at start, so a monitor restart cannot double-enqueue a
/// running encode.
pub struct DownloadMonitor {
    downloader: Arc<dyn DownloaderClient>,
    records: Arc<dyn MediaRecordStore>,
    queue: Arc<dyn JobQueue>,
    live: Arc<dyn LiveStatusStore>,
    settings: Settings,
    in_flight: DashSet<String>,
    shutdown: Arc<RwLock<bool>>,
}

impl DownloadMonitor {
    pub fn new(
        downloader: Arc<dyn DownloaderClient>,
        records: Arc<dyn MediaRecordStore>,
        queue: Arc<dyn JobQueue>,
        live: Arc<dyn LiveStatusStore>,
        settings: Settings,
    ) -> Self {
        Self {
            downloader,
            records,
            queue,
            live,
            settings,
            in_flight: DashSet::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn the tick loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.restore_in_flight().await {
                error!("failed to restore single-flight set: {e}");
            }

            info!(
                "download monitor started, tick every {:?}",
                self.settings.monitor.tick_interval
            );
            let mut ticker = interval(self.settings.monitor.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if *self.shutdown.read().await {
                    info!("download monitor shutting down");
                    break;
                }
                if let Err(e) = self.run_tick().await {
                    error!("monitor tick failed: {e}");
                }
            }
        })
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Rebuild the single-flight set from records already in TRANSCODING.
    pub async fn restore_in_flight(&self) -> Result<()> {
        for record in self.records.list_by_status(MediaStatus::Transcoding).await? {
            self.in_flight.insert(record.id);
        }
        if !self.in_flight.is_empty() {
            info!("restored {} in-flight transcode(s)", self.in_flight.len());
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn in_flight_contains(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }

    /// One full reconciliation pass. Public so tests can tick manually.
    pub async fn run_tick(&self) -> Result<()> {
        self.prune_in_flight().await;
        self.sweep_missed_completions().await?;
        self.sweep_transcoding().await?;

        // The RPC half of the tick: a downloader failure logs and ends the
        // tick without touching any record.
        let active = match self.downloader.tell_active().await {
            Ok(active) => active,
            Err(e) => {
                warn!("tellActive failed, skipping rest of tick: {e}");
                return Ok(());
            }
        };
        self.reconcile_active(active).await;

        let stopped = match self.downloader.tell_stopped(0, STOPPED_WINDOW).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!("tellStopped failed, skipping rest of tick: {e}");
                return Ok(());
            }
        };
        self.reconcile_stopped(stopped).await;

        Ok(())
    }

    /// Drop single-flight entries whose records reached READY or ERROR (or
    /// vanished); those are the worker's terminal signals.
    async fn prune_in_flight(&self) {
        let held: Vec<String> = self.in_flight.iter().map(|id| id.key().clone()).collect();
        for id in held {
            match self.records.get(&id).await {
                Ok(Some(record)) if !record.status.is_terminal() => {}
                Ok(_) => {
                    debug!("releasing single-flight entry for {id}");
                    self.in_flight.remove(&id);
                }
                Err(e) => warn!("could not check {id} for release: {e}"),
            }
        }
    }

    /// Sweep 1: items the downloader finished while nobody was looking.
    async fn sweep_missed_completions(&self) -> Result<()> {
        for record in self.records.list_by_status(MediaStatus::Downloading).await? {
            let Some(source) = record.source_video_path.clone() else {
                continue;
            };
            let Ok(meta) = tokio::fs::metadata(&source).await else {
                continue;
            };

            let nearly_whole = record.total_bytes > 0
                && meta.len() as f64 >= record.total_bytes as f64 * 0.99;
            if nearly_whole || meta.len() >= PROGRESSIVE_MIN_BYTES {
                info!("missed completion for {}, enqueueing transcode", record.id);
                self.enqueue_transcode(&record, source).await;
            }
        }
        Ok(())
    }

    /// Sweep 2: finish or revive items in TRANSCODING based on disk state.
    async fn sweep_transcoding(&self) -> Result<()> {
        for record in self.records.list_by_status(MediaStatus::Transcoding).await? {
            let hls_dir = self.settings.hls_dir(&record.id);

            if let Some(expected) = expected_rungs_for_dir(&hls_dir).await
                && all_rungs_closed(&hls_dir, &expected).await
            {
                let names: Vec<String> = expected.iter().map(|r| r.name.clone()).collect();
                info!("{} complete on disk, marking ready", record.id);
                if let Err(e) = self.records.mark_ready(&record.id, &names).await {
                    warn!("failed to mark {} ready: {e}", record.id);
                    continue;
                }
                let mut status = LiveStatus::stage(LiveStage::Ready, 100.0);
                status.available_rungs = Some(names);
                status.available_for_streaming = Some(true);
                let _ = self.live.publish(&record.id, &status).await;
                self.in_flight.remove(&record.id);
                continue;
            }

            // A `recovered` live status is the sweeper telling us the
            // worker restarted mid-encode; re-enqueue exactly once.
            let live = self.live.fetch(&record.id).await.unwrap_or(None);
            if live.is_some_and(|l| l.status == LiveStage::Recovered) {
                let Some(source) = record.source_video_path.clone() else {
                    continue;
                };
                info!("re-enqueueing recovered transcode for {}", record.id);
                self.in_flight.remove(&record.id);
                self.enqueue_transcode(&record, source).await;
            }
        }
        Ok(())
    }

    /// Sweep 3: mirror the downloader's active set into the records and
    /// fire transcodes that crossed the progressive threshold.
    async fn reconcile_active(&self, active: Vec<DownloadSnapshot>) {
        for snapshot in active {
            let record = match self.records.find_by_handle(&snapshot.handle).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!("lookup for handle {} failed: {e}", snapshot.handle);
                    continue;
                }
            };

            if let Err(e) = self
                .records
                .update_download(
                    &record.id,
                    snapshot.completed_length as i64,
                    snapshot.total_length as i64,
                    snapshot.dir.as_deref(),
                )
                .await
            {
                warn!("progress write for {} failed: {e}", record.id);
                continue;
            }

            let threshold = progressive_threshold(snapshot.total_length as i64);
            if record.status == MediaStatus::Downloading
                && snapshot.completed_length >= threshold
            {
                self.try_locate_and_enqueue(&record, &snapshot).await;
            }
        }
    }

    /// Sweep 4: downloads the downloader already finished. A "complete"
    /// report wins over partial-progress bookkeeping.
    async fn reconcile_stopped(&self, stopped: Vec<DownloadSnapshot>) {
        for snapshot in stopped {
            if snapshot.state != DownloadState::Complete {
                continue;
            }
            let record = match self.records.find_by_handle(&snapshot.handle).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!("lookup for handle {} failed: {e}", snapshot.handle);
                    continue;
                }
            };
            if record.status.is_terminal() || record.status == MediaStatus::Transcoding {
                continue;
            }

            if let Err(e) = self
                .records
                .update_download(
                    &record.id,
                    snapshot.completed_length as i64,
                    snapshot.total_length as i64,
                    snapshot.dir.as_deref(),
                )
                .await
            {
                warn!("progress write for {} failed: {e}", record.id);
                continue;
            }

            self.try_locate_and_enqueue(&record, &snapshot).await;
        }
    }

    /// Locate the video file for a snapshot and enqueue if found. A failed
    /// location leaves the record untouched for the next tick.
    async fn try_locate_and_enqueue(&self, record: &MediaRecord, snapshot: &DownloadSnapshot) {
        let download_dir = snapshot
            .dir
            .clone()
            .or_else(|| record.download_path.clone());

        let located = locate_video_file(
            &snapshot.files,
            download_dir.as_deref(),
            record.title.as_deref(),
        )
        .await;

        match located {
            Some(source) => self.enqueue_transcode(record, source).await,
            None => debug!("no video file locatable yet for {}", record.id),
        }
    }

    /// Admit the item into the single-flight set, bind its source, flip it
    /// to TRANSCODING, and push the job. A duplicate trigger is a no-op.
    async fn enqueue_transcode(&self, record: &MediaRecord, source: PathBuf) {
        if !self.in_flight.insert(record.id.clone()) {
            debug!("transcode for {} already in flight", record.id);
            return;
        }

        let result = self.enqueue_inner(record, source).await;
        if let Err(e) = result {
            warn!("enqueue for {} failed: {e}", record.id);
            self.in_flight.remove(&record.id);
        }
    }

    async fn enqueue_inner(&self, record: &MediaRecord, source: PathBuf) -> Result<()> {
        self.records.bind_source_video(&record.id, &source).await?;
        self.records
            .set_status(&record.id, MediaStatus::Transcoding)
            .await?;

        let transcode = &self.settings.transcode;
        let job = TranscodeJob {
            kind: JobKind::HlsLadder,
            item_id: record.id.clone(),
            input_path: source,
            output_dir: self.settings.hls_dir(&record.id),
            options: TranscodeOptions {
                segment_seconds: transcode.segment_seconds,
                rungs: Vec::new(),
                preset: transcode.preset.clone(),
                crf: transcode.crf,
                enable_thumbnails: transcode.enable_thumbnails,
                enable_parallel: transcode.max_parallel > 1,
                max_parallel: transcode.max_parallel,
            },
        };
        self.queue.push(&job).await?;

        let _ = self
            .live
            .publish(&record.id, &LiveStatus::stage(LiveStage::Queued, 0.0))
            .await;
        info!("transcode job enqueued for {}", record.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::MockDownloaderClient;
    use crate::queue::{InMemoryJobQueue, InMemoryLiveStatusStore};
    use crate::records::InMemoryMediaRecordStore;

    #[test]
    fn threshold_is_five_percent_with_a_floor() {
        assert_eq!(progressive_threshold(0), PROGRESSIVE_MIN_BYTES);
        assert_eq!(progressive_threshold(-1), PROGRESSIVE_MIN_BYTES);
        // 5% of 2 GB is exactly the floor.
        assert_eq!(progressive_threshold(2_000_000_000), 100_000_000);
        // 5% of 10 GB beats the floor.
        assert_eq!(progressive_threshold(10_000_000_000), 500_000_000);
        // Small downloads still need the full floor.
        assert_eq!(progressive_threshold(500_000_000), PROGRESSIVE_MIN_BYTES);
    }

    #[tokio::test]
    async fn rpc_failure_aborts_tick_without_mutations() {
        let mut downloader = MockDownloaderClient::new();
        downloader
            .expect_tell_active()
            .returning(|| Err(crate::error::PipelineError::Downloader("down".into())));
        downloader.expect_tell_stopped().never();

        let records = Arc::new(InMemoryMediaRecordStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let live = Arc::new(InMemoryLiveStatusStore::new());

        let mut record = MediaRecord::new("tt1");
        record.status = MediaStatus::Downloading;
        record.downloaded_bytes = 12345;
        records.put(&record).await.unwrap();

        let monitor = DownloadMonitor::new(
            Arc::new(downloader),
            records.clone(),
            queue.clone(),
            live,
            Settings::default(),
        );

        // The tick itself succeeds; the failure is logged and swallowed.
        monitor.run_tick().await.unwrap();

        let after = records.get("tt1").await.unwrap().unwrap();
        assert_eq!(after.status, MediaStatus::Downloading);
        assert_eq!(after.downloaded_bytes, 12345);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn restore_rebuilds_single_flight_from_records() {
        let mut downloader = MockDownloaderClient::new();
        downloader.expect_tell_active().returning(|| Ok(Vec::new()));
        downloader.expect_tell_stopped().returning(|_, _| Ok(Vec::new()));

        let records = Arc::new(InMemoryMediaRecordStore::new());
        let mut record = MediaRecord::new("tt2");
        record.status = MediaStatus::Transcoding;
        records.put(&record).await.unwrap();

        let monitor = DownloadMonitor::new(
            Arc::new(downloader),
            records,
            Arc::new(InMemoryJobQueue::new()),
            Arc::new(InMemoryLiveStatusStore::new()),
            Settings::default(),
        );

        monitor.restore_in_flight().await.unwrap();
        assert!(monitor.in_flight_contains("tt2"));
    }
}

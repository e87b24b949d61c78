//! One-shot reconciliation at worker start: any record still marked
//! TRANSCODING with partial progress was orphaned by a crash. Its HLS
//! directory is pruned and its live status flips to `recovered`, which the
//! monitor turns into a fresh enqueue on its next tick.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::queue::LiveStatusStore;
use crate::records::MediaRecordStore;
use crate::types::{LiveStage, LiveStatus, MediaStatus};

/// Extensions pruned from an orphaned HLS directory. Playlists, segments,
/// and any subtitle sidecars the previous run produced.
const PRUNED_EXTENSIONS: [&str; 3] = ["ts", "m3u8", "vtt"];

pub struct RecoverySweeper {
    records: Arc<dyn MediaRecordStore>,
    live: Arc<dyn LiveStatusStore>,
}

impl RecoverySweeper {
    pub fn new(records: Arc<dyn MediaRecordStore>, live: Arc<dyn LiveStatusStore>) -> Self {
        Self { records, live }
    }

    /// Run the sweep once. Returns the ids that were reset for re-enqueue.
    pub async fn sweep(&self, media_root: &Path) -> Result<Vec<String>> {
        let transcoding = self.records.list_by_status(MediaStatus::Transcoding).await?;
        let mut recovered = Vec::new();

        for record in transcoding {
            if record.transcode_progress >= 100.0 {
                continue;
            }

            info!(
                "recovering interrupted transcode for {} ({}% done)",
                record.id, record.transcode_progress
            );

            let source_ok = match &record.source_video_path {
                Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                None => false,
            };
            if !source_ok {
                warn!("source video for {} is gone, marking errored", record.id);
                self.records
                    .set_error(&record.id, "video file not found")
                    .await?;
                self.live
                    .publish(
                        &record.id,
                        &LiveStatus::error("missing_source", "video file not found"),
                    )
                    .await?;
                continue;
            }

            let hls_dir = media_root.join(format!("{}_hls", record.id));
            if let Err(e) = prune_hls_dir(&hls_dir).await {
                warn!("failed to prune {:?}: {e}", hls_dir);
                continue;
            }

            self.records.set_transcode_progress(&record.id, 0.0).await?;
            self.records.set_available_rungs(&record.id, &[]).await?;
            self.live
                .publish(&record.id, &LiveStatus::stage(LiveStage::Recovered, 0.0))
                .await?;

            recovered.push(record.id);
        }

        if !recovered.is_empty() {
            info!("recovery sweep reset {} item(s)", recovered.len());
        }
        Ok(recovered)
    }
}

/// Delete stale transcode outputs, leaving `metadata.json` and thumbnails
/// in place.
async fn prune_hls_dir(dir: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        // Nothing written yet; nothing to prune.
        Err(_) => return Ok(()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let prune = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| PRUNED_EXTENSIONS.contains(&ext));
        if prune {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryLiveStatusStore;
    use crate::records::InMemoryMediaRecordStore;
    use crate::types::MediaRecord;
    use tempfile::TempDir;

    async fn seed(
        store: &InMemoryMediaRecordStore,
        id: &str,
        progress: f64,
        source: Option<&Path>,
    ) {
        let mut record = MediaRecord::new(id);
        record.status = MediaStatus::Transcoding;
        record.transcode_progress = progress;
        record.source_video_path = source.map(Path::to_path_buf);
        store.put(&record).await.unwrap();
    }

    #[tokio::test]
    async fn prunes_partial_output_and_flags_recovery() {
        let media_root = TempDir::new().unwrap();
        let source_dir = TempDir::new().unwrap();
        let source = source_dir.path().join("movie.mkv");
        tokio::fs::write(&source, b"video").await.unwrap();

        let hls = media_root.path().join("tt1_hls");
        tokio::fs::create_dir_all(&hls).await.unwrap();
        for name in [
            "output_480p_000.ts",
            "output_480p_001.ts",
            "output_480p_002.ts",
            "output_720p_000.ts",
            "output_480p.m3u8",
            "metadata.json",
        ] {
            tokio::fs::write(hls.join(name), b"x").await.unwrap();
        }

        let records = Arc::new(InMemoryMediaRecordStore::new());
        let live = Arc::new(InMemoryLiveStatusStore::new());
        seed(&records, "tt1", 42.0, Some(&source)).await;

        let sweeper = RecoverySweeper::new(records.clone(), live.clone());
        let recovered = sweeper.sweep(media_root.path()).await.unwrap();
        assert_eq!(recovered, vec!["tt1"]);

        // Segments and playlists are gone, the probe cache stays.
        assert!(!hls.join("output_480p_000.ts").exists());
        assert!(!hls.join("output_720p_000.ts").exists());
        assert!(!hls.join("output_480p.m3u8").exists());
        assert!(hls.join("metadata.json").exists());

        let record = records.get("tt1").await.unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Transcoding);
        assert_eq!(record.transcode_progress, 0.0);
        assert!(record.available_rungs.is_empty());

        let status = live.fetch("tt1").await.unwrap().unwrap();
        assert_eq!(status.status, LiveStage::Recovered);
    }

    #[tokio::test]
    async fn missing_source_becomes_error() {
        let media_root = TempDir::new().unwrap();
        let records = Arc::new(InMemoryMediaRecordStore::new());
        let live = Arc::new(InMemoryLiveStatusStore::new());
        seed(&records, "tt2", 10.0, Some(Path::new("/gone/movie.mkv"))).await;

        let sweeper = RecoverySweeper::new(records.clone(), live.clone());
        let recovered = sweeper.sweep(media_root.path()).await.unwrap();
        assert!(recovered.is_empty());

        let record = records.get("tt2").await.unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("video file not found"));
    }

    #[tokio::test]
    async fn finished_items_are_left_alone() {
        let media_root = TempDir::new().unwrap();
        let records = Arc::new(InMemoryMediaRecordStore::new());
        let live = Arc::new(InMemoryLiveStatusStore::new());
        seed(&records, "tt3", 100.0, None).await;

        let sweeper = RecoverySweeper::new(records.clone(), live.clone());
        assert!(sweeper.sweep(media_root.path()).await.unwrap().is_empty());

        let record = records.get("tt3").await.unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Transcoding);
        assert_eq!(record.transcode_progress, 100.0);
    }
}

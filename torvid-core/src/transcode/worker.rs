use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::config::TranscodeSettings;
use crate::error::{PipelineError, Result};
use crate::playlist::count_segments;
use crate::queue::{JobQueue, LiveStatusStore};
use crate::records::MediaRecordStore;
use crate::types::{
    JobKind, LiveStage, LiveStatus, RungSpec, TranscodeJob, VideoMetadata, WorkerHealth,
};

use super::hardware::{self, HardwareAccel};
use super::hls::{build_rung_command, expected_segment_count};
use super::ladder::{default_ladder, filter_by_source, interleave_outside_in};
use super::mp4::transcode_single_mp4;
use super::probe::probe_video;
use super::recovery::RecoverySweeper;
use super::thumbnails::generate_thumbnails;

/// Progress is split into phases: 10% for validation and probing, 70%
/// shared across rung encodes, the rest for finalization. Sampled progress
/// never exceeds the cap until the job finishes.
const PROBE_PROGRESS: f64 = 10.0;
const ENCODE_PROGRESS_SPAN: f64 = 70.0;
const PROGRESS_CAP: f64 = 80.0;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Long-running consumer of the job queue. One job is drained to
/// completion per loop iteration; within a job, up to `max_parallel`
/// encoder child processes run concurrently.
pub struct TranscodeWorker {
    queue: Arc<dyn JobQueue>,
    records: Arc<dyn MediaRecordStore>,
    live: Arc<dyn LiveStatusStore>,
    settings: TranscodeSettings,
    media_root: PathBuf,
    shutdown: Arc<RwLock<bool>>,
}

impl TranscodeWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        records: Arc<dyn MediaRecordStore>,
        live: Arc<dyn LiveStatusStore>,
        settings: TranscodeSettings,
        media_root: PathBuf,
    ) -> Self {
        Self {
            queue,
            records,
            live,
            settings,
            media_root,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn the worker loop. The recovery sweep runs before the first pop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let sweeper = RecoverySweeper::new(self.records.clone(), self.live.clone());
            if let Err(e) = sweeper.sweep(&self.media_root).await {
                error!("recovery sweep failed: {e}");
            }

            let hw = if self.settings.hardware_accel {
                hardware::detect(&self.settings.ffmpeg_path).await
            } else {
                None
            };

            info!("transcode worker started");
            loop {
                if *self.shutdown.read().await {
                    info!("transcode worker shutting down");
                    break;
                }

                match self.queue.pop_blocking(self.settings.pop_timeout).await {
                    Ok(Some(job)) => {
                        let item_id = job.item_id.clone();
                        if let Err(e) = self.process_job(job, hw).await {
                            error!("job for {item_id} failed: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("queue pop failed: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Publish `worker_health` every 30 seconds until aborted.
    pub fn spawn_heartbeat(live: Arc<dyn LiveStatusStore>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = live.publish_heartbeat(&WorkerHealth::healthy()).await {
                    warn!("heartbeat publish failed: {e}");
                }
            }
        })
    }

    /// Dispatch one decoded job.
    pub async fn process_job(&self, job: TranscodeJob, hw: Option<HardwareAccel>) -> Result<()> {
        info!("processing {:?} job for {}", job.kind, job.item_id);
        match job.kind {
            JobKind::HlsLadder => self.run_ladder(job, hw).await,
            JobKind::SingleMp4 => self.run_single_mp4(job).await,
        }
    }

    async fn run_ladder(&self, job: TranscodeJob, hw: Option<HardwareAccel>) -> Result<()> {
        let item_id = job.item_id.clone();

        if !input_usable(&job.input_path).await {
            return self
                .fail_item(&item_id, "input_missing", "source video file missing or empty")
                .await;
        }

        self.publish_progress(&item_id, 5.0, &[]).await;

        let metadata = match probe_video(&self.settings.ffprobe_path, &job.input_path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                // Leave no partial output behind for a corrupt source.
                let _ = tokio::fs::remove_dir_all(&job.output_dir).await;
                return self.fail_item(&item_id, "input_corrupt", &e.to_string()).await;
            }
        };

        tokio::fs::create_dir_all(&job.output_dir).await?;
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;
        tokio::fs::write(job.output_dir.join("metadata.json"), metadata_json).await?;

        let requested = if job.options.rungs.is_empty() {
            default_ladder()
        } else {
            job.options.rungs.clone()
        };
        let selected = filter_by_source(requested, &metadata);
        if selected.is_empty() {
            return self
                .fail_item(
                    &item_id,
                    "no_rungs",
                    "source resolution is below the smallest ladder rung",
                )
                .await;
        }

        let ordered = interleave_outside_in(selected);
        let total_rungs = ordered.len();
        let expected_segments =
            expected_segment_count(metadata.duration_seconds, job.options.segment_seconds);

        let mut live_status = LiveStatus::stage(LiveStage::Transcoding, PROBE_PROGRESS);
        live_status.metadata = Some(metadata.clone());
        let _ = self.live.publish(&item_id, &live_status).await;
        let _ = self
            .records
            .set_transcode_progress(&item_id, PROBE_PROGRESS)
            .await;

        let batch_size = if job.options.enable_parallel {
            job.options.max_parallel.max(1)
        } else {
            1
        };

        let mut completed: Vec<RungSpec> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        for batch in ordered.chunks(batch_size) {
            let mut encodes = JoinSet::new();
            for rung in batch {
                let ffmpeg = self.settings.ffmpeg_path.clone();
                let input = job.input_path.clone();
                let output_dir = job.output_dir.clone();
                let options = job.options.clone();
                let rung = rung.clone();
                encodes.spawn(async move {
                    let result = run_rung_encode(&ffmpeg, &input, &output_dir, &rung, &options, hw)
                        .await;
                    (rung, result)
                });
            }

            let mut active: Vec<String> = batch.iter().map(|r| r.name.clone()).collect();
            let mut sampler = interval(self.settings.sample_interval);
            sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    joined = encodes.join_next() => {
                        let Some(joined) = joined else { break };
                        match joined {
                            Ok((rung, Ok(()))) => {
                                active.retain(|name| *name != rung.name);
                                info!("rung {} finished for {item_id}", rung.name);
                                completed.push(rung);
                                self.publish_rungs_available(&item_id, &completed).await;
                            }
                            Ok((rung, Err(e))) => {
                                active.retain(|name| *name != rung.name);
                                warn!("rung {} failed for {item_id}: {e}", rung.name);
                                failed.push(rung.name.clone());
                            }
                            Err(join_err) => {
                                error!("encode task panicked for {item_id}: {join_err}");
                            }
                        }
                    }
                    _ = sampler.tick() => {
                        let progress = self
                            .sampled_progress(
                                &job.output_dir,
                                total_rungs,
                                completed.len(),
                                &active,
                                expected_segments,
                            )
                            .await;
                        self.publish_progress(&item_id, progress, &completed).await;
                    }
                }
            }
        }

        if completed.is_empty() {
            return self
                .fail_item(
                    &item_id,
                    "encode_failed",
                    &format!("all rungs failed to encode ({})", failed.join(", ")),
                )
                .await;
        }

        if job.options.enable_thumbnails {
            if let Err(e) = generate_thumbnails(
                &self.settings.ffmpeg_path,
                &job.input_path,
                &job.output_dir,
                metadata.duration_seconds,
            )
            .await
            {
                warn!("thumbnails for {item_id} failed: {e}");
            }
        }

        // Advertise rungs lowest-bandwidth first regardless of finish order.
        completed.sort_by_key(RungSpec::bandwidth);
        let rung_names: Vec<String> = completed.iter().map(|r| r.name.clone()).collect();

        self.records.mark_ready(&item_id, &rung_names).await?;
        let mut done = LiveStatus::stage(LiveStage::Ready, 100.0);
        done.available_rungs = Some(rung_names.clone());
        done.available_for_streaming = Some(true);
        done.metadata = Some(metadata);
        let _ = self.live.publish(&item_id, &done).await;

        info!("{item_id} ready with rungs [{}]", rung_names.join(", "));
        Ok(())
    }

    async fn run_single_mp4(&self, job: TranscodeJob) -> Result<()> {
        let item_id = job.item_id.clone();

        if !input_usable(&job.input_path).await {
            return self
                .fail_item(&item_id, "input_missing", "source video file missing or empty")
                .await;
        }

        let metadata = match probe_video(&self.settings.ffprobe_path, &job.input_path).await {
            Ok(metadata) => metadata,
            Err(e) => return self.fail_item(&item_id, "input_corrupt", &e.to_string()).await,
        };

        let final_path = job.output_dir.join(format!("{item_id}.mp4"));
        let result = transcode_single_mp4(
            &self.settings.ffmpeg_path,
            &job.input_path,
            &final_path,
            metadata.duration_seconds,
            &self.settings.preset,
            self.live.clone(),
            &item_id,
        )
        .await;

        if let Err(e) = result {
            return self.fail_item(&item_id, "encode_failed", &e.to_string()).await;
        }

        self.records
            .set_transcoded_path(&item_id, &final_path, true)
            .await?;
        self.records.set_transcode_progress(&item_id, 100.0).await?;
        self.records
            .set_status(&item_id, crate::types::MediaStatus::Ready)
            .await?;

        let mut done = LiveStatus::stage(LiveStage::Ready, 100.0);
        done.available_for_streaming = Some(true);
        let _ = self.live.publish(&item_id, &done).await;
        Ok(())
    }

    /// Progress from the on-disk segment counts of the rungs still encoding.
    async fn sampled_progress(
        &self,
        output_dir: &Path,
        total_rungs: usize,
        completed: usize,
        active: &[String],
        expected_segments: usize,
    ) -> f64 {
        let share = ENCODE_PROGRESS_SPAN / total_rungs.max(1) as f64;
        let mut progress = PROBE_PROGRESS + completed as f64 * share;
        if expected_segments > 0 {
            for rung in active {
                let segments = count_segments(output_dir, rung).await;
                progress += (segments as f64 / expected_segments as f64).min(1.0) * share;
            }
        }
        progress.min(PROGRESS_CAP)
    }

    async fn publish_progress(&self, item_id: &str, progress: f64, completed: &[RungSpec]) {
        let mut status = LiveStatus::stage(LiveStage::Transcoding, progress);
        if !completed.is_empty() {
            status.available_rungs =
                Some(completed.iter().map(|r| r.name.clone()).collect());
            status.available_for_streaming = Some(true);
        }
        let _ = self.live.publish(item_id, &status).await;
        let _ = self.records.set_transcode_progress(item_id, progress).await;
    }

    /// Called as each rung lands. The first completed rung flips the item
    /// to streamable while the rest of the ladder is still encoding.
    async fn publish_rungs_available(&self, item_id: &str, completed: &[RungSpec]) {
        let mut rungs: Vec<RungSpec> = completed.to_vec();
        rungs.sort_by_key(RungSpec::bandwidth);
        let names: Vec<String> = rungs.iter().map(|r| r.name.clone()).collect();

        if let Err(e) = self.records.set_available_rungs(item_id, &names).await {
            warn!("failed to persist available rungs for {item_id}: {e}");
        }

        if completed.len() == 1 {
            let mut status = LiveStatus::stage(LiveStage::Ready, PROGRESS_CAP);
            status.available_for_streaming = Some(true);
            status.available_rungs = Some(names);
            status.message = Some("first rung ready, streaming unlocked".to_string());
            let _ = self.live.publish(item_id, &status).await;
        }
    }

    /// Terminal failure for an item: durable ERROR plus a machine-readable
    /// live status.
    async fn fail_item(&self, item_id: &str, code: &str, message: &str) -> Result<()> {
        error!("{item_id} failed ({code}): {message}");
        self.records.set_error(item_id, message).await?;
        let _ = self
            .live
            .publish(item_id, &LiveStatus::error(code, message))
            .await;
        Ok(())
    }
}

async fn input_usable(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Run one rung encode to completion, retrying in software when a hardware
/// encoder refuses the stream.
async fn run_rung_encode(
    ffmpeg_path: &str,
    input: &Path,
    output_dir: &Path,
    rung: &RungSpec,
    options: &crate::types::TranscodeOptions,
    hw: Option<HardwareAccel>,
) -> Result<()> {
    if let Some(hw_accel) = hw {
        match run_ffmpeg(build_rung_command(
            ffmpeg_path,
            input,
            output_dir,
            rung,
            options,
            Some(hw_accel),
        ))
        .await
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "hardware encode of rung {} failed, retrying in software: {e}",
                    rung.name
                );
            }
        }
    }

    run_ffmpeg(build_rung_command(
        ffmpeg_path,
        input,
        output_dir,
        rung,
        options,
        None,
    ))
    .await
}

async fn run_ffmpeg(mut cmd: tokio::process::Command) -> Result<()> {
    let output = cmd
        .stdout(std::process::Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(PipelineError::InvalidMedia(format!(
            "ffmpeg exited with {}: {}",
            output.status.code().unwrap_or(-1),
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        )));
    }
    Ok(())
}

/// Re-derive the rung set a finished directory should contain, given its
/// persisted probe metadata. Used by the monitor's completion sweep.
pub async fn expected_rungs_for_dir(dir: &Path) -> Option<Vec<RungSpec>> {
    let raw = tokio::fs::read(dir.join("metadata.json")).await.ok()?;
    let metadata: VideoMetadata = serde_json::from_slice(&raw).ok()?;
    let rungs = filter_by_source(default_ladder(), &metadata);
    if rungs.is_empty() { None } else { Some(rungs) }
}

//! Single-file MP4 transcode: the simpler of the two job kinds. One 720p
//! H.264 encode, written to a temp path and atomically renamed so readers
//! never observe a partial file.

use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::queue::LiveStatusStore;
use crate::types::{LiveStage, LiveStatus};

const MP4_CRF: u32 = 23;

/// Run the single-MP4 encode, sampling progress from ffmpeg's stderr
/// time marks. Returns when the final file is in place.
pub async fn transcode_single_mp4(
    ffmpeg_path: &str,
    input: &Path,
    final_path: &Path,
    duration_seconds: f64,
    preset: &str,
    live: Arc<dyn LiveStatusStore>,
    item_id: &str,
) -> Result<()> {
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = final_path.with_extension("mp4.part");

    let mut cmd = Command::new(ffmpeg_path);
    cmd.arg("-hide_banner")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-map")
        .arg("0:v:0")
        .arg("-map")
        .arg("0:a:0?")
        .arg("-c:v")
        .arg("libx264")
        .arg("-preset")
        .arg(preset)
        .arg("-crf")
        .arg(MP4_CRF.to_string())
        .arg("-vf")
        .arg("scale=-2:720")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-c:a")
        .arg("aac")
        .arg("-ac")
        .arg("2")
        .arg("-movflags")
        .arg("+faststart")
        .arg("-f")
        .arg("mp4")
        .arg(&tmp_path);

    info!("starting MP4 transcode for {item_id}");

    let mut child = cmd
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut last_error_line = String::new();

    if let Some(stderr) = child.stderr.take() {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        let mut last_published = -1.0_f64;

        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                last_error_line = line.clone();
            }
            let Some(seconds) = parse_time_mark(&line) else {
                continue;
            };
            let progress = if duration_seconds > 0.0 {
                ((seconds / duration_seconds) * 100.0).min(99.0)
            } else {
                0.0
            };
            // Publish on whole-percent changes only.
            if progress.floor() > last_published {
                last_published = progress.floor();
                debug!("{item_id} MP4 progress {:.0}%", progress);
                let _ = live
                    .publish(item_id, &LiveStatus::stage(LiveStage::Transcoding, progress))
                    .await;
            }
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(PipelineError::InvalidMedia(format!(
            "MP4 encode exited with {}: {}",
            status.code().unwrap_or(-1),
            last_error_line
        )));
    }

    // Atomic publish: readers only ever see the finished file.
    tokio::fs::rename(&tmp_path, final_path).await?;
    info!("MP4 transcode for {item_id} finished at {:?}", final_path);

    Ok(())
}

/// Pull the `time=HH:MM:SS.ss` mark out of an ffmpeg progress line.
pub fn parse_time_mark(line: &str) -> Option<f64> {
    let start = line.find("time=")? + "time=".len();
    let rest = &line[start..];
    let token = rest.split_whitespace().next()?;
    if token == "N/A" {
        return None;
    }
    parse_clock(token)
}

/// Parse `HH:MM:SS.ss` into seconds.
fn parse_clock(token: &str) -> Option<f64> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_marks() {
        let line = "frame= 1234 fps= 30.0 q=28.0 size=   12345kB time=00:00:41.36 \
             bitrate= 244.8kbits/s speed=1.23x";
        let seconds = parse_time_mark(line).unwrap();
        assert!((seconds - 41.36).abs() < 0.001);
    }

    #[test]
    fn parses_hours() {
        assert_eq!(parse_time_mark("time=02:20:00.00"), Some(8400.0));
    }

    #[test]
    fn ignores_lines_without_marks() {
        assert_eq!(parse_time_mark("Stream mapping:"), None);
        assert_eq!(parse_time_mark("time=N/A bitrate=N/A"), None);
        assert_eq!(parse_time_mark("time=bogus"), None);
    }

    #[tokio::test]
    async fn failed_encode_cleans_temp_file() {
        use crate::queue::InMemoryLiveStatusStore;

        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("in.mkv");
        tokio::fs::write(&input, b"not a real video").await.unwrap();
        let final_path = dir.path().join("out/tt1.mp4");

        let live = Arc::new(InMemoryLiveStatusStore::new());
        // `false` is a convenient always-failing stand-in for ffmpeg.
        let result = transcode_single_mp4(
            "false",
            &input,
            &final_path,
            60.0,
            "veryfast",
            live,
            "tt1",
        )
        .await;

        assert!(result.is_err());
        assert!(!final_path.exists());
        assert!(!final_path.with_extension("mp4.part").exists());
    }
}

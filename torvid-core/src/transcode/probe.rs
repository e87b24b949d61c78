use serde_json::Value;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::types::VideoMetadata;

/// Run one ffprobe invocation and distill the fields the pipeline needs.
///
/// Corrupted inputs (zero duration, zero dimensions, a missing container
/// index) surface as `InvalidMedia` with a message naming the cause; they
/// are terminal for the item and never retried automatically.
pub async fn probe_video(ffprobe_path: &str, input: &Path) -> Result<VideoMetadata> {
    let file_size = tokio::fs::metadata(input).await?.len();
    if file_size == 0 {
        return Err(PipelineError::InvalidMedia(
            "file is empty, may be corrupted".to_string(),
        ));
    }

    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("ffprobe stderr: {}", stderr.trim());
        if stderr.contains("moov atom not found") {
            return Err(PipelineError::InvalidMedia(
                "file may be corrupted: moov atom not found".to_string(),
            ));
        }
        if stderr.contains("Invalid data found") {
            return Err(PipelineError::InvalidMedia(
                "file may be corrupted: invalid data in container".to_string(),
            ));
        }
        return Err(PipelineError::InvalidMedia(format!(
            "probe failed: {}",
            stderr.lines().next().unwrap_or("unknown error")
        )));
    }

    let json: Value = serde_json::from_slice(&output.stdout)
        .map_err(|_| PipelineError::InvalidMedia("probe produced unreadable output".to_string()))?;

    parse_probe_output(&json, file_size)
}

/// Distill ffprobe's JSON into [`VideoMetadata`], validating the fields a
/// transcode cannot do without.
pub fn parse_probe_output(json: &Value, file_size: u64) -> Result<VideoMetadata> {
    let streams = json["streams"].as_array();

    let video_stream = streams
        .and_then(|s| {
            s.iter()
                .find(|st| st["codec_type"].as_str() == Some("video"))
        })
        .ok_or_else(|| {
            PipelineError::InvalidMedia("no video stream found, file may be corrupted".to_string())
        })?;

    let audio_stream = streams.and_then(|s| {
        s.iter()
            .find(|st| st["codec_type"].as_str() == Some("audio"))
    });

    let duration_seconds = json["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            video_stream["duration"]
                .as_str()
                .and_then(|d| d.parse().ok())
        })
        .unwrap_or(0.0);

    let width = video_stream["width"].as_u64().unwrap_or(0) as u32;
    let height = video_stream["height"].as_u64().unwrap_or(0) as u32;

    if duration_seconds <= 0.0 {
        return Err(PipelineError::InvalidMedia(
            "no duration in container, file may be corrupted".to_string(),
        ));
    }
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidMedia(
            "video dimensions missing, file may be corrupted".to_string(),
        ));
    }

    let bitrate = json["format"]["bit_rate"]
        .as_str()
        .and_then(|b| b.parse().ok());

    let fps = video_stream["r_frame_rate"]
        .as_str()
        .and_then(parse_frame_rate);

    Ok(VideoMetadata {
        duration_seconds,
        width,
        height,
        bitrate,
        fps,
        video_codec: video_stream["codec_name"].as_str().map(str::to_string),
        audio_codec: audio_stream.and_then(|s| s["codec_name"].as_str().map(str::to_string)),
        file_size,
    })
}

/// ffprobe reports frame rate as a ratio like `24000/1001`.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 { None } else { Some(num / den) }
        }
        None => raw.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe_json(duration: &str, width: u64, height: u64) -> Value {
        json!({
            "format": {"duration": duration, "bit_rate": "5823000"},
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": width,
                    "height": height,
                    "r_frame_rate": "24000/1001"
                },
                {"codec_type": "audio", "codec_name": "aac"}
            ]
        })
    }

    #[test]
    fn parses_a_healthy_probe() {
        let meta = parse_probe_output(&probe_json("8400.000000", 1920, 1080), 2_000_000_000)
            .unwrap();
        assert_eq!(meta.duration_seconds, 8400.0);
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.height, 1080);
        assert_eq!(meta.bitrate, Some(5_823_000));
        assert_eq!(meta.video_codec.as_deref(), Some("h264"));
        assert_eq!(meta.audio_codec.as_deref(), Some("aac"));
        assert!((meta.fps.unwrap() - 23.976).abs() < 0.001);
    }

    #[test]
    fn zero_duration_is_corrupt() {
        let err = parse_probe_output(&probe_json("0.000000", 1920, 1080), 100).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMedia(_)));
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn zero_dimensions_are_corrupt() {
        let err = parse_probe_output(&probe_json("60.0", 0, 0), 100).unwrap_err();
        assert!(err.to_string().contains("dimensions"));
    }

    #[test]
    fn missing_video_stream_is_corrupt() {
        let json = json!({"format": {"duration": "60.0"}, "streams": []});
        let err = parse_probe_output(&json, 100).unwrap_err();
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    fn frame_rate_ratios() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert_eq!(parse_frame_rate("24000/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[tokio::test]
    async fn zero_byte_file_short_circuits_before_probing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.mp4");
        tokio::fs::write(&path, b"").await.unwrap();

        // The binary path is bogus on purpose: the size check must reject
        // the file before any process is spawned.
        let err = probe_video("/nonexistent/ffprobe", &path).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}

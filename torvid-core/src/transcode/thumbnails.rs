use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Result;

/// How many scrub thumbnails to render for a given duration: one per five
/// minutes, clamped to [3, 10].
pub fn thumbnail_count(duration_seconds: f64) -> u32 {
    ((duration_seconds / 300.0).round() as u32).clamp(3, 10)
}

/// Render evenly spaced PNG thumbnails into `<output_dir>/thumbnails/`.
///
/// Failures are logged and swallowed; thumbnails are cosmetic and never
/// fail a job.
pub async fn generate_thumbnails(
    ffmpeg_path: &str,
    input: &Path,
    output_dir: &Path,
    duration_seconds: f64,
) -> Result<()> {
    let count = thumbnail_count(duration_seconds);
    let thumb_dir = output_dir.join("thumbnails");
    tokio::fs::create_dir_all(&thumb_dir).await?;

    // fps = count / duration yields exactly `count` evenly spaced frames.
    let fps = count as f64 / duration_seconds;

    let output = Command::new(ffmpeg_path)
        .arg("-hide_banner")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-vf")
        .arg(format!("fps={fps:.8},scale=320:-1"))
        .arg("-frames:v")
        .arg(count.to_string())
        .arg(thumb_dir.join("thumb_%03d.png").as_os_str())
        .output()
        .await?;

    if output.status.success() {
        debug!("rendered {count} thumbnails into {:?}", thumb_dir);
    } else {
        warn!(
            "thumbnail generation failed: {}",
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .last()
                .unwrap_or("unknown error")
        );
    }

    Ok(())
}

use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Platform video encoder the worker can hand encodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareAccel {
    Vaapi,
    Nvenc,
    VideoToolbox,
}

impl HardwareAccel {
    /// The H.264 encoder name ffmpeg exposes for this accelerator.
    pub fn h264_encoder(&self) -> &'static str {
        match self {
            Self::Vaapi => "h264_vaapi",
            Self::Nvenc => "h264_nvenc",
            Self::VideoToolbox => "h264_videotoolbox",
        }
    }

    pub fn hwaccel_name(&self) -> &'static str {
        match self {
            Self::Vaapi => "vaapi",
            Self::Nvenc => "cuda",
            Self::VideoToolbox => "videotoolbox",
        }
    }
}

/// Detect a usable hardware encoder by asking ffmpeg what it was built with
/// and checking for the platform device.
pub async fn detect(ffmpeg_path: &str) -> Option<HardwareAccel> {
    let output = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let encoders = String::from_utf8_lossy(&output.stdout);

    if encoders.contains("h264_vaapi") && Path::new("/dev/dri/renderD128").exists() {
        info!("hardware encoder detected: VAAPI");
        return Some(HardwareAccel::Vaapi);
    }

    if encoders.contains("h264_nvenc") && Path::new("/dev/nvidia0").exists() {
        info!("hardware encoder detected: NVENC");
        return Some(HardwareAccel::Nvenc);
    }

    #[cfg(target_os = "macos")]
    if encoders.contains("h264_videotoolbox") {
        info!("hardware encoder detected: VideoToolbox");
        return Some(HardwareAccel::VideoToolbox);
    }

    debug!("no hardware encoder available, using software x264");
    None
}

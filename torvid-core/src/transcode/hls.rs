use std::path::Path;
use tokio::process::Command;

use crate::playlist::rung_playlist_name;
use crate::types::{RungSpec, TranscodeOptions};

use super::hardware::HardwareAccel;

/// Build the ffmpeg invocation for one HLS rung encode.
///
/// Output is an event playlist: appendable while the encode runs, so
/// players can reload it and start playback mid-transcode. Segment files
/// follow `output_<rung>_%03d.ts`, which the progress sampler and the
/// serving surface both rely on.
pub fn build_rung_command(
    ffmpeg_path: &str,
    input: &Path,
    output_dir: &Path,
    rung: &RungSpec,
    options: &TranscodeOptions,
    hw: Option<HardwareAccel>,
) -> Command {
    let mut cmd = Command::new(ffmpeg_path);

    cmd.arg("-hide_banner");
    cmd.arg("-y");

    // Oversized probe window; torrent sources often have odd interleaving.
    cmd.arg("-probesize").arg("50M");
    cmd.arg("-analyzeduration").arg("100M");

    // Hardware decode args must precede the input.
    if let Some(hw) = hw {
        cmd.arg("-hwaccel").arg(hw.hwaccel_name());
        if hw == HardwareAccel::Vaapi {
            cmd.arg("-hwaccel_device").arg("/dev/dri/renderD128");
        }
    }

    cmd.arg("-i").arg(input);

    cmd.arg("-map").arg("0:v:0");
    cmd.arg("-map").arg("0:a:0?");

    match hw {
        Some(hw) => {
            cmd.arg("-c:v").arg(hw.h264_encoder());
        }
        None => {
            cmd.arg("-c:v").arg("libx264");
            cmd.arg("-preset").arg(&options.preset);
            cmd.arg("-crf").arg(options.crf.to_string());
        }
    }

    cmd.arg("-profile:v").arg("main");
    cmd.arg("-level:v").arg("4.0");
    cmd.arg("-pix_fmt").arg("yuv420p");

    cmd.arg("-vf")
        .arg(format!("scale={}:{}", rung.width, rung.height));
    cmd.arg("-maxrate").arg(rung.video_bitrate.to_string());
    cmd.arg("-bufsize").arg((rung.video_bitrate * 2).to_string());

    cmd.arg("-c:a").arg("aac");
    cmd.arg("-ac").arg("2");
    cmd.arg("-ar").arg("44100");
    cmd.arg("-b:a").arg(rung.audio_bitrate.to_string());

    cmd.arg("-movflags").arg("+faststart");

    cmd.arg("-f").arg("hls");
    cmd.arg("-hls_time").arg(options.segment_seconds.to_string());
    cmd.arg("-hls_playlist_type").arg("event");
    cmd.arg("-hls_list_size").arg("0");
    cmd.arg("-hls_flags").arg("independent_segments+append_list");
    cmd.arg("-hls_segment_filename").arg(
        output_dir
            .join(format!("output_{}_%03d.ts", rung.filename_suffix))
            .as_os_str(),
    );

    // Keyframes aligned to segment boundaries keep segment durations even.
    cmd.arg("-force_key_frames").arg(format!(
        "expr:gte(t,n_forced*{})",
        options.segment_seconds
    ));

    cmd.arg(output_dir.join(rung_playlist_name(&rung.name)).as_os_str());

    cmd
}

/// Expected segment count for a rung: `ceil(duration / segment_seconds)`.
pub fn expected_segment_count(duration_seconds: f64, segment_seconds: u32) -> usize {
    if duration_seconds <= 0.0 || segment_seconds == 0 {
        return 0;
    }
    (duration_seconds / segment_seconds as f64).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::ladder::rung_by_name;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn software_command_shape() {
        let rung = rung_by_name("480p").unwrap();
        let options = TranscodeOptions::default();
        let cmd = build_rung_command(
            "ffmpeg",
            Path::new("/in/movie.mkv"),
            Path::new("/out/tt1_hls"),
            &rung,
            &options,
            None,
        );
        let args = args_of(&cmd);

        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"veryfast".to_string()));
        assert!(args.contains(&"28".to_string()));
        assert!(args.contains(&"scale=854:480".to_string()));
        assert!(args.contains(&"event".to_string()));
        assert!(args.contains(&"independent_segments+append_list".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
        assert!(args.contains(&"/out/tt1_hls/output_480p_%03d.ts".to_string()));
        assert_eq!(args.last().unwrap(), "/out/tt1_hls/output_480p.m3u8");
    }

    #[test]
    fn hardware_command_uses_platform_encoder() {
        let rung = rung_by_name("720p").unwrap();
        let options = TranscodeOptions::default();
        let cmd = build_rung_command(
            "ffmpeg",
            Path::new("/in/movie.mkv"),
            Path::new("/out/tt1_hls"),
            &rung,
            &options,
            Some(HardwareAccel::Vaapi),
        );
        let args = args_of(&cmd);

        assert!(args.contains(&"h264_vaapi".to_string()));
        assert!(args.contains(&"vaapi".to_string()));
        assert!(!args.contains(&"libx264".to_string()));
    }

    #[test]
    fn segment_count_rounds_up() {
        assert_eq!(expected_segment_count(8400.0, 10), 840);
        assert_eq!(expected_segment_count(95.0, 10), 10);
        assert_eq!(expected_segment_count(91.0, 10), 10);
        assert_eq!(expected_segment_count(90.0, 10), 9);
        assert_eq!(expected_segment_count(0.0, 10), 0);
        assert_eq!(expected_segment_count(60.0, 0), 0);
    }
}

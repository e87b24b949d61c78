use crate::types::{RungSpec, VideoMetadata};

fn rung(name: &str, width: u32, height: u32, video_kbps: u64, audio_kbps: u64) -> RungSpec {
    RungSpec {
        name: name.to_string(),
        width,
        height,
        video_bitrate: video_kbps * 1000,
        audio_bitrate: audio_kbps * 1000,
        filename_suffix: name.to_string(),
    }
}

/// The default adaptive ladder, lowest rung first.
pub fn default_ladder() -> Vec<RungSpec> {
    vec![
        rung("360p", 640, 360, 800, 96),
        rung("480p", 854, 480, 1400, 128),
        rung("720p", 1280, 720, 2800, 192),
        rung("1080p", 1920, 1080, 5000, 192),
    ]
}

/// Look a rung up by name in the default ladder.
pub fn rung_by_name(name: &str) -> Option<RungSpec> {
    default_ladder().into_iter().find(|r| r.name == name)
}

/// Drop rungs whose dimensions strictly exceed the source; we only ever
/// downscale. A rung exactly matching the source stays in.
pub fn filter_by_source(rungs: Vec<RungSpec>, source: &VideoMetadata) -> Vec<RungSpec> {
    rungs
        .into_iter()
        .filter(|r| r.width <= source.width && r.height <= source.height)
        .collect()
}

/// Order rungs for parallel execution by interleaving from the outside in:
/// `[0, N-1, 1, N-2, ...]` for a lowest-first input. The lowest rung
/// finishes fastest and unblocks streaming; the highest (slowest) starts in
/// the same first batch.
pub fn interleave_outside_in(rungs: Vec<RungSpec>) -> Vec<RungSpec> {
    let mut ordered = Vec::with_capacity(rungs.len());
    let mut rungs: std::collections::VecDeque<RungSpec> = rungs.into();
    let mut from_front = true;
    while let Some(next) = if from_front {
        rungs.pop_front()
    } else {
        rungs.pop_back()
    } {
        ordered.push(next);
        from_front = !from_front;
    }
    ordered
}

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::downloader::DownloadFile;

/// Extensions a source video may carry.
pub const VIDEO_EXTENSIONS: [&str; 7] = ["mkv", "mp4", "avi", "mov", "wmv", "flv", "webm"];

/// Files smaller than this are samples, extras, or junk.
const MIN_VIDEO_BYTES: u64 = 10 * 1024 * 1024;

/// Minimum normalized-name overlap for the title-directed walk.
const TITLE_OVERLAP_CHARS: usize = 10;

pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Find the video file for a download, trying two heuristics in order:
///
/// 1. The downloader's announced file list: first video-extension entry
///    over 10 MiB whose path exists.
/// 2. A title-directed walk: an immediate sub-directory of the download
///    path whose normalized name overlaps the title's by at least 10
///    characters is searched recursively for the largest qualifying video.
pub async fn locate_video_file(
    announced: &[DownloadFile],
    download_path: Option<&Path>,
    title: Option<&str>,
) -> Option<PathBuf> {
    for file in announced {
        if is_video_path(&file.path)
            && file.length > MIN_VIDEO_BYTES
            && tokio::fs::try_exists(&file.path).await.unwrap_or(false)
        {
            debug!("located video via announced files: {:?}", file.path);
            return Some(file.path.clone());
        }
    }

    let title = title?;
    let download_path = download_path?;
    let wanted = normalize(title);

    let mut entries = tokio::fs::read_dir(download_path).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if common_substring_len(&normalize(&name), &wanted) < TITLE_OVERLAP_CHARS {
            continue;
        }

        if let Some(found) = largest_video_in(&path) {
            debug!("located video via title walk: {:?}", found);
            return Some(found);
        }
    }

    None
}

/// The largest qualifying video file anywhere under `dir`.
fn largest_video_in(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_video_path(entry.path()))
        .filter_map(|entry| {
            let len = entry.metadata().ok()?.len();
            (len > MIN_VIDEO_BYTES).then(|| (entry.into_path(), len))
        })
        .max_by_key(|(_, len)| *len)
        .map(|(path, _)| path)
}

/// Lowercased alphanumerics only; release names and titles differ mostly
/// in separators and tags.
fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Length of the longest common substring of `a` and `b`.
fn common_substring_len(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut best = 0;
    let mut prev = vec![0usize; b.len() + 1];
    for &ca in &a {
        let mut row = vec![0usize; b.len() + 1];
        for (j, &cb) in b.iter().enumerate() {
            if ca == cb {
                row[j + 1] = prev[j] + 1;
                best = best.max(row[j + 1]);
            }
        }
        prev = row;
    }
    best
}

//! HLS playlist inspection and master-playlist synthesis.
//!
//! The master playlist is never written to disk while transcoding; it is a
//! pure function of the rung playlists currently present in an item's HLS
//! directory, so the serving surface can materialize it on every request
//! and pick up newly finished rungs for free.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::transcode::ladder::rung_by_name;
use crate::types::RungSpec;

pub const ENDLIST_TAG: &str = "#EXT-X-ENDLIST";

/// `output_<rung>.m3u8` for a rung name.
pub fn rung_playlist_name(rung: &str) -> String {
    format!("output_{rung}.m3u8")
}

/// Parse a rung name out of `output_<rung>.m3u8`.
pub fn parse_rung_playlist_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix("output_")?
        .strip_suffix(".m3u8")
        .filter(|rung| !rung.is_empty() && !rung.contains('_'))
}

/// Rung playlists currently on disk, as (rung name, path) pairs.
pub async fn scan_rung_playlists(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(found),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(rung) = parse_rung_playlist_name(name) {
            found.push((rung.to_string(), entry.path()));
        }
    }

    Ok(found)
}

/// Whether a media playlist has been closed with `#EXT-X-ENDLIST`.
pub async fn playlist_is_closed(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .is_some_and(|l| l.trim() == ENDLIST_TAG),
        Err(_) => false,
    }
}

/// Whether a media playlist advertises at least one segment.
pub async fn playlist_has_segments(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content.lines().any(|l| l.starts_with("#EXTINF")),
        Err(_) => false,
    }
}

/// The authoritative streamability rule: any rung playlist exists and
/// carries at least one `#EXTINF` entry.
pub async fn can_stream(dir: &Path) -> bool {
    let Ok(playlists) = scan_rung_playlists(dir).await else {
        return false;
    };
    for (_, path) in playlists {
        if playlist_has_segments(&path).await {
            return true;
        }
    }
    false
}

/// Count `output_<rung>_*.ts` segment files for one rung.
pub async fn count_segments(dir: &Path, rung: &str) -> usize {
    let prefix = format!("output_{rung}_");
    let mut count = 0;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(&prefix)
            && name.ends_with(".ts")
        {
            count += 1;
        }
    }
    count
}

/// Synthesize the master playlist from the rung playlists present in `dir`.
///
/// Entries are ordered by ascending bandwidth. Returns `None` when no rung
/// playlist exists yet (the HTTP surface answers 404).
pub async fn synthesize_master(dir: &Path) -> Result<Option<String>> {
    let playlists = scan_rung_playlists(dir).await?;

    let mut rungs: Vec<RungSpec> = playlists
        .iter()
        .filter_map(|(name, _)| rung_by_name(name))
        .collect();

    if rungs.is_empty() {
        return Ok(None);
    }

    rungs.sort_by_key(RungSpec::bandwidth);

    let mut master = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rung in &rungs {
        master.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
            rung.bandwidth(),
            rung.width,
            rung.height,
            rung_playlist_name(&rung.name),
        ));
    }

    Ok(Some(master))
}

/// On-disk completeness check used by the monitor's completion sweep: every
/// expected rung playlist exists and is closed.
pub async fn all_rungs_closed(dir: &Path, expected: &[RungSpec]) -> bool {
    if expected.is_empty() {
        return false;
    }
    for rung in expected {
        let path = dir.join(rung_playlist_name(&rung.name));
        if !playlist_is_closed(&path).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const OPEN_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
        #EXT-X-PLAYLIST-TYPE:EVENT\n#EXTINF:10.0,\noutput_480p_000.ts\n";

    fn closed_playlist() -> String {
        format!("{OPEN_PLAYLIST}{ENDLIST_TAG}\n")
    }

    async fn write(dir: &TempDir, name: &str, content: &str) {
        tokio::fs::write(dir.path().join(name), content)
            .await
            .unwrap();
    }

    #[test]
    fn parses_rung_playlist_names() {
        assert_eq!(parse_rung_playlist_name("output_480p.m3u8"), Some("480p"));
        assert_eq!(parse_rung_playlist_name("output_1080p.m3u8"), Some("1080p"));
        // Segments and the master are not rung playlists.
        assert_eq!(parse_rung_playlist_name("output_480p_000.ts"), None);
        assert_eq!(parse_rung_playlist_name("master.m3u8"), None);
        assert_eq!(parse_rung_playlist_name("output_480p_000.m3u8"), None);
    }

    #[tokio::test]
    async fn master_is_none_without_playlists() {
        let dir = TempDir::new().unwrap();
        assert!(synthesize_master(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn master_lists_rungs_by_ascending_bandwidth() {
        let dir = TempDir::new().unwrap();
        write(&dir, "output_720p.m3u8", OPEN_PLAYLIST).await;
        write(&dir, "output_360p.m3u8", OPEN_PLAYLIST).await;

        let master = synthesize_master(dir.path()).await.unwrap().unwrap();
        let lines: Vec<_> = master.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert!(lines[2].starts_with("#EXT-X-STREAM-INF:BANDWIDTH=896000,RESOLUTION=640x360"));
        assert_eq!(lines[3], "output_360p.m3u8");
        assert!(lines[4].starts_with("#EXT-X-STREAM-INF:BANDWIDTH=2992000,RESOLUTION=1280x720"));
        assert_eq!(lines[5], "output_720p.m3u8");
    }

    #[tokio::test]
    async fn master_reflects_directory_growth() {
        let dir = TempDir::new().unwrap();
        write(&dir, "output_480p.m3u8", OPEN_PLAYLIST).await;

        let first = synthesize_master(dir.path()).await.unwrap().unwrap();
        assert_eq!(first.matches("#EXT-X-STREAM-INF").count(), 1);

        write(&dir, "output_1080p.m3u8", OPEN_PLAYLIST).await;
        let second = synthesize_master(dir.path()).await.unwrap().unwrap();
        assert_eq!(second.matches("#EXT-X-STREAM-INF").count(), 2);
    }

    #[tokio::test]
    async fn endlist_detection() {
        let dir = TempDir::new().unwrap();
        write(&dir, "output_480p.m3u8", OPEN_PLAYLIST).await;
        write(&dir, "output_720p.m3u8", &closed_playlist()).await;

        assert!(!playlist_is_closed(&dir.path().join("output_480p.m3u8")).await);
        assert!(playlist_is_closed(&dir.path().join("output_720p.m3u8")).await);
        assert!(!playlist_is_closed(&dir.path().join("missing.m3u8")).await);
    }

    #[tokio::test]
    async fn can_stream_requires_a_segment_entry() {
        let dir = TempDir::new().unwrap();
        assert!(!can_stream(dir.path()).await);

        write(&dir, "output_480p.m3u8", "#EXTM3U\n#EXT-X-VERSION:3\n").await;
        assert!(!can_stream(dir.path()).await);

        write(&dir, "output_480p.m3u8", OPEN_PLAYLIST).await;
        assert!(can_stream(dir.path()).await);
    }

    #[tokio::test]
    async fn counts_only_matching_segments() {
        let dir = TempDir::new().unwrap();
        for name in [
            "output_480p_000.ts",
            "output_480p_001.ts",
            "output_720p_000.ts",
            "output_480p.m3u8",
        ] {
            write(&dir, name, "x").await;
        }
        assert_eq!(count_segments(dir.path(), "480p").await, 2);
        assert_eq!(count_segments(dir.path(), "720p").await, 1);
        assert_eq!(count_segments(dir.path(), "1080p").await, 0);
    }

    #[tokio::test]
    async fn all_rungs_closed_needs_every_playlist() {
        let dir = TempDir::new().unwrap();
        let expected: Vec<_> = crate::transcode::ladder::default_ladder()
            .into_iter()
            .filter(|r| r.name == "480p" || r.name == "720p")
            .collect();

        write(&dir, "output_480p.m3u8", &closed_playlist()).await;
        assert!(!all_rungs_closed(dir.path(), &expected).await);

        write(&dir, "output_720p.m3u8", &closed_playlist()).await;
        assert!(all_rungs_closed(dir.path(), &expected).await);

        assert!(!all_rungs_closed(dir.path(), &[]).await);
    }
}

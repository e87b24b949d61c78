//! The transcode worker and its supporting pieces: probing, ladder
//! selection, ffmpeg command construction, recovery, and thumbnails.

pub mod hardware;
pub mod hls;
pub mod ladder;
pub mod mp4;
pub mod probe;
pub mod recovery;
pub mod thumbnails;
pub mod worker;

pub use recovery::RecoverySweeper;
pub use worker::TranscodeWorker;

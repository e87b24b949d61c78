//! # torvid-core
//!
//! The media pipeline behind torvid: a coupled pair of asynchronous state
//! machines — the download monitor and the transcode worker — mediated by
//! a persistent job queue and a durable per-item media record.
//!
//! The pipeline delivers three guarantees:
//!
//! - **Progressive availability**: the first finished rung unblocks
//!   streaming while the download and the rest of the ladder are still in
//!   flight.
//! - **Crash-safe resumability**: a restarted worker prunes orphaned HLS
//!   output and flags the items for re-enqueue; the monitor picks them up
//!   within one tick.
//! - **At-most-one transcode per item**: duplicate triggers collapse
//!   through the monitor's single-flight set.

pub mod config;
pub mod downloader;
pub mod error;
pub mod monitor;
pub mod playlist;
pub mod queue;
pub mod records;
pub mod transcode;
pub mod types;

pub use config::Settings;
pub use error::{PipelineError, Result};
pub use types::{
    JobKind, LiveStage, LiveStatus, MediaRecord, MediaStatus, RungSpec, TranscodeJob,
    TranscodeOptions, VideoMetadata, WorkerHealth,
};

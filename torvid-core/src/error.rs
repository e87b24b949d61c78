use thiserror::Error;

use crate::types::MediaStatus;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid media file: {0}")]
    InvalidMedia(String),

    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Downloader RPC error: {0}")]
    Downloader(String),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("Illegal status transition for {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: String,
        from: MediaStatus,
        to: MediaStatus,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

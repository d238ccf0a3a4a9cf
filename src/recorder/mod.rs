//! Live stream capture through an external encoder process

pub mod ffmpeg;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use ffmpeg::{FfmpegConfig, FfmpegRecorder};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Encoder exited with {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("Encoder {0} pipe unavailable")]
    Pipe(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordRequest {
    pub stream_url: String,
    pub output_path: PathBuf,
    /// Wall-clock cap passed to the encoder
    pub max_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutput {
    pub output_path: PathBuf,
    pub size: u64,
    /// Seconds between spawn and exit
    pub duration_secs: u64,
}

/// Captures a stream to a file without re-encoding
#[async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Record until the encoder exits or `cancel` fires.
    ///
    /// Cancellation asks the encoder to stop gracefully so the output file is
    /// finalized; a clean exit after that still counts as success.
    async fn record(&self, request: &RecordRequest, cancel: CancellationToken)
    -> Result<RecordOutput>;
}

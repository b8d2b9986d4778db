use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the download engine.
///
/// Job-level variants (`PlaylistResolution`, `SegmentFetch`, `Muxing`, `Locked`) end a single
/// job and never touch its siblings. `BatchConflict` and `InvalidBatch` are returned by
/// `Scheduler::submit` before any job exists.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to resolve playlist {url}: {reason}")]
    PlaylistResolution { url: String, reason: String },

    #[error("Segment {index} failed after {attempts} attempt(s): {reason}")]
    SegmentFetch {
        index: usize,
        attempts: u32,
        reason: String,
    },

    /// The muxing tool's stderr, verbatim.
    #[error("{}", mux_failure_message(.code, .stderr))]
    Muxing { code: Option<i32>, stderr: String },

    #[error("Download cancelled")]
    Cancelled,

    #[error("A download batch is already active")]
    BatchConflict,

    #[error("no active batch")]
    NoActiveBatch,

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Destination is locked by another download: {}", .0.display())]
    Locked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }

    pub fn playlist(url: &str, reason: impl Into<String>) -> Self {
        DownloadError::PlaylistResolution {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

fn mux_failure_message(code: &Option<i32>, stderr: &str) -> String {
    if !stderr.trim().is_empty() {
        return stderr.to_string();
    }
    match code {
        Some(code) => format!("Muxing tool exited with status {}", code),
        None => "Muxing tool was terminated by a signal".to_string(),
    }
}

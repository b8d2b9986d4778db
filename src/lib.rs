pub mod config;
pub mod download;
pub mod error;

// Re-export commonly used types for easier access in tests
pub use config::{Config, ConfigManager};
pub use download::{
    CleanupManager, CleanupReport, DownloadBatch, JobEvent, JobId, JobSnapshot, JobStatus,
    OverallProgress, OverallStatus, ProcessRegistry, ProgressReport, Scheduler, SchedulerOptions,
    Selection, StreamType,
};
pub use error::DownloadError;

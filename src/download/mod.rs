pub mod cleanup;
pub mod fetcher;
pub mod job;
pub mod muxer;
pub mod playlist;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;

pub use cleanup::{CleanupManager, CleanupOptions, CleanupReport, OrphanSignature};
pub use fetcher::{FetchOutcome, SegmentFetcher};
pub use job::{DownloadJob, JobSnapshot, JobStatus, Segment, SegmentStatus};
pub use muxer::MuxCommand;
pub use playlist::{HttpPlaylistResolver, PlaylistResolver};
pub use progress::{JobEvent, OverallProgress, OverallStatus, ProgressReport, ProgressTracker};
pub use registry::{HandleKind, ProcessHandle, ProcessRegistry};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerOptions};

use crate::error::DownloadError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

/// Upper bound for `max_parallel` on a batch.
pub const MAX_PARALLEL_LIMIT: usize = 16;

static ILLEGAL_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|\x00-\x20]"#).expect("valid filename regex"));

/// Recording variant of a lecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    #[serde(rename = "COMB")]
    Combined,
    #[serde(rename = "PRES")]
    Presentation,
    #[serde(rename = "CAM")]
    Camera,
}

impl StreamType {
    pub fn all() -> [StreamType; 3] {
        [
            StreamType::Combined,
            StreamType::Presentation,
            StreamType::Camera,
        ]
    }

    pub fn code(&self) -> &'static str {
        match self {
            StreamType::Combined => "COMB",
            StreamType::Presentation => "PRES",
            StreamType::Camera => "CAM",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamType::all()
            .into_iter()
            .find(|t| t.code().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown stream type '{}' (expected COMB, PRES or CAM)", s))
    }
}

/// Identity of a job: one lecture in one stream variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub lecture_id: String,
    pub stream_type: StreamType,
}

impl JobId {
    pub fn new(lecture_id: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            lecture_id: lecture_id.into(),
            stream_type,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lecture_id, self.stream_type)
    }
}

/// One (lecture, stream type) pair selected by the user, with its already-resolved playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub lecture_id: String,
    pub title: String,
    pub stream_type: StreamType,
    pub playlist_url: String,
    #[serde(default)]
    pub dest_path: Option<PathBuf>,
}

impl Selection {
    pub fn new(
        lecture_id: impl Into<String>,
        title: impl Into<String>,
        stream_type: StreamType,
        playlist_url: impl Into<String>,
    ) -> Self {
        Self {
            lecture_id: lecture_id.into(),
            title: title.into(),
            stream_type,
            playlist_url: playlist_url.into(),
            dest_path: None,
        }
    }

    pub fn with_dest_path(mut self, dest_path: PathBuf) -> Self {
        self.dest_path = Some(dest_path);
        self
    }

    pub fn job_id(&self) -> JobId {
        JobId::new(self.lecture_id.clone(), self.stream_type)
    }

    /// `<title>_<stream>` with illegal characters replaced.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}",
            sanitize_filename(&self.title),
            self.stream_type.code().to_lowercase()
        )
    }
}

/// One user-initiated download request. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct DownloadBatch {
    pub course_name: String,
    pub selections: Vec<Selection>,
    pub output_dir: PathBuf,
    pub max_parallel: usize,
}

impl DownloadBatch {
    /// `max_parallel` is clamped into `1..=16`.
    pub fn new(course_name: impl Into<String>, output_dir: PathBuf, max_parallel: usize) -> Self {
        Self {
            course_name: course_name.into(),
            selections: Vec::new(),
            output_dir,
            max_parallel: max_parallel.clamp(1, MAX_PARALLEL_LIMIT),
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selections.push(selection);
        self
    }

    pub fn with_selections(mut self, selections: impl IntoIterator<Item = Selection>) -> Self {
        self.selections.extend(selections);
        self
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.course_name.trim().is_empty() {
            return Err(DownloadError::InvalidBatch("Course name required".into()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(DownloadError::InvalidBatch("Output directory required".into()));
        }
        if self.selections.is_empty() {
            return Err(DownloadError::InvalidBatch("No lectures selected".into()));
        }
        if let Some(bad) = self.selections.iter().find(|s| s.playlist_url.trim().is_empty()) {
            return Err(DownloadError::InvalidBatch(format!(
                "Lecture '{}' has no playlist URL",
                bad.title
            )));
        }
        Ok(())
    }

    pub fn course_dir(&self) -> PathBuf {
        self.output_dir.join(sanitize_filename(&self.course_name))
    }

    /// `<output_dir>/<course>/<title>_<stream>.<ext>` unless the selection overrides it.
    pub fn destination_for(&self, selection: &Selection, extension: &str) -> PathBuf {
        match &selection.dest_path {
            Some(path) => path.clone(),
            None => self
                .course_dir()
                .join(format!("{}.{}", selection.file_stem(), extension)),
        }
    }

    /// Per-job scratch directory under the temp root, `<course>_<lecture_id>_<stream>`.
    /// Keyed by job identity so lectures sharing a title never share scratch space.
    pub fn temp_dir_for(&self, selection: &Selection, temp_root: &Path) -> PathBuf {
        temp_root.join(sanitize_filename(&format!(
            "{}_{}_{}",
            self.course_name,
            selection.lecture_id,
            selection.stream_type.code().to_lowercase()
        )))
    }
}

/// Replace characters that are illegal in file names (and whitespace) with `_`.
pub fn sanitize_filename(name: &str) -> String {
    ILLEGAL_FILENAME_CHARS.replace_all(name, "_").into_owned()
}

/// `<path>.lock`, used to claim a destination while a job is running.
pub fn lock_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// `<path>.part`, the in-progress name a file is written under before its final rename.
pub fn part_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;

use super::progress::ThroughputMeter;
use super::JobId;

/// Share of the job's percentage covered by segment downloads; muxing fills the rest.
const SEGMENT_SHARE: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    FetchingPlaylist,
    DownloadingSegments,
    Muxing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Holding a parallelism slot and doing work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::FetchingPlaylist | JobStatus::DownloadingSegments | JobStatus::Muxing
        )
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::FetchingPlaylist => 1,
            JobStatus::DownloadingSegments => 2,
            JobStatus::Muxing => 3,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 4,
        }
    }

    /// Forward-only; `Failed` and `Cancelled` are reachable from any non-terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed | JobStatus::Cancelled => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::FetchingPlaylist => "Fetching playlist",
            JobStatus::DownloadingSegments => "Downloading",
            JobStatus::Muxing => "Muxing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Segment {
    /// Assembly position; never reused within a job.
    pub index: usize,
    pub url: String,
    pub path: PathBuf,
    pub status: SegmentStatus,
    pub attempts: u32,
}

impl Segment {
    pub fn new(index: usize, url: String, dir: &Path) -> Self {
        Self {
            index,
            url,
            path: dir.join(format!("{:05}.ts", index)),
            status: SegmentStatus::Pending,
            attempts: 0,
        }
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub percent: f64,
    pub message: String,
    pub segments_done: usize,
    pub segments_total: usize,
    pub bytes_per_sec: u64,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    segments: Vec<Segment>,
    segments_done: usize,
    percent: f64,
    message: String,
    throughput: ThroughputMeter,
    lock_acquired: bool,
}

/// One lecture in one stream variant. Identity and paths are fixed at creation; the mutable
/// part sits behind a per-job lock that is only held for short, non-async sections.
#[derive(Debug)]
pub struct DownloadJob {
    pub id: JobId,
    pub name: String,
    pub playlist_url: String,
    pub dest_path: PathBuf,
    pub temp_dir: PathBuf,
    state: Mutex<JobState>,
}

impl DownloadJob {
    pub fn new(
        id: JobId,
        name: String,
        playlist_url: String,
        dest_path: PathBuf,
        temp_dir: PathBuf,
        throughput_window: Duration,
    ) -> Self {
        Self {
            id,
            name,
            playlist_url,
            dest_path,
            temp_dir,
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                segments: Vec::new(),
                segments_done: 0,
                percent: 0.0,
                message: "Waiting for a free slot".to_string(),
                throughput: ThroughputMeter::new(throughput_window),
                lock_acquired: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    /// Apply a status change. Returns false (and changes nothing) if the state machine forbids it.
    pub fn transition(&self, next: JobStatus, message: impl Into<String>) -> bool {
        let mut state = self.state();
        if !state.status.can_transition_to(next) {
            if state.status != next {
                warn!(
                    "Job {}: refusing transition {:?} -> {:?}",
                    self.id, state.status, next
                );
            }
            return false;
        }
        state.status = next;
        state.message = message.into();
        match next {
            JobStatus::Muxing => state.percent = state.percent.max(SEGMENT_SHARE),
            JobStatus::Completed => state.percent = 100.0,
            _ => {}
        }
        true
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.transition(JobStatus::Failed, message)
    }

    pub fn cancel(&self) -> bool {
        self.transition(JobStatus::Cancelled, "Cancelled")
    }

    pub fn set_segments(&self, segments: Vec<Segment>) {
        let mut state = self.state();
        state.segments_done = 0;
        state.segments = segments;
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.state().segments.clone()
    }

    /// Segment paths sorted by index, independent of completion order.
    pub fn ordered_segment_paths(&self) -> Vec<PathBuf> {
        let state = self.state();
        let mut segments: Vec<&Segment> = state.segments.iter().collect();
        segments.sort_by_key(|s| s.index);
        segments.into_iter().map(|s| s.path.clone()).collect()
    }

    pub fn mark_segment_in_flight(&self, index: usize) {
        let mut state = self.state();
        if let Some(segment) = state.segments.iter_mut().find(|s| s.index == index) {
            segment.status = SegmentStatus::InFlight;
        }
    }

    pub fn record_segment_attempt(&self, index: usize, attempts: u32) {
        let mut state = self.state();
        if let Some(segment) = state.segments.iter_mut().find(|s| s.index == index) {
            segment.attempts = attempts;
        }
    }

    /// Returns `(done, total, bytes_per_sec)` after counting the segment.
    pub fn complete_segment(&self, index: usize, bytes: u64, attempts: u32) -> (usize, usize, u64) {
        let mut state = self.state();
        let mut newly_done = false;
        if let Some(segment) = state.segments.iter_mut().find(|s| s.index == index) {
            newly_done = segment.status != SegmentStatus::Done;
            segment.status = SegmentStatus::Done;
            segment.attempts = attempts;
        }
        if newly_done {
            state.segments_done += 1;
        }
        state.throughput.record(bytes);

        let total = state.segments.len();
        let done = state.segments_done;
        if total > 0 && !state.status.is_terminal() {
            let percent = done as f64 / total as f64 * SEGMENT_SHARE;
            state.percent = state.percent.max(percent);
            state.message = format!("Downloading segments... {}/{}", done, total);
        }
        let rate = state.throughput.rate();
        (done, total, rate)
    }

    pub fn fail_segment(&self, index: usize, attempts: u32) {
        let mut state = self.state();
        if let Some(segment) = state.segments.iter_mut().find(|s| s.index == index) {
            segment.status = SegmentStatus::Failed;
            segment.attempts = attempts;
        }
    }

    pub fn set_lock_acquired(&self, acquired: bool) {
        self.state().lock_acquired = acquired;
    }

    /// Whether this job created the destination's lock file (and therefore owns the destination).
    pub fn lock_acquired(&self) -> bool {
        self.state().lock_acquired
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let mut state = self.state();
        let bytes_per_sec = if state.status == JobStatus::DownloadingSegments {
            state.throughput.rate()
        } else {
            0
        };
        JobSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: state.status,
            percent: state.percent,
            message: state.message.clone(),
            segments_done: state.segments_done,
            segments_total: state.segments.len(),
            bytes_per_sec,
        }
    }
}

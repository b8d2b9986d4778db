use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::cleanup::CleanupReport;
use super::job::{JobSnapshot, JobStatus};
use super::JobId;

/// One event per observable change; the scheduler's snapshot reflects the same transitions.
#[derive(Debug, Clone)]
pub enum JobEvent {
    BatchStarted {
        batch_id: Uuid,
        jobs: usize,
    },
    StatusChanged {
        job_id: JobId,
        status: JobStatus,
        message: String,
    },
    SegmentCompleted {
        job_id: JobId,
        index: usize,
        attempts: u32,
        done: usize,
        total: usize,
        bytes_per_sec: u64,
    },
    SegmentRetry {
        job_id: JobId,
        index: usize,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    BatchFinished {
        batch_id: Uuid,
        status: OverallStatus,
        cleanup: CleanupReport,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Idle,
    Running,
    Completed,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallProgress {
    pub status: OverallStatus,
    pub percent: f64,
    pub message: String,
}

impl OverallProgress {
    pub fn idle() -> Self {
        Self {
            status: OverallStatus::Idle,
            percent: 0.0,
            message: String::new(),
        }
    }

    /// Derive the batch-level view. `jobs` must already be in presentation order so the first
    /// active job is the most relevant one.
    pub fn from_jobs(jobs: &[JobSnapshot]) -> Self {
        if jobs.is_empty() {
            return Self::idle();
        }

        let total = jobs.len();
        let percent = jobs.iter().map(|j| j.percent).sum::<f64>() / total as f64;
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        let completed = count(JobStatus::Completed);
        let failed = count(JobStatus::Failed);
        let finished = jobs.iter().filter(|j| j.status.is_terminal()).count();

        let (status, message) = if finished < total {
            let message = match jobs.iter().find(|j| j.status.is_active()) {
                Some(job) => format!(
                    "{}/{} finished, {}: {}",
                    finished, total, job.name, job.message
                ),
                None => format!("{}/{} finished, waiting for a free slot", finished, total),
            };
            (OverallStatus::Running, message)
        } else if completed == total {
            (
                OverallStatus::Completed,
                format!("All {} downloads completed successfully", total),
            )
        } else if failed > 0 {
            (
                OverallStatus::Error,
                format!("{} of {} downloads failed", failed, total),
            )
        } else {
            (
                OverallStatus::Cancelled,
                format!("Download cancelled ({} of {} completed)", completed, total),
            )
        };

        Self {
            status,
            percent,
            message,
        }
    }
}

/// What `Scheduler::progress` hands to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub overall: OverallProgress,
    pub jobs: Vec<JobSnapshot>,
}

impl ProgressReport {
    pub fn idle() -> Self {
        Self {
            overall: OverallProgress::idle(),
            jobs: Vec::new(),
        }
    }

    pub fn job(&self, id: &JobId) -> Option<&JobSnapshot> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn running(&self) -> usize {
        self.jobs.iter().filter(|j| j.status.is_active()).count()
    }
}

/// Active jobs first, queued next, terminal last; submission order within each group.
pub fn order_for_presentation(jobs: &mut [JobSnapshot]) {
    jobs.sort_by_key(|j| match j.status {
        s if s.is_active() => 0,
        JobStatus::Queued => 1,
        _ => 2,
    });
}

/// Bytes per second over a trailing window.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(100)),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.prune(at);
    }

    pub fn rate(&mut self) -> u64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> u64 {
        self.prune(now);
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        (bytes as f64 / self.window.as_secs_f64()) as u64
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct ProgressTracker;

impl ProgressTracker {
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.1} {}", size, UNITS[unit_index])
        }
    }

    pub fn format_speed(bytes_per_second: u64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_second))
    }

    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::StreamType;

    fn snapshot(lecture: &str, status: JobStatus, percent: f64) -> JobSnapshot {
        JobSnapshot {
            id: JobId::new(lecture, StreamType::Combined),
            name: format!("Lecture {}", lecture),
            status,
            percent,
            message: format!("{} message", lecture),
            segments_done: 0,
            segments_total: 0,
            bytes_per_sec: 0,
        }
    }

    #[test]
    fn presentation_order_groups_by_activity() {
        let mut jobs = vec![
            snapshot("1", JobStatus::Completed, 100.0),
            snapshot("2", JobStatus::Queued, 0.0),
            snapshot("3", JobStatus::DownloadingSegments, 40.0),
            snapshot("4", JobStatus::Failed, 10.0),
            snapshot("5", JobStatus::Muxing, 95.0),
            snapshot("6", JobStatus::Queued, 0.0),
        ];
        order_for_presentation(&mut jobs);
        let order: Vec<&str> = jobs.iter().map(|j| j.id.lecture_id.as_str()).collect();
        assert_eq!(order, vec!["3", "5", "2", "6", "1", "4"]);
    }

    #[test]
    fn running_batch_reports_first_active_job() {
        let mut jobs = vec![
            snapshot("1", JobStatus::Completed, 100.0),
            snapshot("2", JobStatus::DownloadingSegments, 50.0),
        ];
        order_for_presentation(&mut jobs);
        let overall = OverallProgress::from_jobs(&jobs);
        assert_eq!(overall.status, OverallStatus::Running);
        assert_eq!(overall.percent, 75.0);
        assert!(overall.message.contains("Lecture 2"));
    }

    #[test]
    fn overall_status_rules() {
        let done = [
            snapshot("1", JobStatus::Completed, 100.0),
            snapshot("2", JobStatus::Completed, 100.0),
        ];
        assert_eq!(OverallProgress::from_jobs(&done).status, OverallStatus::Completed);

        let failed = [
            snapshot("1", JobStatus::Completed, 100.0),
            snapshot("2", JobStatus::Failed, 30.0),
            snapshot("3", JobStatus::Cancelled, 0.0),
        ];
        assert_eq!(OverallProgress::from_jobs(&failed).status, OverallStatus::Error);

        let cancelled = [
            snapshot("1", JobStatus::Completed, 100.0),
            snapshot("2", JobStatus::Cancelled, 30.0),
        ];
        assert_eq!(
            OverallProgress::from_jobs(&cancelled).status,
            OverallStatus::Cancelled
        );

        let still_running = [
            snapshot("1", JobStatus::Failed, 30.0),
            snapshot("2", JobStatus::Queued, 0.0),
        ];
        assert_eq!(
            OverallProgress::from_jobs(&still_running).status,
            OverallStatus::Running
        );

        assert_eq!(OverallProgress::from_jobs(&[]).status, OverallStatus::Idle);
    }

    #[test]
    fn throughput_uses_trailing_window() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(Duration::from_secs(2));
        meter.record_at(start, 1000);
        meter.record_at(start + Duration::from_secs(1), 3000);
        assert_eq!(meter.rate_at(start + Duration::from_secs(1)), 2000);
        // The first sample falls out of the window.
        assert_eq!(meter.rate_at(start + Duration::from_millis(2500)), 1500);
        assert_eq!(meter.rate_at(start + Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(ProgressTracker::format_bytes(512), "512 B");
        assert_eq!(ProgressTracker::format_bytes(2048), "2.0 KB");
        assert_eq!(ProgressTracker::format_speed(1536), "1.5 KB/s");
    }
}

use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::cleanup::{CleanupManager, CleanupOptions, CleanupReport, OrphanSignature};
use super::fetcher::SegmentFetcher;
use super::job::{DownloadJob, JobStatus, Segment};
use super::muxer::MuxCommand;
use super::playlist::{HttpPlaylistResolver, PlaylistResolver};
use super::progress::{JobEvent, OverallProgress, ProgressReport, order_for_presentation};
use super::registry::ProcessRegistry;
use super::retry::RetryPolicy;
use super::runner::{JobContext, JobRunner, cancelled};
use super::{DownloadBatch, JobId};
use crate::error::DownloadError;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Parent of every job's scratch directory.
    pub temp_root: PathBuf,
    pub file_extension: String,
    pub segment_concurrency: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub throughput_window: Duration,
    pub muxer: MuxCommand,
    pub grace_period: Duration,
    pub orphan_scan: bool,
}

impl SchedulerOptions {
    pub fn new(temp_root: PathBuf) -> Self {
        Self {
            temp_root,
            file_extension: "mp4".to_string(),
            segment_concurrency: 8,
            request_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            throughput_window: Duration::from_secs(5),
            muxer: MuxCommand::default(),
            grace_period: Duration::from_millis(1500),
            orphan_scan: true,
        }
    }

    pub fn cleanup_options(&self) -> CleanupOptions {
        CleanupOptions {
            grace_period: self.grace_period,
            orphan_scan: self.orphan_scan,
            signature: OrphanSignature::new(self.muxer.program_name(), &self.temp_root),
        }
    }
}

struct ActiveBatch {
    id: Uuid,
    /// Submission order.
    jobs: Vec<Arc<DownloadJob>>,
    cancel: watch::Sender<bool>,
    /// Holds the cleanup report once the batch has fully finished.
    finished: watch::Receiver<Option<CleanupReport>>,
}

impl ActiveBatch {
    fn is_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }
}

/// Owns at most one batch at a time and everything running on its behalf.
pub struct Scheduler {
    options: SchedulerOptions,
    fetcher: Arc<SegmentFetcher>,
    resolver: Arc<dyn PlaylistResolver>,
    registry: Arc<ProcessRegistry>,
    events: mpsc::UnboundedSender<JobEvent>,
    batch: RwLock<Option<ActiveBatch>>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Result<(Self, mpsc::UnboundedReceiver<JobEvent>)> {
        let client = SegmentFetcher::build_client(options.request_timeout)?;
        let resolver: Arc<dyn PlaylistResolver> =
            Arc::new(HttpPlaylistResolver::new(client.clone()));
        let fetcher = Arc::new(SegmentFetcher::new(client, options.retry));
        let (events, event_receiver) = mpsc::unbounded_channel();

        Ok((
            Self {
                options,
                fetcher,
                resolver,
                registry: ProcessRegistry::new(),
                events,
                batch: RwLock::new(None),
            },
            event_receiver,
        ))
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PlaylistResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn cleanup_manager(&self) -> CleanupManager {
        CleanupManager::new(self.registry(), self.options.cleanup_options())
    }

    /// Accept a batch and start admitting its jobs. Rejected while another batch is unfinished.
    pub async fn submit(&self, batch: DownloadBatch) -> Result<Uuid, DownloadError> {
        batch.validate()?;

        let mut slot = self.batch.write().await;
        if slot.as_ref().is_some_and(|active| !active.is_finished()) {
            return Err(DownloadError::BatchConflict);
        }

        let batch_id = Uuid::new_v4();
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        let mut titles = Vec::new();
        for selection in &batch.selections {
            let id = selection.job_id();
            if !seen.insert(id.clone()) {
                warn!("Ignoring duplicate selection {}", id);
                continue;
            }
            jobs.push(Arc::new(DownloadJob::new(
                id,
                format!("{} ({})", selection.title, selection.stream_type),
                selection.playlist_url.clone(),
                batch.destination_for(selection, &self.options.file_extension),
                batch.temp_dir_for(selection, &self.options.temp_root),
                self.options.throughput_window,
            )));
            titles.push(selection.title.clone());
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let (finished_tx, finished) = watch::channel(None);
        let ctx = JobContext {
            fetcher: Arc::clone(&self.fetcher),
            resolver: Arc::clone(&self.resolver),
            muxer: self.options.muxer.clone(),
            registry: self.registry(),
            events: self.events.clone(),
            cancel: cancel_rx,
            segment_concurrency: self.options.segment_concurrency,
            file_extension: self.options.file_extension.clone(),
        };

        info!(
            "Starting batch {} for '{}': {} job(s), {} at a time",
            batch_id,
            batch.course_name,
            jobs.len(),
            batch.max_parallel
        );
        let _ = self.events.send(JobEvent::BatchStarted {
            batch_id,
            jobs: jobs.len(),
        });

        let driver = BatchDriver {
            batch_id,
            jobs: jobs.clone(),
            titles,
            max_parallel: batch.max_parallel,
            course_dir: batch.course_dir(),
            ctx,
            cleanup: self.cleanup_manager(),
            finished: finished_tx,
        };
        tokio::spawn(driver.run());

        *slot = Some(ActiveBatch {
            id: batch_id,
            jobs,
            cancel,
            finished,
        });
        Ok(batch_id)
    }

    pub async fn progress(&self) -> ProgressReport {
        let slot = self.batch.read().await;
        let Some(active) = slot.as_ref() else {
            return ProgressReport::idle();
        };

        let mut jobs: Vec<_> = active.jobs.iter().map(|job| job.snapshot()).collect();
        order_for_presentation(&mut jobs);
        ProgressReport {
            overall: OverallProgress::from_jobs(&jobs),
            jobs,
        }
    }

    /// Signal every job of the active batch. Queued jobs are cancelled on the spot.
    pub async fn cancel(&self) -> Result<(), DownloadError> {
        let slot = self.batch.read().await;
        let active = slot
            .as_ref()
            .filter(|active| !active.is_finished())
            .ok_or(DownloadError::NoActiveBatch)?;

        info!("Cancelling batch {}", active.id);
        active.cancel.send_replace(true);
        for job in &active.jobs {
            if job.status() == JobStatus::Queued && job.cancel() {
                emit_status(&self.events, job);
            }
        }
        Ok(())
    }

    /// Resolves once the current batch has finished and its cleanup has run.
    pub async fn wait(&self) -> Option<CleanupReport> {
        let mut finished = {
            let slot = self.batch.read().await;
            slot.as_ref()?.finished.clone()
        };
        let report = finished.wait_for(|report| report.is_some()).await.ok()?;
        (*report).clone()
    }

    /// Cancel whatever is running, wait for it, and sweep anything left in the registry.
    pub async fn shutdown(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.cancel().await.is_ok() {
            if let Some(batch_report) = self.wait().await {
                report.merge(&batch_report);
            }
        }
        if !self.registry.is_empty() {
            report.merge(&self.cleanup_manager().run(&[]).await);
        }
        report
    }

    pub async fn is_active(&self) -> bool {
        self.batch
            .read()
            .await
            .as_ref()
            .is_some_and(|active| !active.is_finished())
    }

    pub async fn batch_id(&self) -> Option<Uuid> {
        self.batch.read().await.as_ref().map(|active| active.id)
    }

    pub async fn job_segments(&self, id: &JobId) -> Option<Vec<Segment>> {
        let slot = self.batch.read().await;
        slot.as_ref()?
            .jobs
            .iter()
            .find(|job| &job.id == id)
            .map(|job| job.segments())
    }
}

/// Background task owning one batch from admission to cleanup.
struct BatchDriver {
    batch_id: Uuid,
    jobs: Vec<Arc<DownloadJob>>,
    titles: Vec<String>,
    max_parallel: usize,
    course_dir: PathBuf,
    ctx: JobContext,
    cleanup: CleanupManager,
    finished: watch::Sender<Option<CleanupReport>>,
}

impl BatchDriver {
    async fn run(self) {
        let slots = Arc::new(Semaphore::new(self.max_parallel));
        let mut runners = JoinSet::new();
        let mut cancel = self.ctx.cancel.clone();

        // Permits are handed out in submission order.
        for job in &self.jobs {
            let permit = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if job.status() != JobStatus::Queued {
                continue;
            }
            runners.spawn(JobRunner::new(Arc::clone(job), self.ctx.clone()).run(permit));
        }

        let grace = self.cleanup.options().grace_period;
        tokio::select! {
            _ = async { while runners.join_next().await.is_some() {} } => {}
            _ = async {
                cancelled(&mut cancel).await;
                tokio::time::sleep(grace).await;
            } => {
                warn!("Job runners still busy {:?} after cancel, aborting them", grace);
                runners.abort_all();
                while runners.join_next().await.is_some() {}
            }
        }

        let cancelled = *self.ctx.cancel.borrow();
        for job in &self.jobs {
            if job.status().is_terminal() {
                continue;
            }
            let changed = if cancelled {
                job.cancel()
            } else {
                job.fail("Download task ended unexpectedly")
            };
            if changed {
                emit_status(&self.ctx.events, job);
            }
        }

        let report = self.cleanup.run(&self.jobs).await;
        if report.orphans_killed > 0 {
            warn!(
                "Batch {}: {} orphaned process(es) were not tracked",
                self.batch_id, report.orphans_killed
            );
        }

        if self.jobs.iter().any(|job| job.status() == JobStatus::Failed) {
            match write_error_log(&self.course_dir, &self.jobs, &self.titles).await {
                Ok(path) => warn!("Some downloads failed, details in {:?}", path),
                Err(e) => error!("Failed to write error log: {}", e),
            }
        }

        let mut snapshots: Vec<_> = self.jobs.iter().map(|job| job.snapshot()).collect();
        order_for_presentation(&mut snapshots);
        let overall = OverallProgress::from_jobs(&snapshots);
        info!("Batch {} finished: {}", self.batch_id, overall.message);

        let _ = self.ctx.events.send(JobEvent::BatchFinished {
            batch_id: self.batch_id,
            status: overall.status,
            cleanup: report.clone(),
        });
        let _ = self.finished.send(Some(report));
    }
}

fn emit_status(events: &mpsc::UnboundedSender<JobEvent>, job: &DownloadJob) {
    let snapshot = job.snapshot();
    let _ = events.send(JobEvent::StatusChanged {
        job_id: snapshot.id,
        status: snapshot.status,
        message: snapshot.message,
    });
}

/// One `<title>\t<STREAM>\t<message>` line per failed job.
async fn write_error_log(
    course_dir: &Path,
    jobs: &[Arc<DownloadJob>],
    titles: &[String],
) -> std::io::Result<PathBuf> {
    let mut content = String::new();
    for (job, title) in jobs.iter().zip(titles) {
        let snapshot = job.snapshot();
        if snapshot.status != JobStatus::Failed {
            continue;
        }
        let message = snapshot
            .message
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        content.push_str(&format!("{}\t{}\t{}\n", title, job.id.stream_type, message));
    }

    tokio::fs::create_dir_all(course_dir).await?;
    let path = course_dir.join(format!(
        "download_errors_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    tokio::fs::write(&path, content).await?;
    Ok(path)
}

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::cleanup::clean_job_artifacts;
use super::fetcher::{FetchOutcome, SegmentFetcher};
use super::job::{DownloadJob, JobStatus, Segment};
use super::muxer::{MuxCommand, write_concat_list};
use super::playlist::PlaylistResolver;
use super::progress::JobEvent;
use super::registry::{HandleKind, HandleTarget, ProcessRegistry, RegistrationGuard};
use super::{lock_path_for, part_path_for};
use crate::error::DownloadError;

/// Shared collaborators handed to every runner of a batch.
#[derive(Clone)]
pub struct JobContext {
    pub fetcher: Arc<SegmentFetcher>,
    pub resolver: Arc<dyn PlaylistResolver>,
    pub muxer: MuxCommand,
    pub registry: Arc<ProcessRegistry>,
    pub events: mpsc::UnboundedSender<JobEvent>,
    pub cancel: watch::Receiver<bool>,
    pub segment_concurrency: usize,
    pub file_extension: String,
}

/// Drives one job from playlist to finished file.
pub struct JobRunner {
    job: Arc<DownloadJob>,
    ctx: JobContext,
}

impl JobRunner {
    pub fn new(job: Arc<DownloadJob>, ctx: JobContext) -> Self {
        Self { job, ctx }
    }

    /// Runs to a terminal status. The permit is the batch-level slot and is released on return.
    pub async fn run(self, _permit: OwnedSemaphorePermit) -> JobStatus {
        if self.job.status() != JobStatus::Queued {
            return self.job.status();
        }

        match self.execute().await {
            Ok(()) => info!("Completed {} -> {:?}", self.job.name, self.job.dest_path),
            Err(e) if e.is_cancelled() => {
                info!("Cancelled {}", self.job.name);
                if self.job.cancel() {
                    self.emit_status();
                }
            }
            Err(e) => {
                error!("Download failed for {}: {}", self.job.name, e);
                if self.job.fail(e.to_string()) {
                    self.emit_status();
                }
            }
        }

        let status = self.job.status();
        if status != JobStatus::Completed {
            clean_job_artifacts(&self.job).await;
        }
        status
    }

    async fn execute(&self) -> Result<(), DownloadError> {
        self.check_cancelled()?;

        if fs::try_exists(&self.job.dest_path).await.unwrap_or(false) {
            info!("Skipping {}: {:?} already exists", self.job.name, self.job.dest_path);
            return self.advance(JobStatus::Completed, "Already downloaded");
        }

        self.acquire_lock().await?;

        self.advance(JobStatus::FetchingPlaylist, "Fetching playlist...")?;
        let urls = self
            .cancellable(self.ctx.resolver.resolve(&self.job.playlist_url))
            .await??;

        fs::create_dir_all(&self.job.temp_dir).await?;
        let segments: Vec<Segment> = urls
            .into_iter()
            .enumerate()
            .map(|(index, url)| Segment::new(index, url, &self.job.temp_dir))
            .collect();
        let total = segments.len();
        self.job.set_segments(segments.clone());
        self.advance(
            JobStatus::DownloadingSegments,
            format!("Downloading segments... 0/{}", total),
        )?;
        debug!("{}: {} segments into {:?}", self.job.name, total, self.job.temp_dir);

        self.download_segments(segments).await?;

        self.check_cancelled()?;
        self.advance(JobStatus::Muxing, "Muxing segments...")?;
        let muxed = self.mux().await?;

        self.cancellable(move_into_place(&muxed, &self.job.dest_path))
            .await??;
        if let Err(e) = fs::remove_dir_all(&self.job.temp_dir).await {
            warn!("Failed to remove temp dir {:?}: {}", self.job.temp_dir, e);
        }
        self.release_lock().await;

        self.advance(JobStatus::Completed, "Download completed")
    }

    /// Claim the destination by creating `<dest>.lock` exclusively.
    async fn acquire_lock(&self) -> Result<(), DownloadError> {
        if let Some(parent) = self.job.dest_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let lock = lock_path_for(&self.job.dest_path);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock)
            .await
        {
            Ok(mut file) => {
                self.job.set_lock_acquired(true);
                file.write_all(std::process::id().to_string().as_bytes())
                    .await?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(DownloadError::Locked(lock)),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_lock(&self) {
        if !self.job.lock_acquired() {
            return;
        }
        let lock = lock_path_for(&self.job.dest_path);
        match fs::remove_file(&lock).await {
            Ok(()) => self.job.set_lock_acquired(false),
            Err(e) => warn!("Failed to remove lock {:?}: {}", lock, e),
        }
    }

    async fn download_segments(&self, segments: Vec<Segment>) -> Result<(), DownloadError> {
        let limit = Arc::new(Semaphore::new(self.ctx.segment_concurrency.max(1)));
        let mut workers: JoinSet<(usize, Result<FetchOutcome, DownloadError>)> = JoinSet::new();
        let mut guards: HashMap<usize, RegistrationGuard> = HashMap::new();
        let mut cancel = self.ctx.cancel.clone();
        let mut pending = segments.into_iter();
        let mut next = pending.next();

        loop {
            if next.is_none() && workers.is_empty() {
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = cancelled(&mut cancel) => {
                    workers.shutdown().await;
                    return Err(DownloadError::Cancelled);
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((index, result)) => {
                            guards.remove(&index);
                            if let Err(e) = self.record_segment(index, result) {
                                workers.shutdown().await;
                                return Err(e);
                            }
                        }
                        Err(e) => {
                            workers.shutdown().await;
                            if e.is_cancelled() {
                                return Err(DownloadError::Cancelled);
                            }
                            return Err(DownloadError::Io(io::Error::other(format!(
                                "segment worker panicked: {}",
                                e
                            ))));
                        }
                    }
                }

                permit = Arc::clone(&limit).acquire_owned(), if next.is_some() => {
                    let Ok(permit) = permit else {
                        return Err(DownloadError::Cancelled);
                    };
                    if let Some(segment) = next.take() {
                        let index = segment.index;
                        let abort = self.spawn_segment(&mut workers, segment, permit);
                        guards.insert(
                            index,
                            self.ctx.registry.register(
                                self.job.id.clone(),
                                HandleKind::SegmentWorker,
                                HandleTarget::Task(abort),
                            ),
                        );
                    }
                    next = pending.next();
                }
            }
        }
    }

    fn spawn_segment(
        &self,
        workers: &mut JoinSet<(usize, Result<FetchOutcome, DownloadError>)>,
        segment: Segment,
        permit: OwnedSemaphorePermit,
    ) -> tokio::task::AbortHandle {
        let fetcher = Arc::clone(&self.ctx.fetcher);
        let job = Arc::clone(&self.job);
        let events = self.ctx.events.clone();
        let max_attempts = fetcher.policy().max_attempts;
        job.mark_segment_in_flight(segment.index);

        workers.spawn(async move {
            let _permit = permit;
            let index = segment.index;
            let result = fetcher
                .fetch(&segment.url, &segment.path, index, |attempt, delay| {
                    job.record_segment_attempt(index, attempt);
                    let _ = events.send(JobEvent::SegmentRetry {
                        job_id: job.id.clone(),
                        index,
                        attempt,
                        max_attempts,
                        delay,
                    });
                })
                .await;
            (index, result)
        })
    }

    fn record_segment(
        &self,
        index: usize,
        result: Result<FetchOutcome, DownloadError>,
    ) -> Result<(), DownloadError> {
        match result {
            Ok(outcome) => {
                // Reused segments count toward progress but not throughput.
                let bytes = if outcome.reused { 0 } else { outcome.bytes };
                let (done, total, bytes_per_sec) =
                    self.job.complete_segment(index, bytes, outcome.attempts);
                let _ = self.ctx.events.send(JobEvent::SegmentCompleted {
                    job_id: self.job.id.clone(),
                    index,
                    attempts: outcome.attempts,
                    done,
                    total,
                    bytes_per_sec,
                });
                Ok(())
            }
            Err(e) => {
                let attempts = match &e {
                    DownloadError::SegmentFetch { attempts, .. } => *attempts,
                    _ => 0,
                };
                self.job.fail_segment(index, attempts);
                Err(e)
            }
        }
    }

    /// Runs the muxing tool and returns the path of the file it produced.
    async fn mux(&self) -> Result<PathBuf, DownloadError> {
        let inputs = self.job.ordered_segment_paths();
        let list = self.job.temp_dir.join("segments.txt");
        if self.ctx.muxer.needs_list_file() {
            write_concat_list(&list, &inputs).await?;
        }
        let output = self
            .job
            .temp_dir
            .join(format!("muxed.{}", self.ctx.file_extension));

        let child = self
            .ctx
            .muxer
            .spawn(&self.job.temp_dir, &list, &inputs, &output)
            .map_err(|e| DownloadError::Muxing {
                code: None,
                stderr: format!(
                    "Failed to start muxing tool '{}': {}",
                    self.ctx.muxer.program, e
                ),
            })?;
        let _guard = child.id().map(|pid| {
            self.ctx.registry.register(
                self.job.id.clone(),
                HandleKind::MuxingTool,
                HandleTarget::Process(pid),
            )
        });
        debug!("{}: muxing {} segments with {}", self.job.name, inputs.len(), self.ctx.muxer.program);

        // Dropping the child on cancel kills it.
        let result = self.cancellable(child.wait_with_output()).await??;
        if !result.status.success() {
            return Err(DownloadError::Muxing {
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        if !fs::try_exists(&output).await.unwrap_or(false) {
            return Err(DownloadError::Muxing {
                code: result.status.code(),
                stderr: format!("Muxing tool did not produce {:?}", output),
            });
        }
        Ok(output)
    }

    fn advance(&self, status: JobStatus, message: impl Into<String>) -> Result<(), DownloadError> {
        if self.job.transition(status, message) {
            self.emit_status();
            Ok(())
        } else {
            // Only a concurrent cancel moves a running job out from under its runner.
            Err(DownloadError::Cancelled)
        }
    }

    fn emit_status(&self) {
        let snapshot = self.job.snapshot();
        let _ = self.ctx.events.send(JobEvent::StatusChanged {
            job_id: snapshot.id,
            status: snapshot.status,
            message: snapshot.message,
        });
    }

    fn check_cancelled(&self) -> Result<(), DownloadError> {
        if *self.ctx.cancel.borrow() || self.job.status() == JobStatus::Cancelled {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    async fn cancellable<F: Future>(&self, future: F) -> Result<F::Output, DownloadError> {
        let mut cancel = self.ctx.cancel.clone();
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(DownloadError::Cancelled),
            output = future => Ok(output),
        }
    }
}

/// Resolves once the flag is raised. A dropped sender never cancels.
pub(super) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|flag| *flag).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Rename into place, or copy through `<dest>.part` when the rename crosses filesystems.
async fn move_into_place(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    copy_into_place(from, to).await
}

/// Streams `from` into `<to>.part` and renames it. Dropping the future stops the copy; the
/// filesystem pass removes the partial file.
async fn copy_into_place(from: &Path, to: &Path) -> io::Result<()> {
    let part = part_path_for(to);
    let copied = async {
        let mut source = fs::File::open(from).await?;
        let mut target = fs::File::create(&part).await?;
        tokio::io::copy(&mut source, &mut target).await?;
        target.flush().await
    }
    .await;
    if let Err(e) = copied {
        let _ = fs::remove_file(&part).await;
        return Err(e);
    }
    fs::rename(&part, to).await?;
    fs::remove_file(from).await
}

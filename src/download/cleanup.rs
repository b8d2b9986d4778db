//! Multi-pass teardown: tracked handles, escalation, orphan scan, filesystem.

use serde::Serialize;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::job::{DownloadJob, JobStatus};
use super::registry::{HandleTarget, ProcessHandle, ProcessRegistry};
use super::{lock_path_for, part_path_for};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Identifies muxing-tool processes started by this program: the program name plus an argument
/// that points into our temp root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanSignature {
    pub program: String,
    pub marker: PathBuf,
}

impl OrphanSignature {
    pub fn new(program: impl Into<String>, marker: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            marker: marker.into(),
        }
    }

    pub fn matches(&self, name: &OsStr, cmd: &[OsString]) -> bool {
        let program = OsStr::new(&self.program);
        let by_argv0 = cmd
            .first()
            .and_then(|arg0| Path::new(arg0).file_name())
            .is_some_and(|n| n == program);
        if !(by_argv0 || name == program) {
            return false;
        }
        let marker = self.marker.to_string_lossy();
        !marker.is_empty()
            && cmd
                .iter()
                .skip(1)
                .any(|arg| arg.to_string_lossy().contains(marker.as_ref()))
    }
}

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub grace_period: Duration,
    pub orphan_scan: bool,
    pub signature: OrphanSignature,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Tracked handles sent a graceful stop.
    pub terminated: usize,
    /// Tracked handles still alive after the grace period.
    pub force_killed: usize,
    /// Untracked processes matching the signature.
    pub orphans_killed: usize,
    /// Temp directories, lock files and partial outputs removed.
    pub paths_removed: usize,
}

impl CleanupReport {
    pub fn merge(&mut self, other: &CleanupReport) {
        self.terminated += other.terminated;
        self.force_killed += other.force_killed;
        self.orphans_killed += other.orphans_killed;
        self.paths_removed += other.paths_removed;
    }
}

pub struct CleanupManager {
    registry: Arc<ProcessRegistry>,
    options: CleanupOptions,
}

impl CleanupManager {
    pub fn new(registry: Arc<ProcessRegistry>, options: CleanupOptions) -> Self {
        Self { registry, options }
    }

    pub fn options(&self) -> &CleanupOptions {
        &self.options
    }

    /// All four passes for a batch. Each pass only acts on what the previous ones left.
    pub async fn run(&self, jobs: &[Arc<DownloadJob>]) -> CleanupReport {
        let mut report = CleanupReport::default();

        let handles = self.registry.snapshot();
        if !handles.is_empty() {
            info!("Cleanup: stopping {} tracked handle(s)", handles.len());
            report.terminated = self.terminate(&handles).await;
            report.force_killed = self.escalate(&handles);
            for handle in &handles {
                self.registry.unregister(handle.id);
            }
        }

        if self.options.orphan_scan {
            report.orphans_killed = self.orphan_pass().await;
        }

        for job in jobs {
            report.paths_removed += clean_job_artifacts(job).await;
        }

        debug!("Cleanup finished: {:?}", report);
        report
    }

    /// Tracked pass: graceful stop, then wait up to the grace period.
    async fn terminate(&self, handles: &[ProcessHandle]) -> usize {
        for handle in handles {
            match &handle.target {
                HandleTarget::Task(abort) => abort.abort(),
                HandleTarget::Process(pid) => {
                    if !signal_terminate(*pid) {
                        debug!("SIGTERM to pid {} failed; process already gone", pid);
                    }
                }
            }
        }

        let deadline = Instant::now() + self.options.grace_period;
        while handles.iter().any(is_alive) && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        handles.len()
    }

    /// Escalation pass: force-kill whatever survived the grace period.
    fn escalate(&self, handles: &[ProcessHandle]) -> usize {
        let mut killed = 0;
        for handle in handles.iter().filter(|h| is_alive(h)) {
            match &handle.target {
                HandleTarget::Task(abort) => abort.abort(),
                HandleTarget::Process(pid) => {
                    warn!(
                        "{:?} pid {} for job {} ignored SIGTERM, killing",
                        handle.kind, pid, handle.job_id
                    );
                    signal_kill(*pid);
                    killed += 1;
                }
            }
        }
        killed
    }

    /// Orphan-scan pass. Only fires when the registry and the process table disagree.
    async fn orphan_pass(&self) -> usize {
        let signature = self.options.signature.clone();
        let tracked = self.registry.tracked_pids();
        let found = tokio::task::spawn_blocking(move || scan_orphans(&signature, &tracked, true))
            .await
            .unwrap_or_default();
        for (pid, cmdline) in &found {
            warn!(
                target: "lecture_dl::cleanup::orphans",
                "Killed orphaned process {} ({})", pid, cmdline
            );
        }
        found.len()
    }

    /// Recover after a crash: kill stray muxers and remove job directories left under `temp_root`.
    pub async fn sweep_orphans(
        &self,
        temp_root: &Path,
        dry_run: bool,
    ) -> (CleanupReport, Vec<String>) {
        let mut report = CleanupReport::default();
        let mut actions = Vec::new();

        let signature = self.options.signature.clone();
        let tracked = self.registry.tracked_pids();
        let found =
            tokio::task::spawn_blocking(move || scan_orphans(&signature, &tracked, !dry_run))
                .await
                .unwrap_or_default();
        for (pid, cmdline) in found {
            if !dry_run {
                warn!(target: "lecture_dl::cleanup::orphans", "Killed orphaned process {} ({})", pid, cmdline);
                report.orphans_killed += 1;
            }
            actions.push(format!("process {}: {}", pid, cmdline));
        }

        for dir in stale_job_dirs(temp_root) {
            actions.push(format!("remove {}", dir.display()));
            if !dry_run && remove_path(&dir).unwrap_or(false) {
                report.paths_removed += 1;
            }
        }

        (report, actions)
    }
}

/// Filesystem pass for one job. Nothing is touched unless this job created the destination's lock.
/// Ownership is only given up once everything is gone, so a later pass retries what failed.
pub async fn clean_job_artifacts(job: &Arc<DownloadJob>) -> usize {
    let job = Arc::clone(job);
    tokio::task::spawn_blocking(move || remove_job_artifacts(&job))
        .await
        .unwrap_or_else(|e| {
            warn!("Filesystem cleanup task failed: {}", e);
            0
        })
}

fn remove_job_artifacts(job: &DownloadJob) -> usize {
    if !job.lock_acquired() {
        return 0;
    }

    let mut targets = vec![job.temp_dir.clone()];
    if job.status() != JobStatus::Completed {
        if job.dest_path.exists() {
            warn!("Removing partial output {:?}", job.dest_path);
        }
        targets.push(job.dest_path.clone());
        targets.push(part_path_for(&job.dest_path));
    }

    let mut removed = 0;
    let mut complete = true;
    for path in &targets {
        match remove_path(path) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(_) => complete = false,
        }
    }

    // The lock goes last: while it exists no other run writes to this destination.
    if complete {
        match remove_path(&lock_path_for(&job.dest_path)) {
            Ok(gone) => {
                removed += usize::from(gone);
                job.set_lock_acquired(false);
            }
            Err(_) => complete = false,
        }
    }
    if !complete {
        warn!("Job {}: some files could not be removed, keeping its lock", job.id);
    }

    removed
}

/// Lock files and partial outputs (`*.lock`, `*.part`) under `root`, e.g. left behind by a
/// crashed run.
pub fn find_leftover_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "lock" || ext == "part")
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn stale_job_dirs(temp_root: &Path) -> Vec<PathBuf> {
    WalkDir::new(temp_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .collect()
}

/// `Ok(true)` if something was removed, `Ok(false)` if nothing was there.
fn remove_path(path: &Path) -> std::io::Result<bool> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!("Failed to remove {:?}: {}", path, e);
            Err(e)
        }
    }
}

fn is_alive(handle: &ProcessHandle) -> bool {
    match &handle.target {
        HandleTarget::Task(abort) => !abort.is_finished(),
        HandleTarget::Process(pid) => process_alive(*pid),
    }
}

/// Zombies count as gone: they hold no resources beyond their table entry.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Returns `(pid, command line)` of every untracked process matching `signature`, killing them
/// when `kill` is set.
fn scan_orphans(
    signature: &OrphanSignature,
    tracked: &HashSet<u32>,
    kill: bool,
) -> Vec<(u32, String)> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    let own_pid = std::process::id();
    let mut found = Vec::new();
    for (pid, process) in system.processes() {
        let pid = pid.as_u32();
        if pid == own_pid || tracked.contains(&pid) {
            continue;
        }
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            continue;
        }
        if !signature.matches(process.name(), process.cmd()) {
            continue;
        }
        let cmdline = process
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if kill && !process.kill() {
            warn!("Could not kill orphaned process {}", pid);
            continue;
        }
        found.push((pid, cmdline));
    }
    found
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    send_signal(pid, libc::SIGTERM)
}

#[cfg(unix)]
fn signal_kill(pid: u32) -> bool {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, signal) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(pid: u32) -> bool {
    signal_kill(pid)
}

#[cfg(not(unix))]
fn signal_kill(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some_and(|p| p.kill())
}

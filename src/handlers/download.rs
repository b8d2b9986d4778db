use anyhow::{Context, Result};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use lecture_dl::config::ConfigManager;
use lecture_dl::download::{
    DownloadBatch, JobEvent, JobId, JobStatus, OverallStatus, ProgressReport, ProgressTracker,
    Scheduler, Selection,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

/// What the lecture picker hands over: the course and the resolved playlist per selection.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub course: String,
    pub selections: Vec<Selection>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {:?}", path))
    }
}

pub async fn handle_download(
    config_manager: &ConfigManager,
    manifest: PathBuf,
    output_dir: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    max_parallel: Option<usize>,
    json: bool,
) -> Result<()> {
    let term = Term::stderr();
    let config = config_manager.config();
    let manifest = Manifest::load(&manifest)?;

    let mut options = config.scheduler_options();
    if let Some(dir) = temp_dir {
        options.temp_root = dir;
    }
    let output_dir = output_dir
        .or(manifest.output_dir)
        .unwrap_or_else(|| config.output_dir());
    let max_parallel = max_parallel
        .or(manifest.max_parallel)
        .unwrap_or(config.general.max_parallel_downloads);

    let batch = DownloadBatch::new(manifest.course, output_dir, max_parallel)
        .with_selections(manifest.selections);
    if !json {
        term.write_line(&format!(
            "{} Downloading {} recording(s) of {} into {}",
            style("⬇️").cyan(),
            batch.selections.len(),
            style(&batch.course_name).cyan().bold(),
            style(batch.course_dir().display()).cyan()
        ))?;
    }

    let (scheduler, mut events) = Scheduler::new(options)?;
    scheduler
        .submit(batch)
        .await
        .context("Failed to start downloads")?;

    let started = Instant::now();
    let mut display = (!json).then(ProgressDisplay::new).transpose()?;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                term.write_line(&format!(
                    "{} Cancelling, cleaning up...",
                    style("⏹").yellow()
                ))?;
                scheduler.cancel().await.ok();
            }
            Some(event) = events.recv() => {
                if let Some(display) = display.as_mut() {
                    display.on_event(&event);
                }
                if matches!(event, JobEvent::BatchFinished { .. }) {
                    break;
                }
            }
            _ = ticker.tick() => {
                let report = scheduler.progress().await;
                match display.as_mut() {
                    Some(display) => display.render(&report)?,
                    None => println!("{}", serde_json::to_string(&report)?),
                }
            }
        }
    }

    let cleanup = scheduler.wait().await.unwrap_or_default();
    let report = scheduler.progress().await;
    match display.as_mut() {
        Some(display) => {
            display.render(&report)?;
            display.finish();
        }
        None => println!("{}", serde_json::to_string(&report)?),
    }

    if json {
        println!("{}", serde_json::to_string(&cleanup)?);
    } else {
        print_summary(&term, &report, started.elapsed())?;
    }

    match report.overall.status {
        OverallStatus::Error => process::exit(1),
        OverallStatus::Cancelled => process::exit(130),
        _ => Ok(()),
    }
}

fn print_summary(term: &Term, report: &ProgressReport, elapsed: Duration) -> Result<()> {
    term.write_line("")?;
    for job in report.jobs.iter().filter(|j| j.status == JobStatus::Failed) {
        term.write_line(&format!(
            "{} {}: {}",
            style("❌").red(),
            style(&job.name).bold(),
            job.message.trim()
        ))?;
    }

    let icon = match report.overall.status {
        OverallStatus::Completed => style("✅").green(),
        OverallStatus::Cancelled => style("⏹").yellow(),
        _ => style("⚠️").red(),
    };
    term.write_line(&format!(
        "{} {} ({})",
        icon,
        report.overall.message,
        ProgressTracker::format_duration(elapsed)
    ))?;
    Ok(())
}

/// One bar per job plus an overall bar on top.
struct ProgressDisplay {
    multi: MultiProgress,
    overall: ProgressBar,
    bars: HashMap<JobId, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressDisplay {
    fn new() -> Result<Self> {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(100));
        overall.set_style(
            ProgressStyle::with_template("{prefix:.bold} [{bar:40.green/white}] {pos:>3}% {msg}")?
                .progress_chars("=> "),
        );
        overall.set_prefix("Total");
        let style = ProgressStyle::with_template(
            "{spinner:.green} {prefix:30!} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
        )?
        .progress_chars("#>-");

        Ok(Self {
            multi,
            overall,
            bars: HashMap::new(),
            style,
        })
    }

    fn on_event(&mut self, event: &JobEvent) {
        match event {
            JobEvent::SegmentRetry {
                job_id,
                index,
                attempt,
                max_attempts,
                delay,
            } => {
                let _ = self.multi.println(format!(
                    "{} {} segment {}: retry {}/{} in {:.1}s",
                    style("↻").yellow(),
                    job_id,
                    index,
                    attempt,
                    max_attempts,
                    delay.as_secs_f64()
                ));
            }
            JobEvent::StatusChanged {
                job_id,
                status: JobStatus::Failed,
                message,
            } => {
                let _ = self.multi.println(format!(
                    "{} {} failed: {}",
                    style("❌").red(),
                    job_id,
                    message.trim()
                ));
            }
            _ => {}
        }
    }

    fn render(&mut self, report: &ProgressReport) -> Result<()> {
        self.overall.set_position(report.overall.percent as u64);
        self.overall.set_message(format!(
            "{} running, {} queued",
            report.running(),
            report.count(JobStatus::Queued)
        ));

        for job in &report.jobs {
            let bar = self.bars.entry(job.id.clone()).or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar.set_prefix(job.name.clone());
                bar
            });
            if bar.is_finished() {
                continue;
            }

            bar.set_position(job.percent as u64);
            let message = match job.status {
                JobStatus::DownloadingSegments if job.bytes_per_sec > 0 => format!(
                    "{} ({})",
                    job.message,
                    ProgressTracker::format_speed(job.bytes_per_sec)
                ),
                JobStatus::Failed => "Failed".to_string(),
                _ => job.message.clone(),
            };
            if job.status.is_terminal() {
                bar.finish_with_message(message);
            } else {
                bar.set_message(message);
                bar.tick();
            }
        }
        Ok(())
    }

    fn finish(&self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
        self.overall.finish();
    }
}

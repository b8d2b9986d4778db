#![allow(dead_code)]

pub mod segment_server;

use lecture_dl::download::{MuxCommand, RetryPolicy};
use lecture_dl::{ProgressReport, Scheduler, SchedulerOptions};
use std::path::Path;
use std::time::{Duration, Instant};

/// Concatenates `{inputs}` into `{output}`. Fails with "bad codec" for jobs of lecture `broken`,
/// whose scratch directory is `<course>_broken_<stream>`.
pub fn cat_muxer() -> MuxCommand {
    MuxCommand::new(
        "sh",
        vec![
            "-c".into(),
            r#"case "$1" in *_broken_*) echo 'bad codec' >&2; exit 1;; esac; out="$1"; shift; cat "$@" > "$out""#
                .into(),
            "mux".into(),
            "{output}".into(),
            "{inputs}".into(),
        ],
    )
}

pub fn options(root: &Path) -> SchedulerOptions {
    let mut options = SchedulerOptions::new(root.join("tmp"));
    options.muxer = cat_muxer();
    options.retry = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    };
    options.grace_period = Duration::from_millis(500);
    options
}

/// Polls `progress()` until `done` holds, panicking after ten seconds.
pub async fn wait_until<F>(scheduler: &Scheduler, done: F) -> ProgressReport
where
    F: Fn(&ProgressReport) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let report = scheduler.progress().await;
        if done(&report) {
            return report;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting, last progress: {:?}",
            report.overall
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn dir_is_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

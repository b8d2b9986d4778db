#![cfg(unix)]

mod common;

use common::segment_server::{Reply, SegmentServer};
use common::{dir_is_empty, options, wait_until};
use lecture_dl::download::lock_path_for;
use lecture_dl::{
    DownloadBatch, DownloadError, JobEvent, JobId, JobStatus, OverallStatus, Scheduler, Selection,
    StreamType,
};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn selection(id: &str, title: &str, playlist_url: String) -> Selection {
    Selection::new(id, title, StreamType::Combined, playlist_url)
}

#[tokio::test]
async fn test_running_jobs_never_exceed_max_parallel() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let slow = || vec![Reply::ok("x").delayed(Duration::from_millis(400))];

    let batch = DownloadBatch::new("Course", root.path().join("out"), 2).with_selections(
        ["1", "2", "3"].map(|id| {
            let url = server.media(&format!("l{}", id), vec![slow(), slow()]);
            selection(id, &format!("Lecture {}", id), url)
        }),
    );

    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    scheduler.submit(batch).await.unwrap();

    let report = wait_until(&scheduler, |r| r.running() == 2).await;
    assert_eq!(report.count(JobStatus::Queued), 1);
    // Presentation order: active jobs first, the queued one last.
    assert_eq!(report.jobs[2].status, JobStatus::Queued);
    assert_eq!(report.jobs[2].id, JobId::new("3", StreamType::Combined));

    let mut max_running = 0;
    while scheduler.is_active().await {
        let report = scheduler.progress().await;
        max_running = max_running.max(report.running());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(max_running <= 2);

    let report = scheduler.progress().await;
    assert_eq!(report.count(JobStatus::Completed), 3);
    assert_eq!(report.overall.status, OverallStatus::Completed);
    assert_eq!(report.overall.percent, 100.0);
}

#[tokio::test]
async fn test_transient_server_errors_are_retried() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let url = server.media(
        "flaky",
        vec![
            vec![Reply::status(500), Reply::status(500), Reply::ok("first")],
            vec![Reply::ok("second")],
        ],
    );

    let (scheduler, mut events) = Scheduler::new(options(root.path())).unwrap();
    let batch = DownloadBatch::new("Course", root.path().join("out"), 1)
        .with_selection(selection("7", "Flaky", url));
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let id = JobId::new("7", StreamType::Combined);
    let report = scheduler.progress().await;
    assert_eq!(report.job(&id).unwrap().status, JobStatus::Completed);
    let segments = scheduler.job_segments(&id).await.unwrap();
    assert_eq!(segments[0].attempts, 3);
    assert_eq!(segments[1].attempts, 1);
    assert_eq!(server.hits("flaky/seg0.ts"), 3);

    let dest = root.path().join("out/Course/Flaky_comb.mp4");
    assert_eq!(std::fs::read_to_string(dest).unwrap(), "firstsecond");

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            JobEvent::SegmentRetry { index, .. } => {
                assert_eq!(index, 0);
                retries += 1;
            }
            JobEvent::SegmentCompleted {
                index: 0, attempts, ..
            } => assert_eq!(attempts, 3),
            _ => {}
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_muxer_failure_only_fails_its_job() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let batch = DownloadBatch::new("Course", root.path().join("out"), 3).with_selections([
        selection("1", "Good One", server.simple_media("a", &["a0", "a1"])),
        selection("broken", "Broken Lecture", server.simple_media("b", &["b0"])),
        selection("3", "Good Two", server.simple_media("c", &["c0"])),
    ]);

    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let report = scheduler.progress().await;
    let broken = report
        .job(&JobId::new("broken", StreamType::Combined))
        .unwrap();
    assert_eq!(broken.status, JobStatus::Failed);
    assert_eq!(broken.message, "bad codec\n");
    assert_eq!(report.count(JobStatus::Completed), 2);
    assert_eq!(report.overall.status, OverallStatus::Error);

    let course = root.path().join("out/Course");
    assert!(course.join("Good_One_comb.mp4").exists());
    assert!(course.join("Good_Two_comb.mp4").exists());
    assert!(!course.join("Broken_Lecture_comb.mp4").exists());
    assert!(!lock_path_for(&course.join("Broken_Lecture_comb.mp4")).exists());

    let log = std::fs::read_dir(&course)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.to_string_lossy().contains("download_errors_"))
        .expect("error log");
    assert_eq!(
        std::fs::read_to_string(log).unwrap(),
        "Broken Lecture\tCOMB\tbad codec\n"
    );
}

#[tokio::test]
async fn test_assembly_follows_segment_index() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let bodies = ["<zero>", "<one>", "<two>", "<three>"];

    // Later segments answer first.
    let reversed = server.media(
        "rev",
        bodies
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let delay = Duration::from_millis(100 * (bodies.len() - i) as u64);
                vec![Reply::ok(b.as_bytes()).delayed(delay)]
            })
            .collect(),
    );
    let forward = server.simple_media("fwd", &bodies);

    let batch = DownloadBatch::new("Course", root.path().join("out"), 2).with_selections([
        selection("1", "Reversed", reversed),
        selection("2", "Forward", forward),
    ]);
    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let course = root.path().join("out/Course");
    let reversed = std::fs::read(course.join("Reversed_comb.mp4")).unwrap();
    let forward = std::fs::read(course.join("Forward_comb.mp4")).unwrap();
    assert_eq!(reversed, forward);
    assert_eq!(reversed, b"<zero><one><two><three>");
}

#[tokio::test]
async fn test_cancel_mid_batch() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let stalled = || vec![Reply::ok("late").delayed(Duration::from_secs(10))];

    let batch = DownloadBatch::new("Course", root.path().join("out"), 1).with_selections([
        selection("1", "Done", server.simple_media("done", &["d0"])),
        selection("2", "Running", server.media("run", vec![stalled(), stalled()])),
        selection("3", "Waiting", server.simple_media("wait", &["w0"])),
    ]);

    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    scheduler.submit(batch).await.unwrap();

    let running = JobId::new("2", StreamType::Combined);
    wait_until(&scheduler, |r| {
        r.job(&running)
            .is_some_and(|j| j.status == JobStatus::DownloadingSegments)
    })
    .await;

    let started = Instant::now();
    scheduler.cancel().await.unwrap();
    let cleanup = scheduler.wait().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let report = scheduler.progress().await;
    let status = |id: &str| {
        report
            .job(&JobId::new(id, StreamType::Combined))
            .unwrap()
            .status
    };
    assert_eq!(status("1"), JobStatus::Completed);
    assert_eq!(status("2"), JobStatus::Cancelled);
    assert_eq!(status("3"), JobStatus::Cancelled);
    assert_eq!(report.overall.status, OverallStatus::Cancelled);
    assert_eq!(server.hits("wait/playlist.m3u8"), 0);

    let course = root.path().join("out/Course");
    assert_eq!(
        std::fs::read_to_string(course.join("Done_comb.mp4")).unwrap(),
        "d0"
    );
    assert!(!course.join("Running_comb.mp4").exists());
    assert!(!lock_path_for(&course.join("Running_comb.mp4")).exists());

    assert!(scheduler.registry().is_empty());
    assert!(dir_is_empty(&root.path().join("tmp")));
    assert_eq!(cleanup.orphans_killed, 0);
    assert!(!scheduler.is_active().await);
}

#[tokio::test]
async fn test_single_active_batch() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();

    assert!(matches!(
        scheduler.cancel().await,
        Err(DownloadError::NoActiveBatch)
    ));

    let stalled = server.media(
        "stall",
        vec![vec![Reply::ok("x").delayed(Duration::from_secs(10))]],
    );
    let batch = DownloadBatch::new("Course", root.path().join("out"), 1)
        .with_selection(selection("1", "Stalled", stalled));
    scheduler.submit(batch.clone()).await.unwrap();

    assert!(matches!(
        scheduler.submit(batch).await,
        Err(DownloadError::BatchConflict)
    ));

    scheduler.cancel().await.unwrap();
    scheduler.wait().await.unwrap();
    assert!(matches!(
        scheduler.cancel().await,
        Err(DownloadError::NoActiveBatch)
    ));
}

#[tokio::test]
async fn test_missing_playlist_fails_job() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let (scheduler, mut events) = Scheduler::new(options(root.path())).unwrap();

    let batch = DownloadBatch::new("Course", root.path().join("out"), 2)
        .with_selection(selection("9", "Gone", server.url("gone/playlist.m3u8")))
        .with_selection(selection("10", "Fine", server.simple_media("fine", &["f"])));
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let report = scheduler.progress().await;
    let gone = report.job(&JobId::new("9", StreamType::Combined)).unwrap();
    assert_eq!(gone.status, JobStatus::Failed);
    assert!(gone.message.contains("404"), "message: {}", gone.message);
    assert_eq!(
        report
            .job(&JobId::new("10", StreamType::Combined))
            .unwrap()
            .status,
        JobStatus::Completed
    );

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::BatchFinished { status, .. } = event {
            finished = Some(status);
        }
    }
    assert_eq!(finished, Some(OverallStatus::Error));
}

#[tokio::test]
async fn test_percent_is_monotonic() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let segments = (0..12)
        .map(|i| vec![Reply::ok(vec![b'x'; 1024]).delayed(Duration::from_millis(30 * (i % 4)))])
        .collect();
    let url = server.media("mono", segments);

    let mut opts = options(root.path());
    opts.segment_concurrency = 3;
    let (scheduler, _events) = Scheduler::new(opts).unwrap();
    let batch = DownloadBatch::new("Course", root.path().join("out"), 1)
        .with_selection(selection("1", "Mono", url));
    scheduler.submit(batch).await.unwrap();

    let id = JobId::new("1", StreamType::Combined);
    let mut last = 0.0;
    while scheduler.is_active().await {
        if let Some(job) = scheduler.progress().await.job(&id).cloned() {
            assert!(job.percent >= last, "{} dropped to {}", last, job.percent);
            last = job.percent;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let job = scheduler.progress().await.job(&id).cloned().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.segments_done, 12);
    assert_eq!(job.percent, 100.0);
}

#[tokio::test]
async fn test_existing_download_is_skipped() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let course = root.path().join("out/Course");
    std::fs::create_dir_all(&course).unwrap();
    std::fs::write(course.join("Old_comb.mp4"), b"kept").unwrap();

    let url = server.simple_media("old", &["new"]);
    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    let batch = DownloadBatch::new("Course", root.path().join("out"), 1)
        .with_selection(selection("1", "Old", url));
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let report = scheduler.progress().await;
    assert_eq!(report.jobs[0].status, JobStatus::Completed);
    assert_eq!(report.jobs[0].message, "Already downloaded");
    assert_eq!(server.hits("old/playlist.m3u8"), 0);
    assert_eq!(std::fs::read(course.join("Old_comb.mp4")).unwrap(), b"kept");
}

#[tokio::test]
async fn test_same_title_lectures_do_not_share_scratch_space() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let first = server.media(
        "a",
        vec![
            vec![Reply::ok("a0")],
            vec![Reply::ok("a1").delayed(Duration::from_millis(800))],
        ],
    );
    let second = server.simple_media("b", &["b0", "b1"]);

    let out = root.path().join("out");
    let batch = DownloadBatch::new("Course", out.clone(), 2).with_selections([
        selection("1", "Exercise", first).with_dest_path(out.join("one.mp4")),
        selection("2", "Exercise", second).with_dest_path(out.join("two.mp4")),
    ]);
    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let report = scheduler.progress().await;
    assert_eq!(report.count(JobStatus::Completed), 2, "{:?}", report.jobs);
    assert_eq!(std::fs::read_to_string(out.join("one.mp4")).unwrap(), "a0a1");
    assert_eq!(std::fs::read_to_string(out.join("two.mp4")).unwrap(), "b0b1");
    assert_eq!(server.hits("a/seg0.ts"), 1);
    assert_eq!(server.hits("b/seg0.ts"), 1);
    assert!(dir_is_empty(&root.path().join("tmp")));
}

#[tokio::test]
async fn test_missing_segment_fails_only_its_job() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let gone = server.media(
        "gone",
        vec![
            vec![Reply::ok("g0")],
            vec![Reply::status(404)],
            vec![Reply::ok("g2").delayed(Duration::from_millis(300))],
        ],
    );
    let sibling = server.media(
        "ok",
        vec![
            vec![Reply::ok("o0").delayed(Duration::from_millis(200))],
            vec![Reply::ok("o1")],
        ],
    );

    let batch = DownloadBatch::new("Course", root.path().join("out"), 2).with_selections([
        selection("1", "Gone", gone),
        selection("2", "Sibling", sibling),
    ]);
    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let id = JobId::new("1", StreamType::Combined);
    let report = scheduler.progress().await;
    let job = report.job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "Segment 1 failed after 1 attempt(s): HTTP 404");
    assert_eq!(
        report
            .job(&JobId::new("2", StreamType::Combined))
            .unwrap()
            .status,
        JobStatus::Completed
    );

    let segments = scheduler.job_segments(&id).await.unwrap();
    assert_eq!(segments[1].attempts, 1);
    assert_eq!(server.hits("gone/seg1.ts"), 1);

    let course = root.path().join("out/Course");
    assert!(!course.join("Gone_comb.mp4").exists());
    assert!(!lock_path_for(&course.join("Gone_comb.mp4")).exists());
    assert_eq!(
        std::fs::read_to_string(course.join("Sibling_comb.mp4")).unwrap(),
        "o0o1"
    );
    assert!(scheduler.registry().is_empty());
    assert!(dir_is_empty(&root.path().join("tmp")));
}

#[tokio::test]
async fn test_rate_limited_segment_is_retried() {
    let server = SegmentServer::start();
    let root = TempDir::new().unwrap();
    let url = server.media(
        "busy",
        vec![vec![Reply::status(429), Reply::ok("late")], vec![Reply::ok("now")]],
    );

    let (scheduler, _events) = Scheduler::new(options(root.path())).unwrap();
    let batch = DownloadBatch::new("Course", root.path().join("out"), 1)
        .with_selection(selection("3", "Busy", url));
    scheduler.submit(batch).await.unwrap();
    scheduler.wait().await.unwrap();

    let id = JobId::new("3", StreamType::Combined);
    let report = scheduler.progress().await;
    assert_eq!(report.job(&id).unwrap().status, JobStatus::Completed);
    assert_eq!(scheduler.job_segments(&id).await.unwrap()[0].attempts, 2);
    assert_eq!(server.hits("busy/seg0.ts"), 2);
    assert_eq!(
        std::fs::read_to_string(root.path().join("out/Course/Busy_comb.mp4")).unwrap(),
        "latenow"
    );
}

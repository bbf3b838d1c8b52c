//! End-to-end scheduler flows through the library surface.
//!
//! Every test drives a real child process via `/bin/sh`, the same way a
//! deployed scheduler drives the crawl script.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use crawlsched::api;
use crawlsched::config::CrawlschedConfig;
use crawlsched::faillog::FailureRecord;
use crawlsched::runner::status::Trigger;
use crawlsched::runner::{CrawlScheduler, TriggerRefused};

fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("crawl.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn config_for(dir: &Path, script: PathBuf) -> CrawlschedConfig {
    let mut cfg = CrawlschedConfig::default();
    cfg.crawler.script = Some(script);
    cfg.crawler.timeout_sec = 5;
    cfg.crawler.grace_sec = 1;
    cfg.failure_log.dir = dir.join("logs");
    cfg
}

/// The flow an operator lives through when the venue feed breaks over a
/// weekend: failures pile up, the breaker opens, the feed is fixed, and a
/// manual run brings scheduling back.
#[tokio::test]
async fn test_outage_and_recovery_flow() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let marker = dir.path().join("outage");
    std::fs::write(&marker, "")?;
    let script = write_script(
        dir.path(),
        &format!("test ! -e {}", marker.display()),
    );
    let scheduler = Arc::new(CrawlScheduler::new(&config_for(dir.path(), script))?);

    println!("Step 1: the crawl fails three times in a row...");
    for attempt in 1..=3u32 {
        let report = scheduler
            .run_once(Trigger::Manual)
            .await
            .context("run was refused")?;
        assert!(!report.success, "attempt {attempt} should fail");
    }
    let status = scheduler.snapshot().await;
    assert_eq!(status.consecutive_failures, 3);
    assert!(status.breaker_open(scheduler.failure_threshold()));

    println!("Step 2: the weekly tick is refused while the breaker is open...");
    let refused = scheduler.run_once(Trigger::Scheduled).await.unwrap_err();
    assert!(matches!(refused, TriggerRefused::BreakerOpen { failures: 3 }));
    assert_eq!(scheduler.snapshot().await.total_runs, 3);

    println!("Step 3: every failure left a record in the log...");
    let content = std::fs::read_to_string(scheduler.failure_log_path())?;
    let records: Vec<FailureRecord> = content
        .lines()
        .map(serde_json::from_str)
        .collect::<std::result::Result<_, _>>()
        .context("failure log line did not parse")?;
    assert_eq!(records.len(), 3);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.consecutive_failures, i as u32 + 1);
    }

    println!("Step 4: the feed is fixed, a manual run closes the breaker...");
    std::fs::remove_file(&marker)?;
    let report = scheduler.run_once(Trigger::Manual).await.unwrap();
    assert!(report.success);
    let status = scheduler.snapshot().await;
    assert_eq!(status.consecutive_failures, 0);
    assert!(!status.breaker_open(scheduler.failure_threshold()));

    println!("Step 5: scheduled runs flow again...");
    let report = scheduler.run_once(Trigger::Scheduled).await.unwrap();
    assert!(report.success);
    assert_eq!(scheduler.snapshot().await.total_runs, 5);

    Ok(())
}

/// A crawl that ignores SIGTERM is killed after the grace period and the
/// timeout is recorded as a failure.
#[tokio::test]
async fn test_hung_crawl_is_terminated_and_logged() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let script = write_script(dir.path(), "trap '' TERM\nsleep 30");
    let mut cfg = config_for(dir.path(), script);
    cfg.crawler.timeout_sec = 1;
    cfg.crawler.grace_sec = 1;
    let scheduler = CrawlScheduler::new(&cfg)?;

    let started = std::time::Instant::now();
    let report = scheduler.run_once(Trigger::Manual).await.unwrap();
    let elapsed = started.elapsed();

    assert!(!report.success);
    let message = report.error.as_deref().unwrap();
    assert!(
        message.contains("timed out after 1s"),
        "message: {message}"
    );
    // SIGTERM is ignored, so the kill had to escalate past the grace
    // period, and well short of the 30s the script wanted.
    assert!(elapsed >= std::time::Duration::from_secs(1));
    assert!(elapsed < std::time::Duration::from_secs(10));

    let content = std::fs::read_to_string(scheduler.failure_log_path())?;
    let record: FailureRecord = serde_json::from_str(content.trim())?;
    assert!(record.error.contains("timed out"));
    assert!(record.duration_ms >= 1000);

    Ok(())
}

/// The HTTP status endpoint reflects a breaker opened by real failures.
#[tokio::test]
async fn test_status_endpoint_reflects_the_breaker() -> Result<()> {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let dir = tempfile::TempDir::new()?;
    let script = write_script(dir.path(), "exit 1");
    let scheduler = Arc::new(CrawlScheduler::new(&config_for(dir.path(), script))?);

    for _ in 0..3 {
        scheduler.run_once(Trigger::Manual).await.unwrap();
    }

    let app = api::router(api::state::AppState {
        scheduler: Arc::clone(&scheduler),
    });
    let response = app
        .oneshot(Request::builder().uri("/api/v1/status").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await?;
    let json: serde_json::Value = serde_json::from_slice(&bytes)?;
    let data = &json["data"];
    assert_eq!(data["breaker_open"], true);
    assert_eq!(data["consecutive_failures"], 3);
    assert_eq!(data["total_failures"], 3);
    assert_eq!(data["last_success"], false);
    assert!(data["last_error"].as_str().unwrap().contains("exited"));
    // Duration is reported in seconds.
    assert!(data["last_run_duration_seconds"].is_number());

    Ok(())
}

/// Repeated failures roll the log over once it crosses the size ceiling.
#[tokio::test]
async fn test_failure_log_rotates_under_repeated_failures() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let script = write_script(dir.path(), "echo scrape aborted midway >&2; exit 9");
    let mut cfg = config_for(dir.path(), script);
    cfg.failure_log.max_bytes = 400;
    let scheduler = CrawlScheduler::new(&cfg)?;

    // Manual triggers bypass the breaker, so all six attempts run.
    for _ in 0..6 {
        let report = scheduler.run_once(Trigger::Manual).await.unwrap();
        assert!(!report.success);
    }
    assert_eq!(scheduler.snapshot().await.total_failures, 6);

    let log_dir = dir.path().join("logs");
    let mut archives = 0;
    let mut has_current = false;
    for entry in std::fs::read_dir(&log_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name == crawlsched::faillog::FILE_NAME {
            has_current = true;
        } else if name.starts_with(crawlsched::faillog::FILE_NAME) {
            archives += 1;
        }
    }
    assert!(has_current, "current log file should exist");
    assert!(archives >= 1, "at least one rotated archive expected");

    Ok(())
}

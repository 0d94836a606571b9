//! Integration tests for the scrape manager
//!
//! External tools are stubbed with small shell scripts so the full
//! supervision path runs: spawn, line parsing, history persistence,
//! download logging, and the post-job reconciliation trigger.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use driftnet_common::config::TomlConfig;
use driftnet_common::events::{EventBus, IngestEvent};
use driftnet_ingest::db;
use driftnet_ingest::models::job::{ExtractorTool, RunStatus, ScrapeOptions};
use driftnet_ingest::AppState;

fn write_stub_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn setup_with_tool(tool_body: &str) -> (TempDir, AppState) {
    let dir = TempDir::new().expect("tempdir");
    let stub = write_stub_tool(dir.path(), "stub-gallery-dl", tool_body);

    let mut config = TomlConfig::default();
    config.tools.gallery_dl = stub.to_string_lossy().into_owned();

    let paths = driftnet_common::config::LibraryPaths::new(dir.path().join("library"));
    let state = AppState::new(paths, &config, EventBus::new(256))
        .await
        .expect("app state");
    (dir, state)
}

async fn seed_source(state: &AppState) -> i64 {
    db::sources::insert_source(&state.db, "https://example.com/u1", "twitter", Some("u1"))
        .await
        .unwrap()
}

/// Wait for a matching event, tolerating lag, with a hard timeout
async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<IngestEvent>,
    what: &str,
    predicate: F,
) -> IngestEvent
where
    F: Fn(&IngestEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => panic!("event bus closed while waiting for {}", what),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

#[tokio::test]
async fn completed_scrape_persists_history_and_reconciles() {
    let (_dir, state) = setup_with_tool(
        r#"echo "[start]"
echo "[success] /root/a/1.jpg"
echo "[skip] /root/a/2.jpg"
echo "[post-complete]"
exit 0"#,
    )
    .await;
    let source_id = seed_source(&state).await;
    let mut events = state.event_bus.subscribe();

    let started = state
        .scrape_manager
        .start_scrape(
            source_id,
            ExtractorTool::GalleryDl,
            "https://example.com/u1".to_string(),
            state.paths.download_root.join("twitter"),
            ScrapeOptions::default(),
        )
        .await
        .unwrap();
    assert!(started);

    wait_for_event(&mut events, "scrape finish", |e| {
        matches!(e, IngestEvent::ScrapeFinished { source_id: sid, .. } if *sid == source_id)
    })
    .await;
    // Reconciliation is triggered unconditionally after the job
    wait_for_event(&mut events, "post-scrape scan", |e| {
        matches!(e, IngestEvent::ScanFinished { .. })
    })
    .await;

    let history = db::history::list_recent(&state.db, source_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    let row = &history[0];
    assert_eq!(row.status, "completed");
    assert_eq!(row.files_downloaded, 1);
    assert_eq!(row.skipped_count, 1);
    assert_eq!(row.posts_processed, 1);
    assert!(row.end_time.is_some());

    // Discovered files are logged back to their source
    assert_eq!(
        db::history::source_for_file(&state.db, "/root/a/1.jpg").await.unwrap(),
        Some(source_id)
    );
    assert_eq!(
        db::history::source_for_file(&state.db, "/root/a/2.jpg").await.unwrap(),
        Some(source_id)
    );

    let scan = db::runs::latest_scan_run(&state.db).await.unwrap().unwrap();
    assert_eq!(scan.status, "completed");

    // Terminal status stays pollable during the grace window
    let status = state.scrape_manager.get_status(source_id).await.unwrap();
    assert!(status.is_finished);
    assert_eq!(status.final_status, Some(RunStatus::Completed));

    state.shutdown();
}

#[tokio::test]
async fn failed_scrape_still_triggers_reconciliation() {
    let (_dir, state) = setup_with_tool(
        r#"echo "[success] /root/a/partial.jpg"
echo "boom" >&2
exit 2"#,
    )
    .await;
    let source_id = seed_source(&state).await;
    let mut events = state.event_bus.subscribe();

    state
        .scrape_manager
        .start_scrape(
            source_id,
            ExtractorTool::GalleryDl,
            "https://example.com/u1".to_string(),
            state.paths.download_root.join("twitter"),
            ScrapeOptions::default(),
        )
        .await
        .unwrap();

    let finished = wait_for_event(&mut events, "scrape finish", |e| {
        matches!(e, IngestEvent::ScrapeFinished { source_id: sid, .. } if *sid == source_id)
    })
    .await;
    match finished {
        IngestEvent::ScrapeFinished { status, .. } => assert_eq!(status, "failed"),
        _ => unreachable!(),
    }

    // Failure is non-fatal: partial downloads are still captured
    wait_for_event(&mut events, "post-scrape scan", |e| {
        matches!(e, IngestEvent::ScanFinished { .. })
    })
    .await;

    let history = db::history::list_recent(&state.db, source_id, 10).await.unwrap();
    assert_eq!(history[0].status, "failed");
    let error = history[0].last_error.clone().unwrap();
    assert!(error.contains("code 2"), "error was: {}", error);
    assert!(error.contains("boom"), "error was: {}", error);
    assert_eq!(history[0].files_downloaded, 1);
    assert_eq!(
        db::history::source_for_file(&state.db, "/root/a/partial.jpg")
            .await
            .unwrap(),
        Some(source_id)
    );

    state.shutdown();
}

#[tokio::test]
async fn at_most_one_job_per_source() {
    let (_dir, state) = setup_with_tool("sleep 30").await;
    let source_id = seed_source(&state).await;

    let first = state
        .scrape_manager
        .start_scrape(
            source_id,
            ExtractorTool::GalleryDl,
            "https://example.com/u1".to_string(),
            state.paths.download_root.join("twitter"),
            ScrapeOptions::default(),
        )
        .await
        .unwrap();
    assert!(first);

    // A second start for the same source is refused
    let second = state
        .scrape_manager
        .start_scrape(
            source_id,
            ExtractorTool::GalleryDl,
            "https://example.com/u1".to_string(),
            state.paths.download_root.join("twitter"),
            ScrapeOptions::default(),
        )
        .await
        .unwrap();
    assert!(!second);

    // Only one history row was created
    let history = db::history::list_recent(&state.db, source_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);

    assert!(state.scrape_manager.stop_scrape(source_id).await.unwrap());
    state.shutdown();
}

#[tokio::test]
async fn stop_persists_a_stopped_snapshot_before_the_kill() {
    let (_dir, state) = setup_with_tool(
        r#"echo "[success] /root/a/1.jpg"
sleep 30"#,
    )
    .await;
    let source_id = seed_source(&state).await;
    let mut events = state.event_bus.subscribe();

    state
        .scrape_manager
        .start_scrape(
            source_id,
            ExtractorTool::GalleryDl,
            "https://example.com/u1".to_string(),
            state.paths.download_root.join("twitter"),
            ScrapeOptions::default(),
        )
        .await
        .unwrap();

    // Let the success line arrive before stopping
    wait_for_event(&mut events, "first progress", |e| {
        matches!(e, IngestEvent::ScrapeProgress { downloaded, .. } if *downloaded >= 1)
    })
    .await;

    assert!(state.scrape_manager.stop_scrape(source_id).await.unwrap());

    let history = db::history::list_recent(&state.db, source_id, 10).await.unwrap();
    assert_eq!(history[0].status, "stopped");
    assert_eq!(history[0].files_downloaded, 1);

    // The job is gone from the registry immediately after a stop
    assert!(state.scrape_manager.get_status(source_id).await.is_none());
    // Stopping again is a warned no-op
    assert!(!state.scrape_manager.stop_scrape(source_id).await.unwrap());

    // Reconciliation still runs after a stop
    wait_for_event(&mut events, "post-stop scan", |e| {
        matches!(e, IngestEvent::ScanFinished { .. })
    })
    .await;

    state.shutdown();
}

#[tokio::test]
async fn spawn_failure_fails_the_history_row() {
    let dir = TempDir::new().unwrap();
    let mut config = TomlConfig::default();
    config.tools.gallery_dl = dir
        .path()
        .join("missing-binary")
        .to_string_lossy()
        .into_owned();

    let paths = driftnet_common::config::LibraryPaths::new(dir.path().join("library"));
    let state = AppState::new(paths, &config, EventBus::new(64)).await.unwrap();
    let source_id = seed_source(&state).await;

    let result = state
        .scrape_manager
        .start_scrape(
            source_id,
            ExtractorTool::GalleryDl,
            "https://example.com/u1".to_string(),
            state.paths.download_root.join("twitter"),
            ScrapeOptions::default(),
        )
        .await;
    assert!(result.is_err());

    let history = db::history::list_recent(&state.db, source_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "failed");
    assert!(history[0].last_error.is_some());

    state.shutdown();
}

//! Integration tests for the library reconciliation engine
//!
//! Each test builds a real download tree in a tempdir and a real SQLite
//! file database, then runs full reconciliation passes against them.

use std::path::Path;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use driftnet_common::config::TomlConfig;
use driftnet_common::events::{EventBus, IngestEvent};
use driftnet_ingest::db;
use driftnet_ingest::models::job::{RunStatus, SourceFamily};
use driftnet_ingest::AppState;

async fn setup_with_config(config: TomlConfig) -> (TempDir, AppState) {
    let dir = TempDir::new().expect("tempdir");
    let paths = driftnet_common::config::LibraryPaths::new(dir.path().to_path_buf());
    let state = AppState::new(paths, &config, EventBus::new(256))
        .await
        .expect("app state");
    (dir, state)
}

async fn setup() -> (TempDir, AppState) {
    setup_with_config(TomlConfig::default()).await
}

/// Fixture tree: a twitter post with sidecar, a bare media file, a pixiv
/// work with sidecar, and a standalone gelbooru sidecar. Avatar URLs are
/// deliberately absent so no network is touched.
fn write_fixture_tree(download_root: &Path) {
    let twitter = download_root.join("twitter").join("user1");
    std::fs::create_dir_all(&twitter).unwrap();
    std::fs::write(twitter.join("100_1.jpg"), b"jpegdata").unwrap();
    std::fs::write(
        twitter.join("100_1.jpg.json"),
        br#"{
            "category": "twitter",
            "tweet_id": 100,
            "date": "2024-01-01 00:00:00",
            "content": "first post #art",
            "hashtags": ["art"],
            "author": {"id": 1, "name": "u1", "nick": "User One"}
        }"#,
    )
    .unwrap();
    std::fs::write(twitter.join("101_1.jpg"), b"jpegdata2").unwrap();

    let pixiv = download_root.join("pixiv").join("artist9");
    std::fs::create_dir_all(&pixiv).unwrap();
    std::fs::write(pixiv.join("200_p0.png"), b"pngdata").unwrap();
    std::fs::write(
        pixiv.join("200_p0.png.json"),
        br#"{
            "category": "pixiv",
            "id": 200,
            "title": "sketchbook",
            "date": "2023-06-01T09:00:00+09:00",
            "tags": ["art", "sketch"],
            "count": 1,
            "user": {"id": 9, "name": "Artist", "account": "artist9"}
        }"#,
    )
    .unwrap();

    let booru = download_root.join("gelbooru");
    std::fs::create_dir_all(&booru).unwrap();
    std::fs::write(
        booru.join("300.json"),
        br#"{"category": "gelbooru", "id": 300, "tags": "sky cloud", "score": 5}"#,
    )
    .unwrap();
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let (_dir, state) = setup().await;
    write_fixture_tree(&state.paths.download_root);

    let first = state
        .reconciler
        .sync_library()
        .await
        .unwrap()
        .expect("first pass ran");
    assert_eq!(first.status, RunStatus::Completed);
    // 100_1.jpg, 101_1.jpg, 200_p0.png, and the standalone 300.json
    assert_eq!(first.counters.files_added, 4);
    assert_eq!(first.counters.errors, 0);

    let media = db::media::count_media(&state.db).await.unwrap();
    let posts = db::posts::count_posts(&state.db).await.unwrap();
    let tags = db::tags::count_tags(&state.db).await.unwrap();
    assert_eq!(media, 4);
    assert_eq!(posts, 3);
    // art, sketch, sky, cloud; "art" is shared and stored once
    assert_eq!(tags, 4);

    let second = state
        .reconciler
        .sync_library()
        .await
        .unwrap()
        .expect("second pass ran");
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.counters.files_added, 0);
    assert_eq!(second.counters.files_updated, 0);
    assert_eq!(second.counters.files_deleted, 0);

    assert_eq!(db::media::count_media(&state.db).await.unwrap(), media);
    assert_eq!(db::posts::count_posts(&state.db).await.unwrap(), posts);
    assert_eq!(db::tags::count_tags(&state.db).await.unwrap(), tags);

    state.shutdown();
}

#[tokio::test]
async fn entities_are_normalized_per_family() {
    let (_dir, state) = setup().await;
    write_fixture_tree(&state.paths.download_root);

    state.reconciler.sync_library().await.unwrap().unwrap();

    assert_eq!(
        db::users::count_users(&state.db, SourceFamily::Twitter)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        db::users::count_users(&state.db, SourceFamily::Pixiv)
            .await
            .unwrap(),
        1
    );

    // The standalone sidecar stays visible as a text item
    let text_path = state
        .paths
        .download_root
        .join("gelbooru")
        .join("300.json")
        .to_string_lossy()
        .into_owned();
    assert_eq!(
        db::media::media_type_for_path(&state.db, &text_path)
            .await
            .unwrap()
            .as_deref(),
        Some("text")
    );

    // Tag links do not duplicate across passes
    let keys = db::posts::load_existing_post_keys(&state.db).await.unwrap();
    let pixiv_post = *keys.get("pixiv:200").expect("pixiv post indexed");
    state.reconciler.sync_library().await.unwrap().unwrap();
    assert_eq!(
        db::tags::count_post_tags(&state.db, pixiv_post).await.unwrap(),
        2
    );

    state.shutdown();
}

#[tokio::test]
async fn orphans_are_deleted_once_and_only_by_completed_scans() {
    let (_dir, state) = setup().await;
    write_fixture_tree(&state.paths.download_root);

    state.reconciler.sync_library().await.unwrap().unwrap();
    assert_eq!(db::media::count_media(&state.db).await.unwrap(), 4);

    let removed = state
        .paths
        .download_root
        .join("twitter")
        .join("user1")
        .join("101_1.jpg");
    std::fs::remove_file(&removed).unwrap();

    // A stopped scan must not treat unseen files as deleted
    let cancel = CancellationToken::new();
    cancel.cancel();
    let stopped = state
        .reconciler
        .sync_library_with(cancel)
        .await
        .unwrap()
        .expect("stopped pass ran");
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert_eq!(stopped.counters.files_processed, 0);
    assert_eq!(stopped.counters.files_deleted, 0);
    assert_eq!(db::media::count_media(&state.db).await.unwrap(), 4);

    // The next completed scan removes the orphan exactly once
    let completed = state.reconciler.sync_library().await.unwrap().unwrap();
    assert_eq!(completed.status, RunStatus::Completed);
    assert_eq!(completed.counters.files_deleted, 1);
    assert_eq!(db::media::count_media(&state.db).await.unwrap(), 3);

    let again = state.reconciler.sync_library().await.unwrap().unwrap();
    assert_eq!(again.counters.files_deleted, 0);

    state.shutdown();
}

#[tokio::test]
async fn changed_sidecars_update_without_duplicating_posts() {
    let (_dir, state) = setup().await;
    write_fixture_tree(&state.paths.download_root);

    state.reconciler.sync_library().await.unwrap().unwrap();
    let posts_before = db::posts::count_posts(&state.db).await.unwrap();

    // Rewrite the pixiv sidecar with different content
    let sidecar = state
        .paths
        .download_root
        .join("pixiv")
        .join("artist9")
        .join("200_p0.png.json");
    std::fs::write(
        &sidecar,
        br#"{
            "category": "pixiv",
            "id": 200,
            "title": "sketchbook (renamed)",
            "tags": ["art", "sketch"],
            "count": 1,
            "user": {"id": 9, "name": "Artist", "account": "artist9"}
        }"#,
    )
    .unwrap();

    let summary = state.reconciler.sync_library().await.unwrap().unwrap();
    assert_eq!(summary.counters.files_updated, 1);
    assert_eq!(summary.counters.files_added, 0);
    // The post dedup key is unchanged, so no new post row appears
    assert_eq!(
        db::posts::count_posts(&state.db).await.unwrap(),
        posts_before
    );

    state.shutdown();
}

#[tokio::test]
async fn malformed_sidecars_are_counted_and_skipped() {
    let (_dir, state) = setup().await;
    let dir = state.paths.download_root.join("twitter").join("broken");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("7.jpg"), b"img").unwrap();
    std::fs::write(dir.join("7.json"), b"{not json at all").unwrap();

    let summary = state.reconciler.sync_library().await.unwrap().unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counters.errors, 1);
    // The media file is still indexed, just without a post
    assert_eq!(summary.counters.files_added, 1);
    assert_eq!(db::posts::count_posts(&state.db).await.unwrap(), 0);

    state.shutdown();
}

#[tokio::test]
async fn stop_request_halts_the_scan_at_a_batch_boundary() {
    let mut config = TomlConfig::default();
    config.scan.batch_size = 10;
    let (_dir, state) = setup_with_config(config).await;

    let dir = state.paths.download_root.join("twitter").join("bulk");
    std::fs::create_dir_all(&dir).unwrap();
    for i in 0..400 {
        std::fs::write(dir.join(format!("{}_1.jpg", 1000 + i)), b"x").unwrap();
    }

    let mut events = state.event_bus.subscribe();
    let cancel = CancellationToken::new();

    let reconciler = state.reconciler.clone();
    let scan_cancel = cancel.clone();
    let scan = tokio::spawn(async move { reconciler.sync_library_with(scan_cancel).await });

    // Cancel as soon as the first batch reports progress
    loop {
        match events.recv().await {
            Ok(IngestEvent::ScanProgress { .. }) => {
                cancel.cancel();
                break;
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(_) => panic!("event bus closed"),
        }
    }

    let summary = scan.await.unwrap().unwrap().expect("scan ran");
    assert_eq!(summary.status, RunStatus::Stopped);
    assert!(
        summary.counters.files_processed < 400,
        "processed {} of 400",
        summary.counters.files_processed
    );

    state.shutdown();
}

//! driftnet-ingest library interface
//!
//! Exposes the scrape-supervision and library-reconciliation services for
//! the CLI binary and for integration tests.

pub mod db;
pub mod models;
pub mod services;

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use driftnet_common::config::{LibraryPaths, TomlConfig};
use driftnet_common::events::EventBus;

use services::avatar_fetcher::AvatarFetcher;
use services::reconciler::LibraryReconciler;
use services::repair::RepairController;
use services::runner::ProcessRunner;
use services::scrape_manager::ScrapeManager;
use services::task_queue::RateLimitedQueue;
use services::terminate::platform_terminator;

/// Application state: every service is constructed here and shared by
/// reference; there are no ambient globals.
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub paths: LibraryPaths,
    pub task_queue: Arc<RateLimitedQueue>,
    pub reconciler: Arc<LibraryReconciler>,
    pub scrape_manager: Arc<ScrapeManager>,
    pub repair: Arc<RepairController>,
}

impl AppState {
    pub async fn new(
        paths: LibraryPaths,
        config: &TomlConfig,
        event_bus: EventBus,
    ) -> Result<Self> {
        paths.ensure_directories()?;
        let db = db::init_database_pool(&paths.database).await?;

        let task_queue =
            RateLimitedQueue::start(Duration::from_millis(config.scan.queue_interval_ms));
        let avatars = Arc::new(AvatarFetcher::new(
            task_queue.clone(),
            paths.avatar_root.clone(),
        )?);

        let runner = ProcessRunner::new(platform_terminator());

        let reconciler = Arc::new(LibraryReconciler::new(
            db.clone(),
            event_bus.clone(),
            avatars,
            paths.download_root.clone(),
            config.scan.batch_size,
            config.scan.fingerprint,
        ));

        let scrape_manager = Arc::new(ScrapeManager::new(
            db.clone(),
            event_bus.clone(),
            runner,
            reconciler.clone(),
            config.tools.clone(),
        ));

        let repair = Arc::new(RepairController::new(
            db.clone(),
            event_bus.clone(),
            runner,
            config.tools.clone(),
            paths.download_root.clone(),
        ));

        Ok(Self {
            db,
            event_bus,
            paths,
            task_queue,
            reconciler,
            scrape_manager,
            repair,
        })
    }

    /// Stop background resources (the queue drain task)
    pub fn shutdown(&self) {
        self.task_queue.shutdown();
    }
}

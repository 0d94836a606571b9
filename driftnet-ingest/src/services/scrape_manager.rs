//! Scrape manager
//!
//! Supervises at most one active job per content source. The per-source
//! claim happens while the registry lock is held, so two near-simultaneous
//! starts cannot both win. Every terminal path (completed, failed, or
//! stopped) persists a history snapshot and triggers reconciliation, so
//! partial downloads are captured even when the tool dies.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use driftnet_common::config::ToolPaths;
use driftnet_common::events::{EventBus, IngestEvent};

use crate::db;
use crate::db::history::HistoryOutcome;
use crate::models::job::{ExtractorTool, JobSpec, RunStatus, ScrapeOptions, ScrapeStatus};
use crate::services::reconciler::LibraryReconciler;
use crate::services::runner::{ProcessHandle, ProcessRunner, RunningJob, SharedStrategy};
use crate::services::strategy::{build_strategy, ScrapeOutcome, StrategyCounters};

/// Terminal status stays pollable for this long before eviction
const STATUS_GRACE: Duration = Duration::from_secs(30);

/// How often tool counters are mirrored into the shared status record
const PROGRESS_MIRROR_INTERVAL: Duration = Duration::from_millis(500);

struct ActiveJob {
    status: Arc<RwLock<ScrapeStatus>>,
    strategy: SharedStrategy,
    handle: Arc<ProcessHandle>,
}

/// Per-source scrape job supervisor
pub struct ScrapeManager {
    db: SqlitePool,
    event_bus: EventBus,
    runner: ProcessRunner,
    reconciler: Arc<LibraryReconciler>,
    tool_paths: ToolPaths,
    jobs: Mutex<HashMap<i64, ActiveJob>>,
}

impl ScrapeManager {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        runner: ProcessRunner,
        reconciler: Arc<LibraryReconciler>,
        tool_paths: ToolPaths,
    ) -> Self {
        Self {
            db,
            event_bus,
            runner,
            reconciler,
            tool_paths,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a scrape job for a source. Returns `Ok(false)` (with a
    /// warning) if a job for that source is already active.
    pub async fn start_scrape(
        self: &Arc<Self>,
        source_id: i64,
        tool: ExtractorTool,
        url: String,
        dest_dir: PathBuf,
        opts: ScrapeOptions,
    ) -> Result<bool> {
        // The registry lock is held across the whole claim: a concurrent
        // start for the same source observes the reservation and no-ops.
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&source_id) {
            tracing::warn!(source_id, "Scrape already active for source, ignoring start");
            return Ok(false);
        }

        tokio::fs::create_dir_all(&dest_dir).await?;

        let task_id = Uuid::new_v4().to_string();
        let history_id = db::history::insert_history(&self.db, source_id, &task_id).await?;

        let mut spec = JobSpec::for_url(url.clone(), dest_dir);
        spec.stop_after_completed = opts.stop_after_completed;
        spec.stop_after_posts = opts.stop_after_posts;

        let program = match tool {
            ExtractorTool::GalleryDl => self.tool_paths.gallery_dl.clone(),
            ExtractorTool::YtDlp => self.tool_paths.ytdlp.clone(),
        };
        let strategy: SharedStrategy =
            Arc::new(tokio::sync::Mutex::new(build_strategy(tool, program, spec)));

        let running = match self.runner.run(strategy.clone()).await {
            Ok(running) => running,
            Err(e) => {
                // The tool never started; fail the history row in place
                let message = e.to_string();
                db::history::finalize_history(
                    &self.db,
                    history_id,
                    &HistoryOutcome {
                        status: RunStatus::Failed,
                        files_downloaded: 0,
                        bytes_downloaded: 0,
                        error_count: 1,
                        skipped_count: 0,
                        posts_processed: 0,
                        average_speed: 0,
                        last_error: Some(&message),
                    },
                )
                .await?;
                return Err(e);
            }
        };

        let status = Arc::new(RwLock::new(ScrapeStatus::new(
            source_id,
            url.clone(),
            tool,
            history_id,
        )));

        jobs.insert(
            source_id,
            ActiveJob {
                status: status.clone(),
                strategy: strategy.clone(),
                handle: running.handle.clone(),
            },
        );
        drop(jobs);

        self.event_bus.emit_lossy(IngestEvent::ScrapeStarted {
            source_id,
            history_id,
            url,
            tool: tool.as_str().to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!(source_id, history_id, tool = tool.as_str(), "Scrape started");

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .supervise(source_id, history_id, status, strategy, running)
                .await;
        });

        Ok(true)
    }

    /// Stop the active job for a source: persist a `stopped` snapshot from
    /// the current counters, then kill the process tree. Returns
    /// `Ok(false)` if no job is active.
    pub async fn stop_scrape(&self, source_id: i64) -> Result<bool> {
        let job = { self.jobs.lock().await.remove(&source_id) };
        let Some(job) = job else {
            tracing::warn!(source_id, "No active scrape for source, ignoring stop");
            return Ok(false);
        };

        let (counters, files) = {
            let s = job.strategy.lock().await;
            (s.counters(), s.processed_files())
        };

        // The terminal-state transition is serialized by the status lock;
        // if the job finished on its own in the meantime, leave it be.
        let claimed = {
            let mut st = job.status.write().await;
            if st.is_finished {
                None
            } else {
                apply_counters(&mut st, &counters);
                st.is_finished = true;
                st.final_status = Some(RunStatus::Stopped);
                Some((st.history_id, st.average_speed(Utc::now())))
            }
        };
        let Some((history_id, average_speed)) = claimed else {
            tracing::warn!(source_id, "Scrape already finished, ignoring stop");
            return Ok(false);
        };

        db::history::finalize_history(
            &self.db,
            history_id,
            &HistoryOutcome {
                status: RunStatus::Stopped,
                files_downloaded: counters.downloaded_count,
                bytes_downloaded: counters.cumulative_bytes,
                error_count: counters.error_count,
                skipped_count: counters.skipped_count,
                posts_processed: counters.posts_processed,
                average_speed,
                last_error: None,
            },
        )
        .await?;

        if let Err(e) = db::history::log_downloaded_files(&self.db, source_id, &files).await {
            tracing::error!(source_id, error = %e, "Failed to log downloaded files");
        }

        job.handle.request_stop();

        self.event_bus.emit_lossy(IngestEvent::ScrapeFinished {
            source_id,
            history_id,
            status: RunStatus::Stopped.to_string(),
            files: counters.downloaded_count,
            timestamp: Utc::now(),
        });
        tracing::info!(source_id, history_id, "Scrape stopped");

        self.trigger_reconciliation();

        Ok(true)
    }

    /// Current status snapshot for a source, including the grace window
    /// after the job reaches a terminal state
    pub async fn get_status(&self, source_id: i64) -> Option<ScrapeStatus> {
        let jobs = self.jobs.lock().await;
        let status = jobs.get(&source_id)?.status.clone();
        drop(jobs);
        let snapshot = status.read().await.clone();
        Some(snapshot)
    }

    /// Number of jobs in the registry (active plus grace-window entries)
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    async fn supervise(
        self: Arc<Self>,
        source_id: i64,
        history_id: i64,
        status: Arc<RwLock<ScrapeStatus>>,
        strategy: SharedStrategy,
        running: RunningJob,
    ) {
        let mut result = running.result;
        let mut tick = tokio::time::interval(PROGRESS_MIRROR_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome: ScrapeOutcome = loop {
            tokio::select! {
                res = &mut result => {
                    break match res {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(source_id, error = %e, "Runner task failed");
                            let s = strategy.lock().await;
                            s.final_result(
                                false,
                                Some(format!("Runner task failed: {}", e)),
                                String::new(),
                            )
                        }
                    };
                }
                _ = tick.tick() => {
                    self.mirror_progress(source_id, &status, &strategy).await;
                }
            }
        };

        self.finish_job(source_id, history_id, status, outcome).await;
    }

    async fn mirror_progress(
        &self,
        source_id: i64,
        status: &Arc<RwLock<ScrapeStatus>>,
        strategy: &SharedStrategy,
    ) {
        let counters = { strategy.lock().await.counters() };

        let snapshot = {
            let mut st = status.write().await;
            if st.is_finished {
                return;
            }
            apply_counters(&mut st, &counters);
            st.clone()
        };

        self.event_bus.emit_lossy(IngestEvent::ScrapeProgress {
            source_id,
            downloaded: snapshot.downloaded_count,
            skipped: snapshot.skipped_count,
            errors: snapshot.error_count,
            total_bytes: snapshot.total_bytes,
            speed: snapshot.speed,
            rate_limited: snapshot.is_rate_limited,
            timestamp: Utc::now(),
        });
    }

    async fn finish_job(
        self: Arc<Self>,
        source_id: i64,
        history_id: i64,
        status: Arc<RwLock<ScrapeStatus>>,
        outcome: ScrapeOutcome,
    ) {
        let final_status = if outcome.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        // stop_scrape may have already claimed the terminal state
        let claimed = {
            let mut st = status.write().await;
            if st.is_finished {
                None
            } else {
                apply_counters(&mut st, &outcome.counters);
                st.is_finished = true;
                st.final_status = Some(final_status);
                Some(st.average_speed(Utc::now()))
            }
        };

        if let Some(average_speed) = claimed {
            let result = db::history::finalize_history(
                &self.db,
                history_id,
                &HistoryOutcome {
                    status: final_status,
                    files_downloaded: outcome.counters.downloaded_count,
                    bytes_downloaded: outcome.counters.cumulative_bytes,
                    error_count: outcome.counters.error_count,
                    skipped_count: outcome.counters.skipped_count,
                    posts_processed: outcome.counters.posts_processed,
                    average_speed,
                    last_error: outcome.error.as_deref(),
                },
            )
            .await;
            if let Err(e) = result {
                tracing::error!(history_id, error = %e, "Failed to finalize scrape history");
            }

            if let Err(e) =
                db::history::log_downloaded_files(&self.db, source_id, &outcome.files).await
            {
                tracing::error!(source_id, error = %e, "Failed to log downloaded files");
            }

            self.event_bus.emit_lossy(IngestEvent::ScrapeFinished {
                source_id,
                history_id,
                status: final_status.to_string(),
                files: outcome.counters.downloaded_count,
                timestamp: Utc::now(),
            });
            tracing::info!(
                source_id,
                history_id,
                status = %final_status,
                files = outcome.files.len(),
                error = ?outcome.error,
                "Scrape finished"
            );

            // Reconciliation runs even on failure to capture whatever was
            // downloaded before the tool died
            self.trigger_reconciliation();
        }

        // Grace window: status pollers can observe the terminal state
        // before the entry is evicted.
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STATUS_GRACE).await;
            manager.jobs.lock().await.remove(&source_id);
        });
    }

    fn trigger_reconciliation(&self) {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.sync_library().await {
                tracing::error!(error = %e, "Post-scrape reconciliation failed");
            }
        });
    }
}

fn apply_counters(status: &mut ScrapeStatus, counters: &StrategyCounters) {
    status.downloaded_count = counters.downloaded_count;
    status.skipped_count = counters.skipped_count;
    status.error_count = counters.error_count;
    status.posts_processed = counters.posts_processed;
    status.speed = counters.current_speed;
    status.total_bytes = counters.cumulative_bytes;
    status.is_rate_limited = counters.is_rate_limited;
}

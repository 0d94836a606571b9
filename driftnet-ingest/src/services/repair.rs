//! Repair controller
//!
//! Two-phase self-healing for a content-source family. The scan phase
//! walks the family's download tree and flags defective entities: a
//! missing metadata sidecar, or a sidecar declaring media that is absent
//! on disk. The repair phase feeds the defective entities' canonical URLs
//! back through the process runner from a temporary URL file with the
//! dedup archive bypassed, so previously-seen-but-now-missing items are
//! retried.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use driftnet_common::config::ToolPaths;
use driftnet_common::events::{EventBus, IngestEvent};

use crate::db;
use crate::db::media::MediaType;
use crate::models::job::{ExtractorTool, JobSpec, RunStatus, SourceFamily};
use crate::models::metadata::SidecarMetadata;
use crate::services::runner::{ProcessHandle, ProcessRunner};
use crate::services::strategy::build_strategy;

/// Live repair counters are flushed to the run row at this interval
const FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Repair run states. `Paused` is a sub-state of the scanning phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairState {
    Idle,
    Scanning,
    Repairing,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl RepairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairState::Idle => "idle",
            RepairState::Scanning => "scanning",
            RepairState::Repairing => "repairing",
            RepairState::Paused => "paused",
            RepairState::Completed => "completed",
            RepairState::Stopped => "stopped",
            RepairState::Failed => "failed",
        }
    }
}

/// Pollable repair status
#[derive(Debug, Clone)]
pub struct RepairStatus {
    pub state: RepairState,
    pub run_id: Option<i64>,
    pub files_checked: u64,
    pub files_repaired: u64,
    pub errors: u64,
    pub current_path: Option<String>,
    pub queued_urls: u64,
}

impl Default for RepairStatus {
    fn default() -> Self {
        Self {
            state: RepairState::Idle,
            run_id: None,
            files_checked: 0,
            files_repaired: 0,
            errors: 0,
            current_path: None,
            queued_urls: 0,
        }
    }
}

/// Result of one repair invocation
#[derive(Debug, Clone)]
pub struct RepairSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub files_checked: u64,
    pub files_repaired: u64,
    pub errors: u64,
    pub queued_urls: u64,
}

pub struct RepairController {
    db: SqlitePool,
    event_bus: EventBus,
    runner: ProcessRunner,
    tool_paths: ToolPaths,
    download_root: PathBuf,
    status: RwLock<RepairStatus>,
    abort: AtomicBool,
    pause_tx: watch::Sender<bool>,
    active: AtomicBool,
    current_handle: Mutex<Option<Arc<ProcessHandle>>>,
}

impl RepairController {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        runner: ProcessRunner,
        tool_paths: ToolPaths,
        download_root: PathBuf,
    ) -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            db,
            event_bus,
            runner,
            tool_paths,
            download_root,
            status: RwLock::new(RepairStatus::default()),
            abort: AtomicBool::new(false),
            pause_tx,
            active: AtomicBool::new(false),
            current_handle: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> RepairStatus {
        self.status.read().await.clone()
    }

    /// Pause the scan phase. The paused loop blocks on the resume signal
    /// and consumes no CPU.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Abort the run and kill the active child process tree, if any
    pub async fn stop(&self) {
        self.abort.store(true, Ordering::SeqCst);
        // Unblock a paused scan so it can observe the abort
        let _ = self.pause_tx.send(false);
        if let Some(handle) = self.current_handle.lock().await.as_ref() {
            handle.request_stop();
        }
    }

    /// Run a repair for one family. Returns `Ok(None)` (with a warning) if
    /// a repair is already running.
    pub async fn run_repair(&self, family: SourceFamily) -> Result<Option<RepairSummary>> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Repair already running, ignoring request");
            return Ok(None);
        }

        self.abort.store(false, Ordering::SeqCst);
        let _ = self.pause_tx.send(false);

        let result = self.run_inner(family).await;
        self.active.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn run_inner(&self, family: SourceFamily) -> Result<RepairSummary> {
        let run_id = db::runs::insert_repair_run(&self.db, family.as_str()).await?;
        {
            let mut st = self.status.write().await;
            *st = RepairStatus::default();
            st.run_id = Some(run_id);
        }
        self.set_state(run_id, RepairState::Scanning).await;
        tracing::info!(run_id, family = %family, "Repair run started");

        let mut checked = 0u64;
        let mut repaired = 0u64;
        let mut errors = 0u64;
        let mut queued = 0u64;

        let final_status = match self.scan_phase(family, run_id, &mut checked, &mut errors).await
        {
            Ok(Some(urls)) => {
                queued = urls.len() as u64;
                {
                    let mut st = self.status.write().await;
                    st.files_checked = checked;
                    st.queued_urls = queued;
                }
                tracing::info!(run_id, checked, queued, "Defect scan complete");

                if urls.is_empty() {
                    RunStatus::Completed
                } else {
                    self.set_state(run_id, RepairState::Repairing).await;
                    match self
                        .repair_phase(family, run_id, &urls, checked, &mut repaired, &mut errors)
                        .await
                    {
                        Ok(status) => status,
                        Err(e) => {
                            errors += 1;
                            tracing::error!(run_id, error = %e, "Repair phase failed");
                            RunStatus::Failed
                        }
                    }
                }
            }
            Ok(None) => RunStatus::Stopped,
            Err(e) => {
                errors += 1;
                tracing::error!(run_id, error = %e, "Repair scan phase failed");
                RunStatus::Failed
            }
        };

        db::runs::finalize_repair_run(&self.db, run_id, final_status, checked, repaired, errors)
            .await?;

        {
            let mut st = self.status.write().await;
            st.files_checked = checked;
            st.files_repaired = repaired;
            st.errors = errors;
            st.current_path = None;
        }
        let terminal = match final_status {
            RunStatus::Completed => RepairState::Completed,
            RunStatus::Stopped => RepairState::Stopped,
            _ => RepairState::Failed,
        };
        self.set_state(run_id, terminal).await;

        tracing::info!(
            run_id,
            status = %final_status,
            checked,
            repaired,
            errors,
            "Repair run finished"
        );

        Ok(RepairSummary {
            run_id,
            status: final_status,
            files_checked: checked,
            files_repaired: repaired,
            errors,
            queued_urls: queued,
        })
    }

    /// Scan for defective entities. Returns `Ok(None)` when aborted.
    async fn scan_phase(
        &self,
        family: SourceFamily,
        run_id: i64,
        checked: &mut u64,
        errors: &mut u64,
    ) -> Result<Option<Vec<String>>> {
        let family_root = self.download_root.join(family.as_str());
        if !family_root.is_dir() {
            tracing::info!(root = %family_root.display(), "No downloads for family, nothing to scan");
            return Ok(Some(Vec::new()));
        }

        // Per-entity directories, plus the family root for flat layouts
        let mut dirs = vec![family_root.clone()];
        for entry in std::fs::read_dir(&family_root)? {
            match entry {
                Ok(entry) if entry.path().is_dir() => dirs.push(entry.path()),
                Ok(_) => {}
                Err(e) => {
                    *errors += 1;
                    tracing::warn!(error = %e, "Error listing family root, continuing");
                }
            }
        }

        let mut queue = Vec::new();
        let mut pause_rx = self.pause_tx.subscribe();

        for dir in dirs {
            if *pause_rx.borrow() {
                self.set_state(run_id, RepairState::Paused).await;
                // Block until resumed (or the channel closes)
                let _ = pause_rx.wait_for(|paused| !*paused).await;
                self.set_state(run_id, RepairState::Scanning).await;
            }
            if self.abort.load(Ordering::SeqCst) {
                tracing::info!(run_id, "Repair aborted during scan phase");
                return Ok(None);
            }

            let dir_display = dir.to_string_lossy().into_owned();
            {
                let mut st = self.status.write().await;
                st.current_path = Some(dir_display.clone());
                st.files_checked = *checked;
            }

            if let Err(e) = scan_entity_dir(family, &dir, &mut queue, checked, errors) {
                *errors += 1;
                tracing::warn!(dir = %dir_display, error = %e, "Entity directory scan failed, continuing");
            }

            db::runs::update_repair_progress(
                &self.db,
                run_id,
                *checked,
                0,
                *errors,
                Some(&dir_display),
            )
            .await?;
        }

        Ok(Some(queue))
    }

    /// Drive the runner over the repair queue via a temporary URL file.
    /// The file is removed whatever the outcome.
    async fn repair_phase(
        &self,
        family: SourceFamily,
        run_id: i64,
        urls: &[String],
        checked: u64,
        repaired: &mut u64,
        errors: &mut u64,
    ) -> Result<RunStatus> {
        let url_file =
            std::env::temp_dir().join(format!("driftnet_repair_{}.txt", Uuid::new_v4()));
        tokio::fs::write(&url_file, format!("{}\n", urls.join("\n"))).await?;

        let outcome = self
            .drive_runner(family, run_id, &url_file, checked, repaired, errors)
            .await;

        if let Err(e) = tokio::fs::remove_file(&url_file).await {
            tracing::warn!(file = %url_file.display(), error = %e, "Failed to remove temporary URL file");
        }

        outcome
    }

    async fn drive_runner(
        &self,
        family: SourceFamily,
        run_id: i64,
        url_file: &Path,
        checked: u64,
        repaired: &mut u64,
        errors: &mut u64,
    ) -> Result<RunStatus> {
        let spec = JobSpec::for_url_file(
            url_file.to_path_buf(),
            self.download_root.join(family.as_str()),
        );
        let strategy = Arc::new(tokio::sync::Mutex::new(build_strategy(
            ExtractorTool::GalleryDl,
            self.tool_paths.gallery_dl.clone(),
            spec,
        )));

        let running = self.runner.run(strategy.clone()).await?;
        *self.current_handle.lock().await = Some(running.handle.clone());

        let mut result = running.result;
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                res = &mut result => {
                    break match res {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            let s = strategy.lock().await;
                            s.final_result(
                                false,
                                Some(format!("Runner task failed: {}", e)),
                                String::new(),
                            )
                        }
                    };
                }
                _ = flush.tick() => {
                    let counters = { strategy.lock().await.counters() };
                    {
                        let mut st = self.status.write().await;
                        st.files_repaired = counters.downloaded_count;
                    }
                    // A failed flush must not abort the run
                    if let Err(e) = db::runs::update_repair_progress(
                        &self.db,
                        run_id,
                        checked,
                        counters.downloaded_count,
                        *errors + counters.error_count,
                        None,
                    )
                    .await
                    {
                        tracing::warn!(run_id, error = %e, "Failed to flush repair progress");
                    }
                }
            }
        };

        *self.current_handle.lock().await = None;

        *repaired = outcome.counters.downloaded_count;
        *errors += outcome.counters.error_count;

        if outcome.success {
            Ok(RunStatus::Completed)
        } else if self.abort.load(Ordering::SeqCst) {
            Ok(RunStatus::Stopped)
        } else {
            *errors += 1;
            tracing::warn!(run_id, error = ?outcome.error, "Repair tool run failed");
            Ok(RunStatus::Failed)
        }
    }

    /// Defect scan only, without a run row: the repair queue that a full
    /// run would execute.
    pub async fn collect_defects(&self, family: SourceFamily) -> Result<Vec<String>> {
        let family_root = self.download_root.join(family.as_str());
        if !family_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut dirs = vec![family_root.clone()];
        for entry in std::fs::read_dir(&family_root)? {
            if let Ok(entry) = entry {
                if entry.path().is_dir() {
                    dirs.push(entry.path());
                }
            }
        }

        let mut queue = Vec::new();
        let mut checked = 0u64;
        let mut errors = 0u64;
        for dir in dirs {
            scan_entity_dir(family, &dir, &mut queue, &mut checked, &mut errors)?;
        }
        Ok(queue)
    }

    async fn set_state(&self, run_id: i64, state: RepairState) {
        {
            let mut st = self.status.write().await;
            st.state = state;
        }
        self.event_bus.emit_lossy(IngestEvent::RepairStateChanged {
            run_id,
            state: state.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Classify one directory's entities. An entity needs repair if its
/// sidecar is missing, or if the sidecar declares media that does not
/// exist on disk.
fn scan_entity_dir(
    family: SourceFamily,
    dir: &Path,
    queue: &mut Vec<String>,
    checked: &mut u64,
    errors: &mut u64,
) -> Result<()> {
    #[derive(Default)]
    struct EntityFiles {
        has_sidecar: bool,
        declared_count: Option<u64>,
        has_media: bool,
    }

    let mut entities: BTreeMap<String, EntityFiles> = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                *errors += 1;
                tracing::warn!(error = %e, "Error reading entry, continuing");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = entity_id_of(name) else {
            continue;
        };

        if name.ends_with(".json") {
            let info = entities.entry(id).or_default();
            info.has_sidecar = true;
            match std::fs::read(&path) {
                Ok(raw) => {
                    if let Ok(meta) = SidecarMetadata::parse(&raw) {
                        if let Some(count) = meta.declared_media_count() {
                            info.declared_count = Some(count);
                        }
                    }
                }
                Err(e) => {
                    *errors += 1;
                    tracing::warn!(file = %path.display(), error = %e, "Sidecar read failed");
                }
            }
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|ext| MediaType::from_extension(&ext.to_ascii_lowercase()))
            .is_some()
        {
            entities.entry(id).or_default().has_media = true;
        }
    }

    for (id, info) in entities {
        *checked += 1;
        let needs_repair =
            !info.has_sidecar || (info.declared_count.unwrap_or(0) > 0 && !info.has_media);
        if needs_repair {
            queue.push(family.entity_url(&id));
        }
    }

    Ok(())
}

/// Entity id derived from a file name: the leading digit run
fn entity_id_of(name: &str) -> Option<String> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

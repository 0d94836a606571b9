//! Library reconciliation engine
//!
//! A single cooperatively-cancellable pass that makes the relational store
//! consistent with the download tree: enumerate files, pair media to
//! sidecars, upsert media/post/user/tag rows in fixed-size transactional
//! batches, then delete orphans, but only after an uninterrupted pass.
//! Re-running over an unchanged tree writes nothing.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use driftnet_common::config::FingerprintMode;
use driftnet_common::events::{EventBus, IngestEvent};

use crate::db;
use crate::db::media::{MediaCacheEntry, MediaType, NewMediaItem};
use crate::db::runs::ScanCounters;
use crate::models::job::{RunStatus, SourceFamily};
use crate::models::metadata::SidecarMetadata;
use crate::services::avatar_fetcher::AvatarFetcher;
use crate::services::processors::{self, ProcessorContext};

/// Counters are flushed to the scan-run row every this many batches
const FLUSH_EVERY_BATCHES: usize = 4;

/// Result of one reconciliation pass
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub scan_id: i64,
    pub status: RunStatus,
    pub counters: ScanCounters,
}

/// One unit of reconciliation work
#[derive(Debug, Clone)]
struct ScanTask {
    /// Path stored as `media_items.file_path`: the media file, or the
    /// sidecar itself for standalone text tasks
    file_path: PathBuf,
    media_type: MediaType,
    sidecar: Option<PathBuf>,
}

/// A task with its sidecar read, parsed, and fingerprinted
struct ParsedTask {
    path_str: String,
    media_type: MediaType,
    metadata: Option<SidecarMetadata>,
    metadata_path: Option<String>,
    fingerprint: Option<String>,
    /// Filesystem mtime, the captured-at fallback
    captured_fallback: DateTime<Utc>,
}

enum TaskEffect {
    Added,
    Updated,
    Unchanged,
}

/// The reconciliation engine. One logical instance per process; re-entrant
/// invocation is refused via an atomic claim on `active`.
pub struct LibraryReconciler {
    db: SqlitePool,
    event_bus: EventBus,
    avatars: Arc<AvatarFetcher>,
    download_root: PathBuf,
    batch_size: usize,
    fingerprint_mode: FingerprintMode,
    active: AtomicBool,
    current_cancel: Mutex<Option<CancellationToken>>,
}

impl LibraryReconciler {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        avatars: Arc<AvatarFetcher>,
        download_root: PathBuf,
        batch_size: usize,
        fingerprint_mode: FingerprintMode,
    ) -> Self {
        Self {
            db,
            event_bus,
            avatars,
            download_root,
            batch_size: batch_size.max(1),
            fingerprint_mode,
            active: AtomicBool::new(false),
            current_cancel: Mutex::new(None),
        }
    }

    /// Whether a pass is currently running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel the active pass, if any. Takes effect at the next batch
    /// boundary.
    pub fn request_stop(&self) {
        let guard = match self.current_cancel.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(token) => token.cancel(),
            None => tracing::debug!("No active library scan to stop"),
        }
    }

    /// Run one reconciliation pass with a fresh cancellation token
    pub async fn sync_library(&self) -> Result<Option<ScanSummary>> {
        self.sync_library_with(CancellationToken::new()).await
    }

    /// Run one reconciliation pass.
    ///
    /// Returns `Ok(None)` (with a warning) if a pass is already running:
    /// the claim is an atomic compare-and-swap, so concurrent callers
    /// cannot both win.
    pub async fn sync_library_with(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<ScanSummary>> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Library scan already running, ignoring request");
            return Ok(None);
        }

        {
            let mut guard = match self.current_cancel.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(cancel.clone());
        }

        let result = self.run_scan(cancel).await;

        {
            let mut guard = match self.current_cancel.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = None;
        }
        self.active.store(false, Ordering::SeqCst);

        result.map(Some)
    }

    async fn run_scan(&self, cancel: CancellationToken) -> Result<ScanSummary> {
        let scan_id = db::runs::insert_scan_run(&self.db).await?;
        self.event_bus.emit_lossy(IngestEvent::ScanStarted {
            scan_id,
            timestamp: Utc::now(),
        });
        tracing::info!(scan_id, root = %self.download_root.display(), "Library scan started");

        let mut counters = ScanCounters::default();
        let outcome = self.scan_inner(scan_id, &cancel, &mut counters).await;

        let status = match &outcome {
            Ok(true) => RunStatus::Completed,
            Ok(false) => RunStatus::Stopped,
            Err(e) => {
                counters.errors += 1;
                tracing::error!(scan_id, error = %e, "Library scan failed");
                RunStatus::Failed
            }
        };

        db::runs::finalize_scan_run(&self.db, scan_id, status, &counters).await?;
        self.event_bus.emit_lossy(IngestEvent::ScanFinished {
            scan_id,
            status: status.to_string(),
            deleted: counters.files_deleted,
            timestamp: Utc::now(),
        });

        tracing::info!(
            scan_id,
            status = %status,
            processed = counters.files_processed,
            added = counters.files_added,
            updated = counters.files_updated,
            deleted = counters.files_deleted,
            errors = counters.errors,
            "Library scan finished"
        );

        Ok(ScanSummary {
            scan_id,
            status,
            counters,
        })
    }

    /// Returns `Ok(true)` if the pass ran to completion, `Ok(false)` if it
    /// was stopped at a batch boundary.
    async fn scan_inner(
        &self,
        scan_id: i64,
        cancel: &CancellationToken,
        counters: &mut ScanCounters,
    ) -> Result<bool> {
        let tasks = self.collect_tasks();
        tracing::info!(scan_id, tasks = tasks.len(), "Reconciliation task list built");

        // Up-front caches: every per-item lookup below is O(1) instead of a
        // store round-trip, which is what keeps tens of thousands of files
        // tractable.
        let media_cache = db::media::load_media_cache(&self.db).await?;
        let provenance = db::history::load_provenance_map(&self.db).await?;
        let mut ctx = ProcessorContext {
            existing_posts: db::posts::load_existing_post_keys(&self.db).await?,
            tags: db::tags::load_tag_map(&self.db).await?,
            known_twitter_users: db::users::load_user_ids(&self.db, SourceFamily::Twitter).await?,
            known_pixiv_users: db::users::load_user_ids(&self.db, SourceFamily::Pixiv).await?,
            avatars: HashMap::new(),
        };

        let mut attempted_avatars: HashSet<String> = HashSet::new();
        let mut processed_paths: HashSet<String> = HashSet::with_capacity(tasks.len());
        let mut completed = true;

        for (batch_index, batch) in tasks.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(scan_id, batch = batch_index, "Scan stop requested, aborting");
                completed = false;
                break;
            }

            // Sidecar reads and stat happen outside the transaction
            let mut parsed = Vec::with_capacity(batch.len());
            for task in batch {
                parsed.push(self.prepare_task(task, counters));
            }

            self.resolve_batch_avatars(&parsed, &mut attempted_avatars, &mut ctx)
                .await;

            let mut tx = self.db.begin().await?;
            for task in &parsed {
                processed_paths.insert(task.path_str.clone());
                match self
                    .process_task(&mut tx, task, &media_cache, &provenance, &mut ctx)
                    .await
                {
                    Ok(TaskEffect::Added) => counters.files_added += 1,
                    Ok(TaskEffect::Updated) => counters.files_updated += 1,
                    Ok(TaskEffect::Unchanged) => {}
                    Err(e) => {
                        counters.errors += 1;
                        tracing::warn!(
                            scan_id,
                            file = %task.path_str,
                            error = %e,
                            "Reconciliation task failed, continuing batch"
                        );
                    }
                }
                counters.files_processed += 1;
            }
            tx.commit().await?;

            self.event_bus.emit_lossy(IngestEvent::ScanProgress {
                scan_id,
                processed: counters.files_processed,
                added: counters.files_added,
                updated: counters.files_updated,
                errors: counters.errors,
                timestamp: Utc::now(),
            });

            if (batch_index + 1) % FLUSH_EVERY_BATCHES == 0 {
                db::runs::update_scan_counters(&self.db, scan_id, counters).await?;
            }
        }

        // Orphan deletion only after an uninterrupted pass: a stopped scan
        // has not seen every file and must not treat the unseen as deleted.
        if completed {
            let orphaned: Vec<String> = media_cache
                .keys()
                .filter(|path| !processed_paths.contains(*path))
                .cloned()
                .collect();
            if !orphaned.is_empty() {
                let deleted = db::media::delete_media_by_paths(&self.db, &orphaned).await?;
                counters.files_deleted += deleted;
                tracing::info!(scan_id, deleted, "Orphaned media items removed");
            }
        }

        Ok(completed)
    }

    /// Walk the download root and build the flat task list, grouped and
    /// paired per directory.
    fn collect_tasks(&self) -> Vec<ScanTask> {
        if !self.download_root.is_dir() {
            tracing::warn!(
                root = %self.download_root.display(),
                "Download root missing, nothing to reconcile"
            );
            return Vec::new();
        }

        let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();

        let walker = WalkDir::new(&self.download_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                // Skip hidden directories and files
                entry.depth() == 0
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| name.starts_with('.'))
            });

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    let path = entry.path().to_path_buf();
                    let parent = path
                        .parent()
                        .unwrap_or(&self.download_root)
                        .to_path_buf();
                    by_dir.entry(parent).or_default().push(path);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Error accessing entry, continuing scan");
                }
            }
        }

        let mut tasks = Vec::new();
        for files in by_dir.values() {
            pair_directory(files, &mut tasks);
        }
        tasks
    }

    fn prepare_task(&self, task: &ScanTask, counters: &mut ScanCounters) -> ParsedTask {
        let path_str = task.file_path.to_string_lossy().into_owned();

        let captured_fallback = std::fs::metadata(&task.file_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let (metadata, fingerprint, metadata_path) = match &task.sidecar {
            Some(sidecar) => match std::fs::read(sidecar) {
                Ok(raw) => {
                    let fingerprint = metadata_fingerprint(self.fingerprint_mode, &raw);
                    let metadata_path = sidecar.to_string_lossy().into_owned();
                    match SidecarMetadata::parse(&raw) {
                        Ok(meta) => (Some(meta), Some(fingerprint), Some(metadata_path)),
                        Err(e) => {
                            counters.errors += 1;
                            tracing::warn!(
                                file = %sidecar.display(),
                                error = %e,
                                "Sidecar parse failed, treating file as metadata-less"
                            );
                            (None, Some(fingerprint), Some(metadata_path))
                        }
                    }
                }
                Err(e) => {
                    counters.errors += 1;
                    tracing::warn!(
                        file = %sidecar.display(),
                        error = %e,
                        "Sidecar read failed, treating file as metadata-less"
                    );
                    (None, None, None)
                }
            },
            None => (None, None, None),
        };

        ParsedTask {
            path_str,
            media_type: task.media_type,
            metadata,
            metadata_path,
            fingerprint,
            captured_fallback,
        }
    }

    /// Download avatars referenced by this batch's users, once per
    /// (platform, user). Failures leave the user without a local avatar.
    async fn resolve_batch_avatars(
        &self,
        parsed: &[ParsedTask],
        attempted: &mut HashSet<String>,
        ctx: &mut ProcessorContext,
    ) {
        for task in parsed {
            let Some(meta) = &task.metadata else { continue };
            let Some(user) = meta.user_ref() else { continue };
            let Some(url) = user.avatar_url.as_deref() else { continue };

            let key = format!("{}:{}", user.family.as_str(), user.id);
            if ctx.avatars.contains_key(&key) || !attempted.insert(key.clone()) {
                continue;
            }

            if let Some(path) = self.avatars.resolve(user.family, &user.id, url).await {
                ctx.avatars.insert(key, path);
            }
        }
    }

    async fn process_task(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task: &ParsedTask,
        media_cache: &HashMap<String, MediaCacheEntry>,
        provenance: &HashMap<String, i64>,
        ctx: &mut ProcessorContext,
    ) -> Result<TaskEffect> {
        let source_id = provenance.get(&task.path_str).copied();

        let existing = media_cache.get(&task.path_str);
        if let Some(entry) = existing {
            if entry.fingerprint == task.fingerprint {
                return Ok(TaskEffect::Unchanged);
            }
        }

        let post_id = match (&task.metadata, &task.metadata_path) {
            (Some(meta), Some(metadata_path)) => {
                processors::process_metadata(&mut *tx, meta, metadata_path, source_id, ctx).await?
            }
            _ => None,
        };

        let captured_at = task
            .metadata
            .as_ref()
            .and_then(|m| m.captured_at())
            .unwrap_or(task.captured_fallback);

        match existing {
            None => {
                db::media::insert_media_item(
                    &mut *tx,
                    &NewMediaItem {
                        file_path: &task.path_str,
                        media_type: task.media_type,
                        captured_at,
                        post_id,
                        fingerprint: task.fingerprint.as_deref(),
                    },
                )
                .await?;
                Ok(TaskEffect::Added)
            }
            Some(entry) => {
                db::media::update_media_item(
                    &mut *tx,
                    entry.id,
                    captured_at,
                    post_id,
                    task.fingerprint.as_deref(),
                )
                .await?;
                Ok(TaskEffect::Updated)
            }
        }
    }
}

/// Classify one directory's files and pair media to sidecars
fn pair_directory(files: &[PathBuf], tasks: &mut Vec<ScanTask>) {
    let mut sidecars: Vec<(&PathBuf, String)> = Vec::new();
    let mut media: Vec<(&PathBuf, MediaType)> = Vec::new();

    for path in files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(stem) = name.strip_suffix(".json") {
            sidecars.push((path, stem.to_string()));
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if let Some(media_type) = MediaType::from_extension(&ext.to_ascii_lowercase()) {
                media.push((path, media_type));
            }
        }
    }

    let mut claimed = vec![false; sidecars.len()];

    for (path, media_type) in &media {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let best = best_sidecar(name, &sidecars);
        if let Some(index) = best {
            claimed[index] = true;
        }
        tasks.push(ScanTask {
            file_path: (*path).clone(),
            media_type: *media_type,
            sidecar: best.map(|index| sidecars[index].0.clone()),
        });
    }

    // Unmatched sidecars stay visible and taggable as standalone text tasks
    for (index, (path, _)) in sidecars.iter().enumerate() {
        if !claimed[index] {
            tasks.push(ScanTask {
                file_path: (*path).clone(),
                media_type: MediaType::Text,
                sidecar: Some((*path).clone()),
            });
        }
    }
}

/// Pick the sidecar whose stem is the longest prefix of the media file
/// name, where the character after the shared prefix must be `-`, `_`, or
/// `.` (or the names match exactly). This is what keeps `12_0.jpg` from
/// pairing with `1.json` when `12.json` exists.
fn best_sidecar(media_name: &str, sidecars: &[(&PathBuf, String)]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None; // (stem length, index)

    for (index, (_, stem)) in sidecars.iter().enumerate() {
        let matched = media_name == stem.as_str()
            || (media_name.starts_with(stem.as_str())
                && matches!(
                    media_name.as_bytes().get(stem.len()),
                    Some(b'-') | Some(b'_') | Some(b'.')
                ));

        if matched {
            match best {
                Some((length, _)) if length >= stem.len() => {}
                _ => best = Some((stem.len(), index)),
            }
        }
    }

    best.map(|(_, index)| index)
}

/// Sidecar change fingerprint. `Digest` is the default; `LengthOnly` is
/// the legacy mode kept for compatibility with older libraries.
fn metadata_fingerprint(mode: FingerprintMode, raw: &[u8]) -> String {
    match mode {
        FingerprintMode::Digest => format!("{:x}", Sha256::digest(raw)),
        FingerprintMode::LengthOnly => raw.len().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/lib/{}", n))).collect()
    }

    #[test]
    fn prefix_matching_prefers_longest_boundary_match() {
        let files = paths(&["42.json", "42_0.jpg", "42_1.jpg", "420.json", "420_0.jpg"]);
        let mut tasks = Vec::new();
        pair_directory(&files, &mut tasks);

        let sidecar_of = |name: &str| -> Option<String> {
            tasks
                .iter()
                .find(|t| t.file_path.ends_with(name))
                .and_then(|t| t.sidecar.as_ref())
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        };

        assert_eq!(sidecar_of("42_0.jpg").as_deref(), Some("42.json"));
        assert_eq!(sidecar_of("42_1.jpg").as_deref(), Some("42.json"));
        assert_eq!(sidecar_of("420_0.jpg").as_deref(), Some("420.json"));
        // Both sidecars were claimed, so no text tasks appear
        assert_eq!(tasks.len(), 3);
    }

    #[test]
    fn full_name_sidecars_match_exactly() {
        let files = paths(&["photo.jpg", "photo.jpg.json", "photo.json"]);
        let mut tasks = Vec::new();
        pair_directory(&files, &mut tasks);

        let media = tasks
            .iter()
            .find(|t| t.media_type == MediaType::Image)
            .unwrap();
        // The longer stem (full file name) wins over the bare stem
        assert!(media.sidecar.as_ref().unwrap().ends_with("photo.jpg.json"));
        // The losing sidecar becomes a standalone text task
        assert!(tasks
            .iter()
            .any(|t| t.media_type == MediaType::Text && t.file_path.ends_with("photo.json")));
    }

    #[test]
    fn boundary_character_is_required() {
        let files = paths(&["1.json", "12_0.jpg"]);
        let mut tasks = Vec::new();
        pair_directory(&files, &mut tasks);

        let media = tasks
            .iter()
            .find(|t| t.media_type == MediaType::Image)
            .unwrap();
        // `12_0` starts with `1` but the next character is `2`, not a boundary
        assert!(media.sidecar.is_none());
    }

    #[test]
    fn unmatched_sidecar_becomes_text_task() {
        let files = paths(&["99.json"]);
        let mut tasks = Vec::new();
        pair_directory(&files, &mut tasks);

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].media_type, MediaType::Text);
        assert_eq!(tasks[0].sidecar.as_deref(), Some(Path::new("/lib/99.json")));
    }

    #[test]
    fn unknown_extensions_are_ignored() {
        let files = paths(&["archive.sqlite3", "notes.txt", "a.jpg"]);
        let mut tasks = Vec::new();
        pair_directory(&files, &mut tasks);

        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].file_path.ends_with("a.jpg"));
    }

    #[test]
    fn fingerprint_modes_differ() {
        let raw = br#"{"category":"pixiv","id":1}"#;
        let digest = metadata_fingerprint(FingerprintMode::Digest, raw);
        let length = metadata_fingerprint(FingerprintMode::LengthOnly, raw);

        assert_eq!(length, raw.len().to_string());
        assert_eq!(digest.len(), 64);
        assert_ne!(digest, length);

        // Equal-length edits are invisible to the legacy mode, visible to
        // the digest
        let edited = br#"{"category":"pixiv","id":2}"#;
        assert_eq!(
            metadata_fingerprint(FingerprintMode::LengthOnly, edited),
            length
        );
        assert_ne!(metadata_fingerprint(FingerprintMode::Digest, edited), digest);
    }
}

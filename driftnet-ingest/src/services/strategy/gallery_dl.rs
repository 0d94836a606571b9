//! Tool A strategy: generic content extractor (gallery-dl)
//!
//! Line grammar:
//! - `[progress] <fileBytes>|<speed>|<totalBytes>`: transfer progress
//! - `[start]`: ignored
//! - `[success] <path>`: completed download
//! - `[skip] <path>`: already-archived item
//! - `[post-complete]`: one post fully processed
//! - `[error]` / `[download][error]`: counted errors
//! - `API rate limit exceeded` / `rate limit` substrings: rate-limit flag
//! - any other line containing the destination root is an implicit success
//!   path (the tool prints bare paths in some configurations)

use std::path::PathBuf;

use driftnet_common::bytesize;

use super::{ProcessStrategy, ProcessedFiles, StrategyCounters};
use crate::models::job::{JobSpec, JobTarget};
use crate::services::runner::ProcessHandle;

pub struct GalleryDlStrategy {
    program: String,
    spec: JobSpec,
    dest_root: String,
    counters: StrategyCounters,
    files: ProcessedFiles,
}

impl GalleryDlStrategy {
    pub fn new(program: String, spec: JobSpec) -> Self {
        let dest_root = spec.dest_dir.to_string_lossy().into_owned();
        Self {
            program,
            spec,
            dest_root,
            counters: StrategyCounters::default(),
            files: ProcessedFiles::default(),
        }
    }

    fn register_download(&mut self, path: &str, handle: &ProcessHandle) {
        if self.files.insert(PathBuf::from(path.trim())) {
            self.counters.downloaded_count += 1;
            if let Some(limit) = self.spec.stop_after_completed {
                if self.counters.downloaded_count >= limit {
                    tracing::debug!(limit, "download limit reached, requesting termination");
                    handle.request_stop();
                }
            }
        }
    }

    fn register_skip(&mut self, path: &str) {
        if self.files.insert(PathBuf::from(path.trim())) {
            self.counters.skipped_count += 1;
        }
    }
}

impl ProcessStrategy for GalleryDlStrategy {
    fn program(&self) -> &str {
        &self.program
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--dest".to_string(),
            self.dest_root.clone(),
            "--write-metadata".to_string(),
        ];

        if !self.spec.bypass_archive {
            args.push("--download-archive".to_string());
            args.push(
                self.spec
                    .dest_dir
                    .join("archive.sqlite3")
                    .to_string_lossy()
                    .into_owned(),
            );
        }

        match &self.spec.target {
            JobTarget::Url(url) => args.push(url.clone()),
            JobTarget::UrlFile(path) => {
                args.push("--input-file".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
        }

        args
    }

    fn parse_line(&mut self, line: &str, handle: &ProcessHandle) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if let Some(rest) = line.strip_prefix("[progress] ") {
            let mut parts = rest.splitn(3, '|');
            if let Some(v) = parts.next().and_then(|s| bytesize::parse_size(s)) {
                self.counters.current_file_bytes = v;
            }
            if let Some(v) = parts.next().and_then(|s| bytesize::parse_speed(s)) {
                self.counters.current_speed = v;
            }
            if let Some(v) = parts.next().and_then(|s| bytesize::parse_size(s)) {
                self.counters.cumulative_bytes = v;
            }
            return;
        }

        if line == "[start]" || line.starts_with("[start] ") {
            return;
        }

        if let Some(path) = line.strip_prefix("[success] ") {
            self.register_download(path, handle);
            return;
        }

        if let Some(path) = line.strip_prefix("[skip] ") {
            self.register_skip(path);
            return;
        }

        if line.starts_with("[post-complete]") {
            self.counters.posts_processed += 1;
            if let Some(limit) = self.spec.stop_after_posts {
                if self.counters.posts_processed >= limit {
                    tracing::debug!(limit, "post limit reached, requesting termination");
                    handle.request_stop();
                }
            }
            return;
        }

        if line.starts_with("[error]") || line.starts_with("[download][error]") {
            self.counters.error_count += 1;
            return;
        }

        if line.contains("API rate limit exceeded") || line.contains("rate limit") {
            self.counters.is_rate_limited = true;
            return;
        }

        // Bare line containing the destination root: implicit success path
        if line.contains(self.dest_root.as_str()) {
            self.register_download(line, handle);
        }
    }

    fn is_noise(&self, line: &str) -> bool {
        let line = line.trim_start();
        line.starts_with("[progress]") || line.starts_with("[start]")
    }

    fn counters(&self) -> StrategyCounters {
        self.counters
    }

    fn processed_files(&self) -> Vec<PathBuf> {
        self.files.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn strategy() -> GalleryDlStrategy {
        GalleryDlStrategy::new(
            "gallery-dl".to_string(),
            JobSpec::for_url("https://example.com/feed", PathBuf::from("/root/a")),
        )
    }

    #[test]
    fn success_then_skip_scenario() {
        let mut s = strategy();
        let handle = ProcessHandle::detached();

        s.parse_line("[success] /root/a/1.jpg", &handle);
        s.parse_line("[skip] /root/a/2.jpg", &handle);

        let c = s.counters();
        assert_eq!(c.downloaded_count, 1);
        assert_eq!(c.skipped_count, 1);
        assert_eq!(
            s.processed_files(),
            vec![PathBuf::from("/root/a/1.jpg"), PathBuf::from("/root/a/2.jpg")]
        );
    }

    #[test]
    fn duplicate_announcements_count_once() {
        let mut s = strategy();
        let handle = ProcessHandle::detached();

        s.parse_line("[success] /root/a/1.jpg", &handle);
        s.parse_line("[success] /root/a/1.jpg", &handle);

        assert_eq!(s.counters().downloaded_count, 1);
        assert_eq!(s.processed_files().len(), 1);
    }

    #[test]
    fn bare_destination_line_is_implicit_success() {
        let mut s = strategy();
        let handle = ProcessHandle::detached();

        s.parse_line("/root/a/sub/3.png", &handle);
        s.parse_line("/elsewhere/4.png", &handle);

        assert_eq!(s.counters().downloaded_count, 1);
        assert_eq!(s.processed_files(), vec![PathBuf::from("/root/a/sub/3.png")]);
    }

    #[test]
    fn progress_line_updates_counters_and_is_noise() {
        let mut s = strategy();
        let handle = ProcessHandle::detached();

        s.parse_line("[progress] 1.00 MiB|500KiB/s|14.31MiB", &handle);

        let c = s.counters();
        assert_eq!(c.current_file_bytes, 1 << 20);
        assert_eq!(c.current_speed, 512_000);
        assert_eq!(c.cumulative_bytes, 15_005_123);
        assert!(s.is_noise("[progress] 1b|1b/s|1b"));
        assert!(!s.is_noise("[success] /root/a/x.jpg"));
    }

    #[test]
    fn error_and_rate_limit_detection() {
        let mut s = strategy();
        let handle = ProcessHandle::detached();

        s.parse_line("[error] failed to fetch post", &handle);
        s.parse_line("[download][error] connection reset", &handle);
        s.parse_line("twitter: API rate limit exceeded, waiting", &handle);

        let c = s.counters();
        assert_eq!(c.error_count, 2);
        assert!(c.is_rate_limited);
    }

    #[test]
    fn error_line_containing_destination_is_not_a_path() {
        let mut s = strategy();
        let handle = ProcessHandle::detached();

        s.parse_line("[error] cannot write /root/a/5.jpg", &handle);

        assert_eq!(s.counters().error_count, 1);
        assert!(s.processed_files().is_empty());
    }

    #[test]
    fn post_complete_counts_posts() {
        let mut s = strategy();
        let handle = ProcessHandle::detached();

        s.parse_line("[post-complete]", &handle);
        s.parse_line("[post-complete]", &handle);

        assert_eq!(s.counters().posts_processed, 2);
    }

    #[test]
    fn download_limit_requests_termination() {
        let mut s = GalleryDlStrategy::new("gallery-dl".to_string(), {
            let mut spec =
                JobSpec::for_url("https://example.com/feed", PathBuf::from("/root/a"));
            spec.stop_after_completed = Some(2);
            spec
        });
        let handle = ProcessHandle::detached();

        s.parse_line("[success] /root/a/1.jpg", &handle);
        assert!(!handle.stop_requested());
        s.parse_line("[success] /root/a/2.jpg", &handle);
        assert!(handle.stop_requested());
    }

    #[test]
    fn argv_is_deterministic_and_shell_free() {
        let s = strategy();
        let args = s.build_args();
        assert_eq!(
            args,
            vec![
                "--dest",
                "/root/a",
                "--write-metadata",
                "--download-archive",
                "/root/a/archive.sqlite3",
                "https://example.com/feed",
            ]
        );
    }

    #[test]
    fn url_file_mode_bypasses_archive() {
        let s = GalleryDlStrategy::new(
            "gallery-dl".to_string(),
            JobSpec::for_url_file(PathBuf::from("/tmp/urls.txt"), PathBuf::from("/root/a")),
        );
        let args = s.build_args();
        assert!(!args.iter().any(|a| a == "--download-archive"));
        assert!(args.contains(&"--input-file".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/urls.txt"));
        assert!(Path::new(&args[1]).is_absolute());
    }
}
